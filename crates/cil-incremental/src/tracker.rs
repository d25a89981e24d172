//! External metric tracking.
//!
//! The driver pushes one flat metric map per task. Trackers are best effort:
//! the driver logs their errors and keeps training.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use cil_core::{Error, Result};
use serde::Serialize;

/// Sink for per-task metrics of one repetition.
pub trait Tracker {
    fn start_run(&mut self, project: Option<&str>, run_name: &str) -> Result<()>;

    fn log_metrics(&mut self, task: usize, metrics: &BTreeMap<String, f64>) -> Result<()>;

    fn finish(&mut self) -> Result<()>;
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl Tracker for NoopTracker {
    fn start_run(&mut self, _project: Option<&str>, _run_name: &str) -> Result<()> {
        Ok(())
    }

    fn log_metrics(&mut self, _task: usize, _metrics: &BTreeMap<String, f64>) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct MetricsLine<'a> {
    timestamp: String,
    project: Option<&'a str>,
    run: &'a str,
    task: usize,
    metrics: &'a BTreeMap<String, f64>,
}

/// Appends one JSON object per task to a file.
#[derive(Debug)]
pub struct JsonlTracker {
    path: PathBuf,
    project: Option<String>,
    run_name: String,
    writer: Option<BufWriter<File>>,
}

impl JsonlTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            project: None,
            run_name: String::new(),
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Tracker for JsonlTracker {
    /// Starts a fresh file; a previous run with the same name is overwritten.
    fn start_run(&mut self, project: Option<&str>, run_name: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| Error::Tracking(format!("cannot open {:?}: {}", self.path, e)))?;
        self.writer = Some(BufWriter::new(file));
        self.project = project.map(str::to_string);
        self.run_name = run_name.to_string();
        Ok(())
    }

    fn log_metrics(&mut self, task: usize, metrics: &BTreeMap<String, f64>) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Tracking("log_metrics called before start_run".to_string()))?;
        let line = MetricsLine {
            timestamp: chrono::Utc::now().to_rfc3339(),
            project: self.project.as_deref(),
            run: &self.run_name,
            task,
            metrics,
        };
        serde_json::to_writer(&mut *writer, &line)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}
