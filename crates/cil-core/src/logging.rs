//! Logging setup: console output plus a per-repetition log file.
//!
//! The file layer writes through a [`LogFileSink`] that the experiment driver
//! points at a new file at the start of every repetition, so each seed's log
//! stays isolated while a single global subscriber is installed.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::info;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::RunConfig;
use crate::{Error, Result};

/// Switchable destination for the file logging layer.
#[derive(Clone, Default)]
pub struct LogFileSink {
    file: Arc<Mutex<Option<File>>>,
}

impl LogFileSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redirect subsequent records to `path`, truncating it.
    pub fn switch_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut guard = self
            .file
            .lock()
            .map_err(|_| Error::InvalidArgument("log sink lock poisoned".to_string()))?;
        *guard = Some(file);
        Ok(())
    }

    /// Stop writing to any file.
    pub fn close(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = file.flush();
            }
            *guard = None;
        }
    }
}

/// Writer handed out per log record.
pub struct LogFileWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(file) => file.write(buf),
                None => Ok(buf.len()),
            },
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(file) => file.flush(),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogFileSink {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter {
            file: Arc::clone(&self.file),
        }
    }
}

/// Install the global subscriber. Returns the sink driving the file layer.
pub fn init_logging(verbose: bool) -> Result<LogFileSink> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let sink = LogFileSink::new();
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(sink.clone()),
        )
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logger: {e}")))?;

    Ok(sink)
}

/// Log every configuration field as `key: value`.
pub fn log_config(config: &RunConfig) -> Result<()> {
    let value = serde_json::to_value(config)?;
    if let serde_json::Value::Object(map) = value {
        for (key, value) in map {
            info!("{}: {}", key, value);
        }
    }
    Ok(())
}
