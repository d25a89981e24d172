//! Deterministic log and checkpoint locations.

use crate::config::RunConfig;
use std::path::{Path, PathBuf};

/// Files belonging to one repetition.
///
/// Two runs with the same model, dataset, class split, prefix, seed and
/// backbone resolve to the same paths and overwrite each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    dir: PathBuf,
    stem: String,
}

impl RunPaths {
    pub fn new(config: &RunConfig, seed: u64) -> Self {
        let dir = config
            .output
            .log_dir
            .join(&config.model_name)
            .join(&config.dataset)
            .join(config.path_init_cls().to_string())
            .join(config.increment.to_string());
        let stem = format!("{}_{}_{}", config.prefix, seed, config.convnet_type);
        Self { dir, stem }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn log_file(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    pub fn metrics_file(&self) -> PathBuf {
        self.dir.join(format!("{}.metrics.jsonl", self.stem))
    }

    /// Translated parameter map exported after `task`.
    pub fn checkpoint_file(&self, task: usize) -> PathBuf {
        self.dir.join(format!("{}_task{}.params.json", self.stem, task))
    }

    /// Native model record; the recorder appends its own extension.
    pub fn model_record(&self, task: usize) -> PathBuf {
        self.dir.join(format!("{}_task{}", self.stem, task))
    }
}
