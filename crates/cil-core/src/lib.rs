//! Core types and utilities for class-incremental learning experiments.
//!
//! This crate provides the error type, the immutable run configuration,
//! device resolution, accuracy metrics, run-path derivation and logging
//! setup used across the workspace.

pub mod error;
pub mod types;
pub mod config;
pub mod device;
pub mod metrics;
pub mod paths;
pub mod logging;
pub mod cli;

pub use error::{Error, Result};
pub use types::*;
pub use config::*;
pub use device::*;
pub use metrics::*;
pub use paths::RunPaths;
pub use logging::{init_logging, log_config, LogFileSink};
pub use cli::load_config_file;
