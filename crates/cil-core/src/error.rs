//! Error types shared by every crate of the experiment workspace.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An image under the dataset root could not be decoded
    #[error("Image processing error: {0}")]
    Image(String),

    /// Invalid run configuration or task-partition parameters; raised before
    /// any training starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// The compute device failed while allocating or executing
    #[error("Device error: {0}")]
    Device(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Training error: {0}")]
    Training(String),

    /// Trainer lifecycle violated, e.g. evaluating before a task is learned
    #[error("Incremental learning error: {0}")]
    IncrementalLearning(String),

    /// Metric tracking failed; callers log it and carry on
    #[error("Tracking error: {0}")]
    Tracking(String),

    /// Checkpoint or metrics (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether this error must abort the current repetition.
    pub fn is_device_failure(&self) -> bool {
        matches!(self, Error::Device(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// A malformed TOML run file is a configuration problem.
impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Image(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_error_message() {
        let err = Error::Config("init_cls 12 exceeds 10 classes".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: init_cls 12 exceeds 10 classes"
        );
    }

    #[test]
    fn test_missing_log_dir_is_io_error() {
        let err: Error = std::fs::File::open("/nonexistent/logs/run.log")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_toml_error_is_config_error() {
        let parsed: std::result::Result<toml::Value, _> = toml::from_str("init_cls = [");
        let err: Error = parsed.unwrap_err().into();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bad_metrics_json_is_serialization_error() {
        let parsed: std::result::Result<serde_json::Value, _> = serde_json::from_str("{\"task\":");
        let err: Error = parsed.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_device_failure_classification() {
        assert!(Error::Device("out of memory".into()).is_device_failure());
        assert!(!Error::Training("empty task".into()).is_device_failure());
    }
}
