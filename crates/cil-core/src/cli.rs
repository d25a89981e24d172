//! Shared CLI helpers for workspace tools.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;

use crate::{Error, Result};

/// Load a configuration file, as JSON when the extension is `.json` and TOML otherwise.
pub fn load_config_file<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config {}: {e}", path.display())))?;

    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config {}: {e}", path.display())))
    } else {
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RunConfig;

    #[test]
    fn test_load_json_experiment_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icarl.json");
        fs::write(
            &path,
            r#"{
                "prefix": "reproduce",
                "dataset": "synthetic",
                "model_name": "icarl",
                "convnet_type": "mlp",
                "init_cls": 2,
                "increment": 2,
                "seed": [1993],
                "device": [0],
                "shuffle": true
            }"#,
        )
        .unwrap();

        let config: RunConfig = load_config_file(&path).unwrap();
        assert_eq!(config.model_name, "icarl");
        assert_eq!(config.device, vec![0]);
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            "dataset = \"synthetic\"\nmodel_name = \"ewc\"\ninit_cls = 3\nincrement = 1\n",
        )
        .unwrap();

        let config: RunConfig = load_config_file(&path).unwrap();
        assert_eq!(config.init_cls, 3);
        assert_eq!(config.seed, vec![1993]);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result: Result<RunConfig> = load_config_file(Path::new("/nonexistent/run.toml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_shipped_configs_are_valid() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs");
        for name in ["icarl_synthetic.toml", "ewc_images.toml", "lwf_synthetic.json"] {
            let config: RunConfig = load_config_file(&dir.join(name)).unwrap();
            config.validate().unwrap();
        }
    }
}
