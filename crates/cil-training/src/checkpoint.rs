//! Checkpoint export.
//!
//! This module provides:
//! - A declarative parameter-name translation table
//! - Export of the network's tensors as a JSON parameter map in the naming
//!   and layout of a conventional backbone
//! - Native model records through burn's `CompactRecorder`

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use burn::{
    module::Module,
    record::CompactRecorder,
    tensor::backend::Backend,
};
use cil_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::{IncrementalNet, ParamTensor, TensorRole};

/// One renaming rule, matched on whole dot-separated segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranslationRule {
    /// Remove a leading path (`convnet.` in `convnet.layer1.conv.weight`)
    StripPrefix(String),
    /// Replace a segment sequence anywhere in the name (`conv1.0` -> `conv1`)
    Replace { from: String, to: String },
}

impl TranslationRule {
    pub fn strip_prefix(prefix: &str) -> Self {
        TranslationRule::StripPrefix(prefix.trim_end_matches('.').to_string())
    }

    pub fn replace(from: &str, to: &str) -> Self {
        TranslationRule::Replace {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    fn apply(&self, segments: Vec<String>) -> Vec<String> {
        match self {
            TranslationRule::StripPrefix(prefix) => {
                let prefix: Vec<&str> = prefix.split('.').collect();
                if segments.len() > prefix.len()
                    && segments.iter().zip(&prefix).all(|(s, p)| s == p)
                {
                    segments[prefix.len()..].to_vec()
                } else {
                    segments
                }
            }
            TranslationRule::Replace { from, to } => {
                let from: Vec<&str> = from.split('.').collect();
                let to: Vec<String> = to.split('.').map(str::to_string).collect();
                let mut out = Vec::with_capacity(segments.len());
                let mut i = 0;
                while i < segments.len() {
                    let matches = i + from.len() <= segments.len()
                        && segments[i..i + from.len()].iter().zip(&from).all(|(s, f)| s == f);
                    if matches {
                        out.extend(to.iter().cloned());
                        i += from.len();
                    } else {
                        out.push(segments[i].clone());
                        i += 1;
                    }
                }
                out
            }
        }
    }
}

/// Ordered rules applied as one pass over every parameter name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamNameTranslator {
    rules: Vec<TranslationRule>,
}

impl ParamNameTranslator {
    pub fn new(rules: Vec<TranslationRule>) -> Self {
        Self { rules }
    }

    /// Feature-extractor prefix removed, stem sub-indices mapped to separate
    /// convolution and normalization names.
    pub fn standard_backbone() -> Self {
        Self::new(vec![
            TranslationRule::strip_prefix("convnet"),
            TranslationRule::replace("conv1.0", "conv1"),
            TranslationRule::replace("conv1.1", "bn1"),
        ])
    }

    pub fn rules(&self) -> &[TranslationRule] {
        &self.rules
    }

    pub fn translate(&self, name: &str) -> String {
        let segments: Vec<String> = name.split('.').map(str::to_string).collect();
        self.rules
            .iter()
            .fold(segments, |segments, rule| rule.apply(segments))
            .join(".")
    }

    /// Rename every key of a map. Fails if two names collapse onto one.
    pub fn translate_map<V>(&self, map: BTreeMap<String, V>) -> Result<BTreeMap<String, V>> {
        let mut out = BTreeMap::new();
        for (name, value) in map {
            let translated = self.translate(&name);
            if out.insert(translated.clone(), value).is_some() {
                return Err(Error::Serialization(format!(
                    "parameter names collide after translation: {}",
                    translated
                )));
            }
        }
        Ok(out)
    }
}

/// A tensor as shape plus row-major values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

fn export_tensor<B: Backend>(tensor: ParamTensor<B>) -> Result<ExportedTensor> {
    // Linear weights are stored [in, out]; conventional layout is [out, in].
    let tensor = match tensor {
        ParamTensor::D2(t) => ParamTensor::D2(t.transpose()),
        other => other,
    };
    let shape = tensor.dims();
    let data = tensor
        .flatten()
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| Error::Serialization(format!("Failed to read tensor: {:?}", e)))?;
    Ok(ExportedTensor { shape, data })
}

/// Metadata stored next to the exported parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub model_name: String,
    pub convnet_type: String,
    pub dataset: String,
    pub seed: u64,
    pub task: usize,
    pub num_classes: usize,
    pub num_parameters: usize,
    /// Original labels in curriculum order
    pub class_order: Vec<usize>,
}

/// Exported parameter map of a trained network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: String,
    pub metadata: CheckpointMetadata,
    pub params: BTreeMap<String, ExportedTensor>,
    pub buffers: BTreeMap<String, ExportedTensor>,
}

impl Checkpoint {
    /// Snapshot `net`, renaming every tensor through `translator`.
    pub fn from_net<B: Backend>(
        net: &IncrementalNet<B>,
        translator: &ParamNameTranslator,
        metadata: CheckpointMetadata,
    ) -> Result<Self> {
        let mut params = BTreeMap::new();
        let mut buffers = BTreeMap::new();
        for named in net.named_tensors() {
            let exported = export_tensor(named.tensor)?;
            match named.role {
                TensorRole::Learnable => params.insert(named.name, exported),
                TensorRole::Buffer => buffers.insert(named.name, exported),
            };
        }

        Ok(Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            metadata,
            params: translator.translate_map(params)?,
            buffers: translator.translate_map(buffers)?,
        })
    }

    /// Save checkpoint to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize checkpoint: {}", e)))?;
        fs::write(path, json)?;

        info!("Checkpoint saved to {:?}", path);
        Ok(())
    }

    /// Load checkpoint from file
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let checkpoint = serde_json::from_str(&json)
            .map_err(|e| Error::Serialization(format!("Failed to deserialize checkpoint: {}", e)))?;

        info!("Checkpoint loaded from {:?}", path);
        Ok(checkpoint)
    }
}

/// Save the native burn record of a network.
pub fn save_model_record<B: Backend>(net: &IncrementalNet<B>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    net.clone()
        .save_file(path.to_path_buf(), &CompactRecorder::new())
        .map_err(|e| Error::Model(format!("Failed to save model: {:?}", e)))?;
    info!("Model record saved to {:?}", path);
    Ok(())
}
