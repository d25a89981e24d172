//! Common types used throughout the experiment workspace.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Incremental learning strategy selected by `model_name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Plain fine-tuning on each new task
    Finetune,
    /// Rehearsal with an exemplar memory
    Replay,
    /// Rehearsal plus knowledge distillation and nearest-mean evaluation
    Icarl,
    /// Learning without Forgetting (exemplar-free distillation)
    Lwf,
    /// Elastic Weight Consolidation (exemplar-free regularization)
    Ewc,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::Finetune,
        StrategyKind::Replay,
        StrategyKind::Icarl,
        StrategyKind::Lwf,
        StrategyKind::Ewc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Finetune => "finetune",
            StrategyKind::Replay => "replay",
            StrategyKind::Icarl => "icarl",
            StrategyKind::Lwf => "lwf",
            StrategyKind::Ewc => "ewc",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.to_ascii_lowercase();
        StrategyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lowered)
            .ok_or_else(|| {
                Error::Config(format!(
                    "Unknown model_name '{}'; expected one of finetune, replay, icarl, lwf, ewc",
                    s
                ))
            })
    }
}

/// Backbone family selected by `convnet_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    /// Two hidden fully-connected layers over flat inputs
    Mlp,
    /// Small convolutional network over CHW images
    Cnn,
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackboneKind::Mlp => write!(f, "mlp"),
            BackboneKind::Cnn => write!(f, "cnn"),
        }
    }
}

impl FromStr for BackboneKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mlp" => Ok(BackboneKind::Mlp),
            "cnn" | "convnet" => Ok(BackboneKind::Cnn),
            other => Err(Error::Config(format!(
                "Unknown convnet_type '{}'; expected mlp or cnn",
                other
            ))),
        }
    }
}

/// Shape of a single input sample as seen by the backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputShape {
    /// Flat feature vector of the given length
    Flat(usize),
    /// Image tensor in CHW order
    Image {
        channels: usize,
        height: usize,
        width: usize,
    },
}

impl InputShape {
    /// Number of scalars per sample.
    pub fn numel(&self) -> usize {
        match *self {
            InputShape::Flat(dim) => dim,
            InputShape::Image {
                channels,
                height,
                width,
            } => channels * height * width,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_kind_parsing() {
        assert_eq!("iCaRL".parse::<StrategyKind>().unwrap(), StrategyKind::Icarl);
        assert_eq!("lwf".parse::<StrategyKind>().unwrap(), StrategyKind::Lwf);
        assert!("der".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_strategy_kind_display_roundtrip() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.to_string().parse::<StrategyKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_backbone_kind_parsing() {
        assert_eq!("MLP".parse::<BackboneKind>().unwrap(), BackboneKind::Mlp);
        assert_eq!("cnn".parse::<BackboneKind>().unwrap(), BackboneKind::Cnn);
        assert!(matches!(
            "resnet1000".parse::<BackboneKind>(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_input_shape_numel() {
        assert_eq!(InputShape::Flat(16).numel(), 16);
        let image = InputShape::Image {
            channels: 3,
            height: 8,
            width: 8,
        };
        assert_eq!(image.numel(), 192);
    }
}
