//! Run configuration for class-incremental experiments.
//!
//! A [`RunConfig`] is loaded once at startup, validated, and then only ever
//! passed around by reference. Values derived from it (resolved devices,
//! memory budget, run paths) are computed into separate values.

use crate::types::{BackboneKind, StrategyKind};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level experiment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Free-form run prefix used in log and checkpoint names
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Dataset identity (used for run paths and logging)
    pub dataset: String,
    /// Strategy name (`finetune`, `replay`, `icarl`, `lwf`, `ewc`)
    pub model_name: String,
    /// Backbone family (`mlp` or `cnn`)
    #[serde(default = "default_convnet")]
    pub convnet_type: String,
    /// Number of classes in the first task
    pub init_cls: usize,
    /// Number of classes added by every later task
    pub increment: usize,
    /// One independent repetition is run per seed, in order
    #[serde(default = "default_seeds")]
    pub seed: Vec<u64>,
    /// User-facing device identifiers (-1 = unified memory, n = discrete accelerator n)
    #[serde(default = "default_devices")]
    pub device: Vec<i64>,
    /// Shuffle the class order with the repetition seed
    #[serde(default = "default_true")]
    pub shuffle: bool,
    /// Experiment-tracking project name; tracking is disabled when absent
    #[serde(default, alias = "wb-project", alias = "wb_project")]
    pub tracking_project: Option<String>,
    /// Dataset source
    #[serde(default)]
    pub data: DataConfig,
    /// Backbone hyperparameters
    #[serde(default)]
    pub network: NetworkParams,
    /// Optimization hyperparameters
    #[serde(default)]
    pub training: TrainingParams,
    /// Exemplar memory policy
    #[serde(default)]
    pub memory: MemoryParams,
    /// Strategy-specific hyperparameters
    #[serde(default)]
    pub strategy: StrategyParams,
    /// Output locations
    #[serde(default)]
    pub output: OutputParams,
}

fn default_prefix() -> String {
    "reproduce".to_string()
}

fn default_convnet() -> String {
    "mlp".to_string()
}

fn default_seeds() -> Vec<u64> {
    vec![1993]
}

fn default_devices() -> Vec<i64> {
    vec![0]
}

fn default_true() -> bool {
    true
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            dataset: "synthetic".to_string(),
            model_name: "icarl".to_string(),
            convnet_type: default_convnet(),
            init_cls: 2,
            increment: 2,
            seed: default_seeds(),
            device: default_devices(),
            shuffle: true,
            tracking_project: None,
            data: DataConfig::default(),
            network: NetworkParams::default(),
            training: TrainingParams::default(),
            memory: MemoryParams::default(),
            strategy: StrategyParams::default(),
            output: OutputParams::default(),
        }
    }
}

impl RunConfig {
    /// Strategy selected by `model_name`.
    pub fn strategy_kind(&self) -> Result<StrategyKind> {
        self.model_name.parse()
    }

    /// Backbone selected by `convnet_type`.
    pub fn backbone_kind(&self) -> Result<BackboneKind> {
        self.convnet_type.parse()
    }

    /// `init_cls` as it appears in run paths: 0 when the first task is a regular increment.
    pub fn path_init_cls(&self) -> usize {
        if self.init_cls == self.increment {
            0
        } else {
            self.init_cls
        }
    }

    /// Memory budget policy derived from the memory section.
    pub fn memory_budget(&self) -> MemoryBudget {
        if self.memory.fixed_memory {
            MemoryBudget::FixedPerClass {
                per_class: self.memory.memory_per_class,
            }
        } else {
            MemoryBudget::FixedTotal {
                total: self.memory.memory_size,
            }
        }
    }

    /// Check every field that can be checked without looking at the data.
    pub fn validate(&self) -> Result<()> {
        self.strategy_kind()?;
        self.backbone_kind()?;

        if self.init_cls == 0 {
            return Err(Error::Config("init_cls must be at least 1".to_string()));
        }
        if self.seed.is_empty() {
            return Err(Error::Config("seed list must not be empty".to_string()));
        }
        if self.device.is_empty() {
            return Err(Error::Config("device list must not be empty".to_string()));
        }
        crate::device::resolve_devices(&self.device)?;

        self.training.validate()?;
        self.strategy.validate()?;
        self.data.validate()?;
        Ok(())
    }
}

/// Where samples come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataConfig {
    /// Seeded Gaussian clusters, one per class
    Synthetic {
        num_classes: usize,
        train_per_class: usize,
        test_per_class: usize,
        dim: usize,
        /// Distance scale between class centres
        separation: f32,
        /// Per-feature standard deviation around each centre
        noise: f32,
        /// Generation seed, independent from the repetition seeds
        seed: u64,
    },
    /// `<root>/train/<class>/*` and `<root>/test/<class>/*` image folders
    ImageFolder {
        root: PathBuf,
        image_size: u32,
    },
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig::Synthetic {
            num_classes: 10,
            train_per_class: 40,
            test_per_class: 10,
            dim: 16,
            separation: 4.0,
            noise: 0.5,
            seed: 7,
        }
    }
}

impl DataConfig {
    fn validate(&self) -> Result<()> {
        match self {
            DataConfig::Synthetic {
                num_classes,
                train_per_class,
                dim,
                noise,
                ..
            } => {
                if *num_classes == 0 || *train_per_class == 0 || *dim == 0 {
                    return Err(Error::Config(
                        "synthetic data needs at least one class, sample and feature".to_string(),
                    ));
                }
                if !noise.is_finite() || *noise < 0.0 {
                    return Err(Error::Config(format!("invalid synthetic noise {}", noise)));
                }
            }
            DataConfig::ImageFolder { image_size, .. } => {
                if *image_size < 4 {
                    return Err(Error::Config(format!(
                        "image_size must be at least 4, got {}",
                        image_size
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Backbone sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkParams {
    /// Hidden width of the MLP backbone
    pub hidden_dim: usize,
    /// Output feature dimension of the backbone
    pub feature_dim: usize,
    /// Base channel count of the CNN backbone
    pub base_channels: usize,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            hidden_dim: 64,
            feature_dim: 32,
            base_channels: 16,
        }
    }
}

/// Optimizer type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerType {
    /// Adam optimizer
    Adam,
    /// SGD with momentum
    Sgd,
}

impl std::fmt::Display for OptimizerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizerType::Adam => write!(f, "adam"),
            OptimizerType::Sgd => write!(f, "sgd"),
        }
    }
}

/// Learning-rate schedule family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Constant,
    /// Multiply by `lr_decay` at every milestone epoch
    MultiStep,
    /// Cosine decay to zero over the task's epochs
    Cosine,
}

/// Training hyperparameters.
///
/// The first task uses the `init_*` values, every later task the plain ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    pub batch_size: usize,
    pub init_epochs: usize,
    pub init_lr: f64,
    pub init_milestones: Vec<usize>,
    pub epochs: usize,
    pub lr: f64,
    pub milestones: Vec<usize>,
    pub lr_decay: f64,
    pub schedule: ScheduleKind,
    pub optimizer: OptimizerType,
    /// Momentum (SGD only)
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            batch_size: 32,
            init_epochs: 20,
            init_lr: 0.01,
            init_milestones: vec![10, 15],
            epochs: 15,
            lr: 0.01,
            milestones: vec![8, 12],
            lr_decay: 0.1,
            schedule: ScheduleKind::MultiStep,
            optimizer: OptimizerType::Adam,
            momentum: 0.9,
            weight_decay: 5e-4,
        }
    }
}

impl TrainingParams {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.init_epochs == 0 || self.epochs == 0 {
            return Err(Error::Config("epoch counts must be at least 1".to_string()));
        }
        for (name, lr) in [("init_lr", self.init_lr), ("lr", self.lr)] {
            if !(lr.is_finite() && lr > 0.0) {
                return Err(Error::Config(format!("{} must be positive, got {}", name, lr)));
            }
        }
        Ok(())
    }
}

/// How exemplars are chosen for a class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMethod {
    /// Greedy running-mean matching in feature space
    #[default]
    Herding,
    /// Seeded uniform sampling
    Random,
}

/// Exemplar memory section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryParams {
    /// Total exemplar budget (fixed-total policy)
    pub memory_size: usize,
    /// Per-class exemplar count (fixed-per-class policy)
    pub memory_per_class: usize,
    /// Use the fixed-per-class policy instead of the fixed-total one
    pub fixed_memory: bool,
    pub selection: SelectionMethod,
}

impl Default for MemoryParams {
    fn default() -> Self {
        Self {
            memory_size: 200,
            memory_per_class: 20,
            fixed_memory: false,
            selection: SelectionMethod::Herding,
        }
    }
}

/// Exemplar budget policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryBudget {
    /// A total count divided evenly across all known classes
    FixedTotal { total: usize },
    /// A constant count for every class
    FixedPerClass { per_class: usize },
}

impl MemoryBudget {
    /// Per-class quota once `known_classes` classes are held.
    pub fn quota(&self, known_classes: usize) -> usize {
        match *self {
            MemoryBudget::FixedTotal { total } => {
                if known_classes == 0 {
                    total
                } else {
                    total / known_classes
                }
            }
            MemoryBudget::FixedPerClass { per_class } => per_class,
        }
    }
}

/// Weight applied to a distillation term.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DistillSchedule {
    /// Same weight for every task
    Constant { weight: f64 },
    /// `base * known / total`, growing with the share of old classes
    Proportional { base: f64 },
}

impl DistillSchedule {
    pub fn weight(&self, known_classes: usize, total_classes: usize) -> f64 {
        match *self {
            DistillSchedule::Constant { weight } => weight,
            DistillSchedule::Proportional { base } => {
                if total_classes == 0 {
                    0.0
                } else {
                    base * known_classes as f64 / total_classes as f64
                }
            }
        }
    }
}

/// Strategy-specific hyperparameters. Each strategy reads only its own fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    /// Distillation temperature
    pub temperature: f64,
    /// Distillation weight for iCaRL
    pub icarl_distill: DistillSchedule,
    /// Distillation weight for LwF
    pub lwf_distill: DistillSchedule,
    /// EWC penalty weight
    pub ewc_lambda: f64,
    /// Upper clamp on Fisher information entries
    pub fisher_max: f64,
    /// Train only the head after the first task (finetune)
    pub freeze_backbone: bool,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            temperature: 2.0,
            icarl_distill: DistillSchedule::Constant { weight: 1.0 },
            lwf_distill: DistillSchedule::Constant { weight: 3.0 },
            ewc_lambda: 1000.0,
            fisher_max: 1e-4,
            freeze_backbone: false,
        }
    }
}

impl StrategyParams {
    fn validate(&self) -> Result<()> {
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(Error::Config(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if self.fisher_max <= 0.0 {
            return Err(Error::Config("fisher_max must be positive".to_string()));
        }
        Ok(())
    }
}

/// Output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputParams {
    /// Root of the `<model>/<dataset>/<init>/<increment>` log tree
    pub log_dir: PathBuf,
    /// Export the translated parameter map after the final task
    pub save_checkpoint: bool,
    /// Also export after every task
    pub save_every_task: bool,
}

impl Default for OutputParams {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            save_checkpoint: true,
            save_every_task: false,
        }
    }
}
