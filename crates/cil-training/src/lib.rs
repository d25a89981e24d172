//! Model, evaluation and export infrastructure for class-incremental learning.
//!
//! This crate provides:
//! - The backbone plus growable head network
//! - Learning rate scheduling
//! - Classifier-head and nearest-mean evaluation
//! - Parameter-name translation and checkpoint export

pub mod model;
pub mod lr_schedule;
pub mod evaluator;
pub mod checkpoint;

pub use model::{ConvNet, IncrementalNet, NamedTensor, NetConfig, ParamTensor, TensorRole};
pub use lr_schedule::{LearningRateScheduler, SchedulerType};
pub use evaluator::{accuracy, cnn_rankings, extract_features, nme_rank, nme_rankings, TOP_K};
pub use checkpoint::{
    save_model_record, Checkpoint, CheckpointMetadata, ExportedTensor, ParamNameTranslator,
    TranslationRule,
};
