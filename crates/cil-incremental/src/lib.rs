//! Class-incremental learning on top of the model and dataset crates.
//!
//! This crate provides:
//! - The exemplar memory with herding and random selection
//! - Strategy implementations (finetune, replay, iCaRL, LwF, EWC)
//! - The per-task trainer state machine
//! - The multi-seed experiment driver and metric tracking

pub mod memory;
pub mod strategy;
pub mod trainer;
pub mod tracker;
pub mod driver;

pub use memory::{herding_select, ExemplarMemory, FeatureExtractor, NetFeatureExtractor};
pub use strategy::{build_strategy, IncrementalStrategy, LossContext};
pub use trainer::{EpochStats, IncrementalTrainer, TrainerPhase};
pub use tracker::{JsonlTracker, NoopTracker, Tracker};
pub use driver::{ExperimentDriver, RunSummary, SeedOutcome};
