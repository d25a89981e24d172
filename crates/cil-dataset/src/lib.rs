//! Dataset sources and task partitioning for class-incremental learning.
//!
//! This crate provides:
//! - In-memory sample storage with tensor batching
//! - Seeded synthetic and image-folder dataset sources
//! - The task partitioner that turns a dataset into an ordered curriculum

pub mod split;
pub mod dataset;
pub mod synthetic;
pub mod image_folder;
pub mod manager;

pub use split::{DataSplit, SampleBatch, SampleRef};
pub use dataset::{load_dataset, IncrementalDataset};
pub use manager::{class_order, task_increments, DataManager, Task};
