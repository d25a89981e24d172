//! Task partitioning.
//!
//! [`DataManager`] fixes a class order (identity, or a permutation drawn from
//! the repetition seed), relabels every sample with its position in that
//! order, and splits the relabelled classes into contiguous task ranges:
//! `init_cls` classes first, then `increment` classes per task, the last task
//! taking whatever remains.

use std::ops::Range;

use cil_core::{Error, InputShape, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::dataset::IncrementalDataset;
use crate::split::{DataSplit, SampleRef};

/// One step of the curriculum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub index: usize,
    /// Classes introduced by this task
    pub new_classes: Range<usize>,
    /// Training samples of the new classes
    pub train: Vec<SampleRef>,
    /// Test samples of every class seen so far
    pub test: Vec<SampleRef>,
}

impl Task {
    /// Classes seen before this task.
    pub fn known_classes(&self) -> usize {
        self.new_classes.start
    }

    /// Classes seen once this task is learned.
    pub fn total_classes(&self) -> usize {
        self.new_classes.end
    }

    pub fn seen_classes(&self) -> Range<usize> {
        0..self.new_classes.end
    }
}

/// Class-count sequence: `[init_cls, increment, ..., remainder]`.
pub fn task_increments(num_classes: usize, init_cls: usize, increment: usize) -> Result<Vec<usize>> {
    if init_cls == 0 {
        return Err(Error::Config("init_cls must be at least 1".to_string()));
    }
    if init_cls > num_classes {
        return Err(Error::Config(format!(
            "init_cls ({}) exceeds the number of classes ({})",
            init_cls, num_classes
        )));
    }
    let remaining = num_classes - init_cls;
    if remaining > 0 && increment == 0 {
        return Err(Error::Config(format!(
            "increment must be positive to cover {} remaining classes",
            remaining
        )));
    }

    let mut increments = vec![init_cls];
    let mut left = remaining;
    while left > 0 {
        let size = increment.min(left);
        increments.push(size);
        left -= size;
    }
    Ok(increments)
}

/// Class order for a repetition: identity, or a seeded permutation.
pub fn class_order(num_classes: usize, shuffle: bool, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..num_classes).collect();
    if shuffle {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        order.shuffle(&mut rng);
    }
    order
}

/// Owns the relabelled data of one repetition and hands out tasks.
#[derive(Debug, Clone)]
pub struct DataManager {
    dataset_name: String,
    class_names: Vec<String>,
    class_order: Vec<usize>,
    increments: Vec<usize>,
    train: DataSplit,
    test: DataSplit,
}

impl DataManager {
    pub fn new(
        dataset: IncrementalDataset,
        shuffle: bool,
        seed: u64,
        init_cls: usize,
        increment: usize,
    ) -> Result<Self> {
        let num_classes = dataset.num_classes();
        let increments = task_increments(num_classes, init_cls, increment)?;
        let class_order = class_order(num_classes, shuffle, seed);

        // mapping[original label] = position in the class order
        let mut mapping = vec![0usize; num_classes];
        for (position, &original) in class_order.iter().enumerate() {
            mapping[original] = position;
        }

        let (dataset_name, original_names, mut train, mut test) = dataset.into_parts();
        train.remap_labels(&mapping)?;
        test.remap_labels(&mapping)?;
        let class_names = class_order
            .iter()
            .map(|&original| original_names[original].clone())
            .collect();

        info!("Class order: {:?}", class_order);
        Ok(Self {
            dataset_name,
            class_names,
            class_order,
            increments,
            train,
            test,
        })
    }

    pub fn dataset_name(&self) -> &str {
        &self.dataset_name
    }

    pub fn nb_tasks(&self) -> usize {
        self.increments.len()
    }

    pub fn num_classes(&self) -> usize {
        self.class_order.len()
    }

    /// Original labels in curriculum order.
    pub fn class_order(&self) -> &[usize] {
        &self.class_order
    }

    pub fn increments(&self) -> &[usize] {
        &self.increments
    }

    pub fn task_size(&self, task: usize) -> Option<usize> {
        self.increments.get(task).copied()
    }

    /// Name of a relabelled class.
    pub fn class_name(&self, class: usize) -> Option<&str> {
        self.class_names.get(class).map(String::as_str)
    }

    pub fn input_shape(&self) -> InputShape {
        self.train.shape()
    }

    pub fn train_split(&self) -> &DataSplit {
        &self.train
    }

    pub fn test_split(&self) -> &DataSplit {
        &self.test
    }

    /// Relabelled class range of every task, in order.
    pub fn task_ranges(&self) -> Vec<Range<usize>> {
        let mut start = 0;
        self.increments
            .iter()
            .map(|&size| {
                let range = start..start + size;
                start += size;
                range
            })
            .collect()
    }

    pub fn task(&self, index: usize) -> Result<Task> {
        let new_classes = self
            .task_ranges()
            .get(index)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "task {} out of range ({} tasks)",
                    index,
                    self.nb_tasks()
                ))
            })?;
        let train = self.train.refs_where(|label| new_classes.contains(&label));
        let seen = new_classes.end;
        let test = self.test.refs_where(|label| label < seen);
        Ok(Task {
            index,
            new_classes,
            train,
            test,
        })
    }

    pub fn tasks(&self) -> impl Iterator<Item = Result<Task>> + '_ {
        (0..self.nb_tasks()).map(move |t| self.task(t))
    }
}
