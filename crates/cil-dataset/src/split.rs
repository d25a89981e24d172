//! In-memory sample storage and tensor batching.

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use cil_core::{Error, InputShape, Result};

/// Index of a sample inside a [`DataSplit`]. Tasks and the exemplar memory
/// hold these instead of copies of the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleRef(pub usize);

impl SampleRef {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A train or test split stored as one contiguous feature buffer.
#[derive(Debug, Clone)]
pub struct DataSplit {
    shape: InputShape,
    features: Vec<f32>,
    labels: Vec<usize>,
}

impl DataSplit {
    pub fn new(shape: InputShape, features: Vec<f32>, labels: Vec<usize>) -> Result<Self> {
        let numel = shape.numel();
        if numel == 0 {
            return Err(Error::Dataset("samples must have at least one feature".to_string()));
        }
        if features.len() != labels.len() * numel {
            return Err(Error::Dataset(format!(
                "feature buffer holds {} values, expected {} samples x {}",
                features.len(),
                labels.len(),
                numel
            )));
        }
        Ok(Self {
            shape,
            features,
            labels,
        })
    }

    pub fn shape(&self) -> InputShape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn label(&self, sample: SampleRef) -> usize {
        self.labels[sample.0]
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn features(&self, sample: SampleRef) -> &[f32] {
        let numel = self.shape.numel();
        &self.features[sample.0 * numel..(sample.0 + 1) * numel]
    }

    /// All references whose label satisfies `keep`, in storage order.
    pub fn refs_where(&self, keep: impl Fn(usize) -> bool) -> Vec<SampleRef> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, &label)| keep(label))
            .map(|(i, _)| SampleRef(i))
            .collect()
    }

    /// Relabel every sample through `mapping[old_label]`.
    pub(crate) fn remap_labels(&mut self, mapping: &[usize]) -> Result<()> {
        for label in self.labels.iter_mut() {
            *label = *mapping.get(*label).ok_or_else(|| {
                Error::Dataset(format!("label {} outside the class order", label))
            })?;
        }
        Ok(())
    }

    /// Build a batch from the referenced samples, in the given order.
    pub fn batch<B: Backend>(&self, refs: &[SampleRef], device: &B::Device) -> SampleBatch<B> {
        let numel = self.shape.numel();
        let mut inputs = Vec::with_capacity(refs.len() * numel);
        let mut targets = Vec::with_capacity(refs.len());
        for &sample in refs {
            inputs.extend_from_slice(self.features(sample));
            targets.push(self.label(sample) as i64);
        }

        let inputs = Tensor::<B, 2>::from_data(TensorData::new(inputs, [refs.len(), numel]), device);
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets, [refs.len()]), device);
        SampleBatch { inputs, targets }
    }
}

/// Inputs flattened to `[batch, numel]` and their labels.
#[derive(Debug, Clone)]
pub struct SampleBatch<B: Backend> {
    pub inputs: Tensor<B, 2>,
    pub targets: Tensor<B, 1, Int>,
}
