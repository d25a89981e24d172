//! Exemplar memory.
//!
//! Holds, per class, an ordered list of references into the training split.
//! The order is the selection order, so truncating a list keeps the most
//! representative exemplars. Class means are computed lazily and cached
//! together with the weights version that produced them.

use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use cil_core::{MemoryBudget, Result, SelectionMethod};
use cil_dataset::{DataSplit, SampleRef};
use cil_training::{evaluator, IncrementalNet};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

/// Source of L2-normalised feature vectors.
pub trait FeatureExtractor {
    /// Identifies the weights the features come from; changes whenever they do.
    fn version(&self) -> u64;

    /// One normalised feature row per reference, in the same order.
    fn extract(&self, split: &DataSplit, refs: &[SampleRef]) -> Result<Vec<Vec<f32>>>;
}

/// Features from a network's backbone.
pub struct NetFeatureExtractor<'a, B: Backend> {
    net: &'a IncrementalNet<B>,
    device: &'a B::Device,
    batch_size: usize,
    version: u64,
}

impl<'a, B: Backend> NetFeatureExtractor<'a, B> {
    pub fn new(
        net: &'a IncrementalNet<B>,
        device: &'a B::Device,
        batch_size: usize,
        version: u64,
    ) -> Self {
        Self {
            net,
            device,
            batch_size,
            version,
        }
    }
}

impl<B: Backend> FeatureExtractor for NetFeatureExtractor<'_, B> {
    fn version(&self) -> u64 {
        self.version
    }

    fn extract(&self, split: &DataSplit, refs: &[SampleRef]) -> Result<Vec<Vec<f32>>> {
        evaluator::extract_features(self.net, split, refs, self.batch_size, self.device)
    }
}

/// Greedy herding: at step `k`, pick the remaining candidate whose addition
/// brings the running mean of the picks closest to the mean of all
/// candidates. Returns candidate positions in pick order; none is picked twice.
pub fn herding_select(features: &[Vec<f32>], count: usize) -> Vec<usize> {
    let Some(dim) = features.first().map(Vec::len) else {
        return Vec::new();
    };
    let n = features.len() as f32;
    let mut class_mean = vec![0.0f32; dim];
    for row in features {
        for (m, v) in class_mean.iter_mut().zip(row) {
            *m += v / n;
        }
    }

    let mut remaining: Vec<usize> = (0..features.len()).collect();
    let mut picked = Vec::with_capacity(count.min(features.len()));
    let mut picked_sum = vec![0.0f32; dim];

    for k in 1..=count.min(features.len()) {
        let mut best: Option<(usize, f32)> = None;
        for (slot, &candidate) in remaining.iter().enumerate() {
            let distance: f32 = features[candidate]
                .iter()
                .zip(&picked_sum)
                .zip(&class_mean)
                .map(|((f, s), m)| {
                    let mu = (f + s) / k as f32;
                    (m - mu) * (m - mu)
                })
                .sum();
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((slot, distance));
            }
        }
        let Some((slot, _)) = best else { break };
        let chosen = remaining.remove(slot);
        for (s, f) in picked_sum.iter_mut().zip(&features[chosen]) {
            *s += f;
        }
        picked.push(chosen);
    }
    picked
}

#[derive(Debug, Clone)]
struct CachedMeans {
    version: u64,
    means: BTreeMap<usize, Vec<f32>>,
}

/// Bounded per-class exemplar store
#[derive(Debug, Clone)]
pub struct ExemplarMemory {
    budget: MemoryBudget,
    method: SelectionMethod,
    exemplars: BTreeMap<usize, Vec<SampleRef>>,
    means: Option<CachedMeans>,
}

impl ExemplarMemory {
    pub fn new(budget: MemoryBudget, method: SelectionMethod) -> Self {
        Self {
            budget,
            method,
            exemplars: BTreeMap::new(),
            means: None,
        }
    }

    pub fn budget(&self) -> MemoryBudget {
        self.budget
    }

    /// Total stored exemplars across classes
    pub fn total_count(&self) -> usize {
        self.exemplars.values().map(Vec::len).sum()
    }

    pub fn num_classes(&self) -> usize {
        self.exemplars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exemplars.is_empty()
    }

    pub fn exemplars(&self, class: usize) -> Option<&[SampleRef]> {
        self.exemplars.get(&class).map(Vec::as_slice)
    }

    /// Every stored exemplar with its class, classes in ascending order.
    pub fn exemplar_refs(&self) -> Vec<(SampleRef, usize)> {
        self.exemplars
            .iter()
            .flat_map(|(&class, refs)| refs.iter().map(move |&r| (r, class)))
            .collect()
    }

    /// Choose up to `budget` exemplars for `class` among `candidates`.
    ///
    /// A zero budget (or no candidates) leaves the class without exemplars;
    /// it is then absent from [`class_means`](Self::class_means).
    pub fn select(
        &mut self,
        class: usize,
        candidates: &[SampleRef],
        extractor: &dyn FeatureExtractor,
        split: &DataSplit,
        budget: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<&[SampleRef]> {
        self.means = None;
        if budget == 0 || candidates.is_empty() {
            debug!("Class {}: no exemplar capacity", class);
            self.exemplars.remove(&class);
            return Ok(&[]);
        }

        let chosen: Vec<SampleRef> = match self.method {
            SelectionMethod::Herding => {
                let features = extractor.extract(split, candidates)?;
                herding_select(&features, budget)
                    .into_iter()
                    .map(|i| candidates[i])
                    .collect()
            }
            SelectionMethod::Random => candidates
                .choose_multiple(rng, budget.min(candidates.len()))
                .copied()
                .collect(),
        };
        debug!("Class {}: selected {} exemplars", class, chosen.len());

        let stored = self.exemplars.entry(class).or_default();
        *stored = chosen;
        Ok(stored.as_slice())
    }

    /// Shrink every class to the quota for `known_classes` classes, keeping
    /// the earliest picks. Returns the quota.
    pub fn rebalance(&mut self, known_classes: usize) -> usize {
        let quota = self.budget.quota(known_classes);
        let mut shrunk = false;
        for refs in self.exemplars.values_mut() {
            if refs.len() > quota {
                refs.truncate(quota);
                shrunk = true;
            }
        }
        self.exemplars.retain(|_, refs| !refs.is_empty());
        if shrunk {
            self.means = None;
        }
        quota
    }

    /// Normalised mean exemplar feature of every held class.
    ///
    /// Recomputed whenever the extractor's version differs from the cached
    /// one or the exemplar sets changed since the last computation.
    pub fn class_means(
        &mut self,
        extractor: &dyn FeatureExtractor,
        split: &DataSplit,
    ) -> Result<&BTreeMap<usize, Vec<f32>>> {
        let cached = match self.means.take() {
            Some(cached) if cached.version == extractor.version() => cached,
            _ => CachedMeans {
                version: extractor.version(),
                means: self.compute_means(extractor, split)?,
            },
        };
        Ok(&self.means.insert(cached).means)
    }

    fn compute_means(
        &self,
        extractor: &dyn FeatureExtractor,
        split: &DataSplit,
    ) -> Result<BTreeMap<usize, Vec<f32>>> {
        let mut means = BTreeMap::new();
        for (&class, refs) in &self.exemplars {
            let features = extractor.extract(split, refs)?;
            let Some(dim) = features.first().map(Vec::len) else {
                continue;
            };
            let mut mean = vec![0.0f32; dim];
            for row in &features {
                for (m, v) in mean.iter_mut().zip(row) {
                    *m += v / features.len() as f32;
                }
            }
            evaluator::l2_normalize(&mut mean);
            means.insert(class, mean);
        }
        debug!(
            "Computed class means for {} classes (weights version {})",
            means.len(),
            extractor.version()
        );
        Ok(means)
    }
}
