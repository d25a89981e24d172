//! Elastic Weight Consolidation.
//!
//! After every task the diagonal Fisher information of the backbone is
//! estimated from squared gradients on that task's data. Later tasks pay a
//! quadratic penalty for moving important backbone weights away from where
//! they ended up.

use burn::tensor::{backend::AutodiffBackend, Int, Tensor};
use cil_core::{Result, StrategyKind};
use cil_dataset::SampleBatch;
use cil_training::IncrementalNet;
use tracing::debug;

use super::{distill, IncrementalStrategy, LossContext};

type Inner<B> = <B as AutodiffBackend>::InnerBackend;

pub struct Ewc<B: AutodiffBackend> {
    lambda: f64,
    fisher_max: f64,
    /// Per backbone tensor, flattened
    fisher: Vec<Tensor<Inner<B>, 1>>,
    anchors: Vec<Tensor<Inner<B>, 1>>,
}

impl<B: AutodiffBackend> Ewc<B> {
    pub fn new(lambda: f64, fisher_max: f64) -> Self {
        Self {
            lambda,
            fisher_max,
            fisher: Vec::new(),
            anchors: Vec::new(),
        }
    }

    pub fn has_fisher(&self) -> bool {
        !self.fisher.is_empty()
    }

    /// `sum(F * (p - p*)^2) / 2` over the backbone.
    pub fn penalty(&self, net: &IncrementalNet<B>) -> Option<Tensor<B, 1>> {
        if !self.has_fisher() {
            return None;
        }
        net.backbone_params()
            .into_iter()
            .zip(self.fisher.iter().zip(&self.anchors))
            .map(|(param, (fisher, anchor))| {
                let diff = param.flatten() - Tensor::from_inner(anchor.clone());
                (Tensor::<B, 1>::from_inner(fisher.clone()) * diff.clone() * diff).sum()
            })
            .reduce(|a, b| a + b)
            .map(|total| total.div_scalar(2.0))
    }

    fn estimate_fisher(
        &self,
        net: &IncrementalNet<B>,
        batches: &[SampleBatch<B>],
    ) -> Vec<Tensor<Inner<B>, 1>> {
        let params = net.backbone_params();
        let mut sums: Vec<Tensor<Inner<B>, 1>> = params
            .iter()
            .map(|p| p.clone().flatten().inner().zeros_like())
            .collect();

        for batch in batches {
            let logits = net.forward(batch.inputs.clone());
            let grads = distill::cross_entropy(logits, batch.targets.clone()).backward();
            for (sum, param) in sums.iter_mut().zip(&params) {
                if let Some(grad) = param.flat_grad(&grads) {
                    *sum = sum.clone() + grad.clone() * grad;
                }
            }
        }

        let count = batches.len().max(1) as f64;
        sums.into_iter()
            .map(|sum| sum.div_scalar(count).clamp_max(self.fisher_max))
            .collect()
    }
}

impl<B: AutodiffBackend> IncrementalStrategy<B> for Ewc<B> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Ewc
    }

    fn uses_memory(&self) -> bool {
        false
    }

    fn needs_task_batches(&self) -> bool {
        true
    }

    fn loss(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
        ctx: &LossContext<B>,
        net: &IncrementalNet<B>,
    ) -> Tensor<B, 1> {
        if ctx.is_first_task() {
            return distill::cross_entropy(logits, targets);
        }
        let ce = distill::new_class_cross_entropy(logits, targets, ctx.known_classes);
        match self.penalty(net) {
            Some(penalty) => ce + penalty.mul_scalar(self.lambda),
            None => ce,
        }
    }

    fn after_train(
        &mut self,
        net: &IncrementalNet<B>,
        ctx: &LossContext<B>,
        batches: &[SampleBatch<B>],
    ) -> Result<()> {
        let fresh = self.estimate_fisher(net, batches);
        self.fisher = if self.fisher.len() == fresh.len() {
            let alpha = ctx.known_classes as f64 / ctx.total_classes.max(1) as f64;
            self.fisher
                .iter()
                .zip(fresh)
                .map(|(old, new)| old.clone().mul_scalar(alpha) + new.mul_scalar(1.0 - alpha))
                .collect()
        } else {
            fresh
        };
        self.anchors = net
            .backbone_params()
            .into_iter()
            .map(|p| p.flatten().inner())
            .collect();
        debug!(
            "EWC: Fisher estimated over {} batches for {} tensors",
            batches.len(),
            self.fisher.len()
        );
        Ok(())
    }
}
