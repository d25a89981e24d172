//! Fine-tuning baseline.
//!
//! Trains on the new task's samples only, with cross-entropy over every seen
//! class. With `freeze_backbone` the backbone stops learning after the first
//! task and only the head adapts.

use burn::tensor::{backend::AutodiffBackend, Int, Tensor};
use cil_core::StrategyKind;
use cil_training::IncrementalNet;

use super::{distill, IncrementalStrategy, LossContext};

#[derive(Debug, Clone)]
pub struct Finetune {
    freeze_backbone: bool,
}

impl Finetune {
    pub fn new(freeze_backbone: bool) -> Self {
        Self { freeze_backbone }
    }
}

impl<B: AutodiffBackend> IncrementalStrategy<B> for Finetune {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Finetune
    }

    fn uses_memory(&self) -> bool {
        false
    }

    fn trains_backbone(&self, task: usize) -> bool {
        !(self.freeze_backbone && task > 0)
    }

    fn loss(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
        _ctx: &LossContext<B>,
        _net: &IncrementalNet<B>,
    ) -> Tensor<B, 1> {
        distill::cross_entropy(logits, targets)
    }
}
