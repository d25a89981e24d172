//! Learning without Forgetting.
//!
//! No exemplars. Later tasks learn the new classes through their own slice of
//! the head while distillation on the old slice preserves earlier answers.

use burn::tensor::{backend::AutodiffBackend, Int, Tensor};
use cil_core::{DistillSchedule, StrategyKind};
use cil_training::IncrementalNet;

use super::{distill, IncrementalStrategy, LossContext};

#[derive(Debug, Clone)]
pub struct Lwf {
    temperature: f64,
    schedule: DistillSchedule,
}

impl Lwf {
    pub fn new(temperature: f64, schedule: DistillSchedule) -> Self {
        Self {
            temperature,
            schedule,
        }
    }
}

impl<B: AutodiffBackend> IncrementalStrategy<B> for Lwf {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Lwf
    }

    fn uses_memory(&self) -> bool {
        false
    }

    fn needs_old_logits(&self) -> bool {
        true
    }

    fn loss(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
        ctx: &LossContext<B>,
        _net: &IncrementalNet<B>,
    ) -> Tensor<B, 1> {
        let Some(old) = ctx.old_logits.clone().filter(|_| !ctx.is_first_task()) else {
            return distill::cross_entropy(logits, targets);
        };
        let ce = distill::new_class_cross_entropy(logits.clone(), targets, ctx.known_classes);
        let kd = distill::kd_loss(
            distill::old_class_logits(logits, ctx.known_classes),
            old,
            self.temperature,
        );
        ce + kd.mul_scalar(self.schedule.weight(ctx.known_classes, ctx.total_classes))
    }
}
