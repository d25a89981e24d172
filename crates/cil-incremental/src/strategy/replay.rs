//! Rehearsal strategies.
//!
//! Both variants train on the new task's samples mixed with the exemplar
//! memory. iCaRL adds a distillation term that keeps the old-class logits
//! close to those of the network frozen before the task.

use burn::tensor::{backend::AutodiffBackend, Int, Tensor};
use cil_core::{DistillSchedule, StrategyKind};
use cil_training::IncrementalNet;

use super::{distill, IncrementalStrategy, LossContext};

#[derive(Debug, Clone)]
struct Distillation {
    temperature: f64,
    schedule: DistillSchedule,
}

#[derive(Debug, Clone)]
pub struct Replay {
    distillation: Option<Distillation>,
}

impl Replay {
    /// Exemplar rehearsal with cross-entropy only
    pub fn plain() -> Self {
        Self { distillation: None }
    }

    /// Rehearsal plus knowledge distillation
    pub fn icarl(temperature: f64, schedule: DistillSchedule) -> Self {
        Self {
            distillation: Some(Distillation {
                temperature,
                schedule,
            }),
        }
    }
}

impl<B: AutodiffBackend> IncrementalStrategy<B> for Replay {
    fn kind(&self) -> StrategyKind {
        if self.distillation.is_some() {
            StrategyKind::Icarl
        } else {
            StrategyKind::Replay
        }
    }

    fn uses_memory(&self) -> bool {
        true
    }

    fn needs_old_logits(&self) -> bool {
        self.distillation.is_some()
    }

    fn loss(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
        ctx: &LossContext<B>,
        _net: &IncrementalNet<B>,
    ) -> Tensor<B, 1> {
        let ce = distill::cross_entropy(logits.clone(), targets);
        match (&self.distillation, &ctx.old_logits) {
            (Some(kd), Some(old)) if !ctx.is_first_task() => {
                let weight = kd.schedule.weight(ctx.known_classes, ctx.total_classes);
                let current = distill::old_class_logits(logits, ctx.known_classes);
                ce + distill::kd_loss(current, old.clone(), kd.temperature).mul_scalar(weight)
            }
            _ => ce,
        }
    }
}
