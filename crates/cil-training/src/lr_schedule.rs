//! Learning rate scheduling.
//!
//! Schedules are stepped once per epoch. Every task starts a fresh scheduler
//! from its own base rate (`init_lr` on the first task, `lr` afterwards).

use cil_core::{ScheduleKind, TrainingParams};
use std::f64::consts::PI;

/// Per-epoch learning rate policy of one task
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SchedulerType {
    #[default]
    Constant,

    /// Decay by `gamma` at each milestone epoch
    MultiStepLR { milestones: Vec<usize>, gamma: f64 },

    /// Half-cosine from the base rate down to `eta_min` over `t_max` epochs
    CosineAnnealingLR { t_max: usize, eta_min: f64 },
}

impl SchedulerType {
    /// Schedule, base rate and epoch count for a task.
    pub fn for_task(params: &TrainingParams, first_task: bool) -> (Self, f64, usize) {
        let (lr, epochs, milestones) = if first_task {
            (params.init_lr, params.init_epochs, &params.init_milestones)
        } else {
            (params.lr, params.epochs, &params.milestones)
        };
        let schedule = match params.schedule {
            ScheduleKind::Constant => SchedulerType::Constant,
            ScheduleKind::MultiStep => SchedulerType::MultiStepLR {
                milestones: milestones.clone(),
                gamma: params.lr_decay,
            },
            ScheduleKind::Cosine => SchedulerType::CosineAnnealingLR {
                t_max: epochs,
                eta_min: 0.0,
            },
        };
        (schedule, lr, epochs)
    }
}

#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    schedule: SchedulerType,
    base_lr: f64,
    lr: f64,
    epoch: usize,
}

impl LearningRateScheduler {
    pub fn new(schedule: SchedulerType, base_lr: f64) -> Self {
        Self {
            schedule,
            base_lr,
            lr: base_lr,
            epoch: 0,
        }
    }

    /// Rate for the epoch about to run
    pub fn get_lr(&self) -> f64 {
        self.lr
    }

    /// Epochs completed so far
    pub fn current_epoch(&self) -> usize {
        self.epoch
    }

    /// Advance past one finished epoch.
    pub fn step(&mut self) {
        self.epoch += 1;
        self.lr = match &self.schedule {
            SchedulerType::Constant => self.base_lr,
            SchedulerType::MultiStepLR { milestones, gamma } => {
                let passed = milestones.iter().filter(|&&m| m <= self.epoch).count();
                self.base_lr * gamma.powi(passed as i32)
            }
            SchedulerType::CosineAnnealingLR { t_max, eta_min } => {
                let progress = (self.epoch as f64 / (*t_max).max(1) as f64).min(1.0);
                eta_min + (self.base_lr - eta_min) * (1.0 + (progress * PI).cos()) / 2.0
            }
        };
    }
}
