//! Incremental learning strategies.
//!
//! A strategy decides which samples a task trains on (new data only, or new
//! data plus exemplars), how the loss is formed, and what it keeps between
//! tasks. The trainer owns the network, the optimizer and the memory; the
//! strategy only shapes the objective.

pub mod distill;
mod ewc;
mod finetune;
mod lwf;
mod replay;

pub use ewc::Ewc;
pub use finetune::Finetune;
pub use lwf::Lwf;
pub use replay::Replay;

use burn::tensor::{backend::AutodiffBackend, Int, Tensor};
use cil_core::{Result, StrategyKind, StrategyParams};
use cil_dataset::SampleBatch;
use cil_training::IncrementalNet;

/// What a loss term knows about the task being learned.
#[derive(Debug, Clone)]
pub struct LossContext<B: AutodiffBackend> {
    pub task: usize,
    /// Classes learned before this task
    pub known_classes: usize,
    /// Classes seen once this task is learned
    pub total_classes: usize,
    /// Logits of the frozen pre-task network on the same batch, outside the graph
    pub old_logits: Option<Tensor<B, 2>>,
}

impl<B: AutodiffBackend> LossContext<B> {
    pub fn is_first_task(&self) -> bool {
        self.known_classes == 0
    }
}

/// Capability interface of an incremental learning method.
pub trait IncrementalStrategy<B: AutodiffBackend> {
    fn kind(&self) -> StrategyKind;

    /// Whether the method keeps an exemplar memory (and so has an NME classifier).
    fn uses_memory(&self) -> bool;

    /// Whether [`LossContext::old_logits`] must be filled on later tasks.
    fn needs_old_logits(&self) -> bool {
        false
    }

    /// Whether backbone gradients flow while learning `task`.
    fn trains_backbone(&self, _task: usize) -> bool {
        true
    }

    /// Training objective for one mini-batch.
    fn loss(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
        ctx: &LossContext<B>,
        net: &IncrementalNet<B>,
    ) -> Tensor<B, 1>;

    /// Whether [`after_train`](Self::after_train) wants the task's batches.
    fn needs_task_batches(&self) -> bool {
        false
    }

    /// Hook run after the last epoch of a task, with the task's own batches
    /// when [`needs_task_batches`](Self::needs_task_batches) asks for them.
    fn after_train(
        &mut self,
        _net: &IncrementalNet<B>,
        _ctx: &LossContext<B>,
        _batches: &[SampleBatch<B>],
    ) -> Result<()> {
        Ok(())
    }
}

/// Build the strategy named by `kind`.
pub fn build_strategy<B: AutodiffBackend>(
    kind: StrategyKind,
    params: &StrategyParams,
) -> Box<dyn IncrementalStrategy<B>> {
    match kind {
        StrategyKind::Finetune => Box::new(Finetune::new(params.freeze_backbone)),
        StrategyKind::Replay => Box::new(Replay::plain()),
        StrategyKind::Icarl => Box::new(Replay::icarl(params.temperature, params.icarl_distill)),
        StrategyKind::Lwf => Box::new(Lwf::new(params.temperature, params.lwf_distill)),
        StrategyKind::Ewc => Box::new(Ewc::<B>::new(params.ewc_lambda, params.fisher_max)),
    }
}
