//! Per-task training state machine.
//!
//! Each task walks `ExpandHead -> Train -> SelectExemplars -> Done`; the
//! driver then evaluates and calls [`IncrementalTrainer::after_task`] to go
//! back to `Idle`. Any failure leaves the trainer in `Failed`. Exemplar
//! selection works on a copy of the memory that replaces the live one only
//! once every new class has been processed, so a failed task never leaves
//! a half-updated memory behind.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use burn::{
    module::AutodiffModule,
    optim::{
        decay::WeightDecayConfig, momentum::MomentumConfig, AdamConfig, GradientsParams,
        Optimizer, SgdConfig,
    },
    tensor::{backend::AutodiffBackend, ElementConversion, Tensor},
};
use cil_core::{
    AccuracyReport, Error, InputShape, OptimizerType, Result, RunConfig, StrategyKind,
    TrainingParams,
};
use cil_dataset::{DataManager, SampleBatch, SampleRef, Task};
use cil_training::{
    accuracy, cnn_rankings, extract_features, nme_rankings, IncrementalNet,
    LearningRateScheduler, NetConfig, SchedulerType,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::memory::{ExemplarMemory, NetFeatureExtractor};
use crate::strategy::{build_strategy, IncrementalStrategy, LossContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    Idle,
    ExpandHead,
    Train,
    SelectExemplars,
    Done,
    Failed,
}

impl fmt::Display for TrainerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainerPhase::Idle => "IDLE",
            TrainerPhase::ExpandHead => "EXPAND_HEAD",
            TrainerPhase::Train => "TRAIN",
            TrainerPhase::SelectExemplars => "SELECT_EXEMPLARS",
            TrainerPhase::Done => "DONE",
            TrainerPhase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Loss and accuracy of one epoch
#[derive(Debug, Clone, Copy)]
pub struct EpochStats {
    pub loss: f64,
    pub accuracy: f64,
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "backend panicked without a message".to_string()
    }
}

/// Owns the network, the exemplar memory and the strategy of one repetition.
pub struct IncrementalTrainer<B: AutodiffBackend> {
    net_config: NetConfig,
    training: TrainingParams,
    strategy: Box<dyn IncrementalStrategy<B>>,
    memory: ExemplarMemory,
    net: Option<IncrementalNet<B>>,
    /// Frozen copy taken when the previous task reached `Done`
    old_net: Option<IncrementalNet<B::InnerBackend>>,
    phase: TrainerPhase,
    tasks_done: usize,
    known_classes: usize,
    total_classes: usize,
    /// Bumped whenever the weights change, keys the memory's class-mean cache
    weights_version: u64,
    rng: ChaCha8Rng,
    device: B::Device,
}

impl<B: AutodiffBackend> IncrementalTrainer<B> {
    /// Fresh trainer for one repetition. Seeds the backend generator, so weight
    /// initialisation follows `seed` as well.
    pub fn new(config: &RunConfig, input: InputShape, seed: u64, device: B::Device) -> Result<Self> {
        let strategy = build_strategy(config.strategy_kind()?, &config.strategy);
        Self::with_strategy(config, input, seed, device, strategy)
    }

    /// Like [`new`](Self::new), with a caller-supplied strategy.
    pub fn with_strategy(
        config: &RunConfig,
        input: InputShape,
        seed: u64,
        device: B::Device,
        strategy: Box<dyn IncrementalStrategy<B>>,
    ) -> Result<Self> {
        let net_config = NetConfig::new(config.backbone_kind()?, input)
            .with_hidden_dim(config.network.hidden_dim)
            .with_feature_dim(config.network.feature_dim)
            .with_base_channels(config.network.base_channels);
        net_config.validate()?;
        B::seed(seed);

        Ok(Self {
            net_config,
            training: config.training.clone(),
            strategy,
            memory: ExemplarMemory::new(config.memory_budget(), config.memory.selection),
            net: None,
            old_net: None,
            phase: TrainerPhase::Idle,
            tasks_done: 0,
            known_classes: 0,
            total_classes: 0,
            weights_version: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            device,
        })
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn memory(&self) -> &ExemplarMemory {
        &self.memory
    }

    pub fn network(&self) -> Option<&IncrementalNet<B>> {
        self.net.as_ref()
    }

    pub fn known_classes(&self) -> usize {
        self.known_classes
    }

    pub fn total_classes(&self) -> usize {
        self.total_classes
    }

    /// Parameters of the current network; with `trainable_only`, those the
    /// optimizer updates on the current task.
    pub fn count_parameters(&self, trainable_only: bool) -> usize {
        let frozen = trainable_only && !self.strategy.trains_backbone(self.tasks_done);
        self.net
            .as_ref()
            .map_or(0, |net| net.count_parameters(frozen))
    }

    fn expect_phase(&self, expected: TrainerPhase, operation: &str) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(Error::IncrementalLearning(format!(
                "{} requires phase {}, trainer is in {}",
                operation, expected, self.phase
            )))
        }
    }

    /// Learn one task: expand the head, train, then select exemplars.
    pub fn incremental_train(&mut self, task: &Task, data: &DataManager) -> Result<()> {
        self.expect_phase(TrainerPhase::Idle, "incremental_train")?;
        if task.index != self.tasks_done || task.known_classes() != self.known_classes {
            return Err(Error::IncrementalLearning(format!(
                "task {} (classes {:?}) is out of order; expected task {} starting at class {}",
                task.index, task.new_classes, self.tasks_done, self.known_classes
            )));
        }

        let result = self.run_phases(task, data);
        if result.is_err() {
            self.phase = TrainerPhase::Failed;
        }
        result
    }

    fn run_phases(&mut self, task: &Task, data: &DataManager) -> Result<()> {
        self.phase = TrainerPhase::ExpandHead;
        self.expand_head(task)?;

        self.phase = TrainerPhase::Train;
        self.train(task, data)?;

        self.phase = TrainerPhase::SelectExemplars;
        self.select_exemplars(task, data)?;

        if self.strategy.needs_old_logits() {
            self.old_net = self.net.as_ref().map(|net| net.valid());
        }
        self.phase = TrainerPhase::Done;
        Ok(())
    }

    fn expand_head(&mut self, task: &Task) -> Result<()> {
        self.total_classes = task.total_classes();
        let net = match self.net.take() {
            None => IncrementalNet::new(&self.net_config, self.total_classes, &self.device)?,
            Some(net) => net.update_fc(self.total_classes, &self.device),
        };
        self.net = Some(net);
        info!(
            "Learning on {}-{}",
            self.known_classes, self.total_classes
        );
        Ok(())
    }

    /// Backend panics raised while training surface as [`Error::Device`].
    fn train(&mut self, task: &Task, data: &DataManager) -> Result<()> {
        let net = self.net.take().ok_or_else(|| {
            Error::IncrementalLearning("no network to train; head was not expanded".to_string())
        })?;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.fit(net, task, data)));
        match outcome {
            Ok(Ok(net)) => {
                self.net = Some(net);
                self.weights_version += 1;
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(payload) => Err(Error::Device(panic_message(payload))),
        }
    }

    fn fit(
        &mut self,
        net: IncrementalNet<B>,
        task: &Task,
        data: &DataManager,
    ) -> Result<IncrementalNet<B>> {
        let wd = WeightDecayConfig::new(self.training.weight_decay as f32);
        let net = match self.training.optimizer {
            OptimizerType::Adam => {
                let optimizer = AdamConfig::new().with_weight_decay(Some(wd)).init();
                self.run_epochs(net, optimizer, task, data)?
            }
            OptimizerType::Sgd => {
                let optimizer = SgdConfig::new()
                    .with_momentum(Some(
                        MomentumConfig::new().with_momentum(self.training.momentum),
                    ))
                    .with_weight_decay(Some(wd))
                    .init();
                self.run_epochs(net, optimizer, task, data)?
            }
        };

        if self.strategy.needs_task_batches() {
            let split = data.train_split();
            let batches: Vec<SampleBatch<B>> = task
                .train
                .chunks(self.training.batch_size.max(1))
                .map(|chunk| split.batch::<B>(chunk, &self.device))
                .collect();
            let ctx = self.loss_context(task, None);
            self.strategy.after_train(&net, &ctx, &batches)?;
        }
        Ok(net)
    }

    fn loss_context(&self, task: &Task, old_logits: Option<Tensor<B, 2>>) -> LossContext<B> {
        LossContext {
            task: task.index,
            known_classes: self.known_classes,
            total_classes: self.total_classes,
            old_logits,
        }
    }

    fn run_epochs<O>(
        &mut self,
        mut net: IncrementalNet<B>,
        mut optimizer: O,
        task: &Task,
        data: &DataManager,
    ) -> Result<IncrementalNet<B>>
    where
        O: Optimizer<IncrementalNet<B>, B>,
    {
        let (schedule, base_lr, epochs) = SchedulerType::for_task(&self.training, task.index == 0);
        let mut scheduler = LearningRateScheduler::new(schedule, base_lr);
        let split = data.train_split();

        let mut refs: Vec<SampleRef> = task.train.clone();
        if self.strategy.uses_memory() {
            refs.extend(self.memory.exemplar_refs().into_iter().map(|(r, _)| r));
        }
        if refs.is_empty() {
            return Err(Error::Training(format!(
                "task {} has no training samples",
                task.index
            )));
        }
        info!(
            "Training on {} samples ({} new, {} exemplars) for {} epochs",
            refs.len(),
            task.train.len(),
            refs.len() - task.train.len(),
            epochs
        );

        let trains_backbone = self.strategy.trains_backbone(task.index);
        let frozen = if self.strategy.needs_old_logits() {
            self.old_net.as_ref()
        } else {
            None
        };

        for epoch in 0..epochs {
            refs.shuffle(&mut self.rng);
            let mut total_loss = 0.0;
            let mut batches = 0usize;
            let mut correct = 0usize;
            let mut seen = 0usize;

            for chunk in refs.chunks(self.training.batch_size.max(1)) {
                let batch = split.batch::<B>(chunk, &self.device);
                let logits = if trains_backbone {
                    net.forward(batch.inputs.clone())
                } else {
                    net.forward_head_only(batch.inputs.clone())
                };
                let old_logits = frozen
                    .map(|old| Tensor::from_inner(old.forward(batch.inputs.clone().inner())));
                let ctx = self.loss_context(task, old_logits);

                let loss = self
                    .strategy
                    .loss(logits.clone(), batch.targets.clone(), &ctx, &net);
                let loss_value: f64 = loss.clone().into_scalar().elem();
                total_loss += loss_value;
                batches += 1;

                let predictions = logits.argmax(1).reshape([chunk.len()]);
                let batch_correct: i64 = predictions
                    .equal(batch.targets)
                    .int()
                    .sum()
                    .into_scalar()
                    .elem();
                correct += batch_correct as usize;
                seen += chunk.len();

                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &net);
                net = optimizer.step(scheduler.get_lr(), net, grads);
            }

            let stats = EpochStats {
                loss: total_loss / batches.max(1) as f64,
                accuracy: 100.0 * correct as f64 / seen.max(1) as f64,
            };
            if !stats.loss.is_finite() {
                return Err(Error::Training(format!(
                    "loss diverged at epoch {} of task {}",
                    epoch + 1,
                    task.index
                )));
            }
            debug!(
                "Task {}, Epoch {}/{} => Loss {:.3}, Train_accy {:.2}, lr {:.5}",
                task.index,
                epoch + 1,
                epochs,
                stats.loss,
                stats.accuracy,
                scheduler.get_lr()
            );
            scheduler.step();
        }
        Ok(net)
    }

    fn select_exemplars(&mut self, task: &Task, data: &DataManager) -> Result<()> {
        if !self.strategy.uses_memory() {
            return Ok(());
        }
        let net = self
            .net
            .as_ref()
            .ok_or_else(|| Error::IncrementalLearning("no trained network".to_string()))?
            .valid();
        let extractor = NetFeatureExtractor::new(
            &net,
            &self.device,
            self.training.batch_size,
            self.weights_version,
        );
        let split = data.train_split();

        let mut staged = self.memory.clone();
        let quota = staged.rebalance(task.total_classes());
        info!("Constructing exemplars ({} per class)", quota);
        for class in task.new_classes.clone() {
            let candidates = split.refs_where(|label| label == class);
            staged.select(class, &candidates, &extractor, split, quota, &mut self.rng)?;
        }

        debug!(
            "Exemplar memory: {} samples over {} classes",
            staged.total_count(),
            staged.num_classes()
        );
        self.memory = staged;
        Ok(())
    }

    /// Head accuracy and, when the strategy keeps exemplars, nearest-mean
    /// accuracy on the cumulative test set of `task`.
    pub fn eval_task(
        &mut self,
        task: &Task,
        data: &DataManager,
    ) -> Result<(AccuracyReport, Option<AccuracyReport>)> {
        self.expect_phase(TrainerPhase::Done, "eval_task")?;
        let net = self
            .net
            .as_ref()
            .ok_or_else(|| Error::IncrementalLearning("no trained network".to_string()))?
            .valid();
        let ranges = data.task_ranges();
        let ranges = &ranges[..=task.index.min(ranges.len().saturating_sub(1))];
        let split = data.test_split();
        let batch_size = self.training.batch_size;

        let (rankings, targets) = cnn_rankings(&net, split, &task.test, batch_size, &self.device)?;
        let cnn = accuracy(&rankings, &targets, ranges, task.known_classes());

        if !self.strategy.uses_memory() || self.memory.is_empty() {
            return Ok((cnn, None));
        }
        let extractor =
            NetFeatureExtractor::new(&net, &self.device, batch_size, self.weights_version);
        let means = self
            .memory
            .class_means(&extractor, data.train_split())?
            .clone();
        if means.is_empty() {
            return Ok((cnn, None));
        }
        let features = extract_features(&net, split, &task.test, batch_size, &self.device)?;
        let nme = accuracy(
            &nme_rankings(&features, &means),
            &targets,
            ranges,
            task.known_classes(),
        );
        Ok((cnn, Some(nme)))
    }

    /// Close the task: the classes just learned become known.
    pub fn after_task(&mut self) -> Result<()> {
        self.expect_phase(TrainerPhase::Done, "after_task")?;
        self.known_classes = self.total_classes;
        self.tasks_done += 1;
        self.phase = TrainerPhase::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use cil_core::{DataConfig, MemoryBudget, SelectionMethod};
    use cil_dataset::load_dataset;

    type B = Autodiff<NdArray>;

    fn config(model_name: &str) -> RunConfig {
        let mut config = RunConfig::default();
        config.model_name = model_name.to_string();
        config.init_cls = 2;
        config.increment = 2;
        config.data = DataConfig::Synthetic {
            num_classes: 4,
            train_per_class: 12,
            test_per_class: 4,
            dim: 6,
            separation: 4.0,
            noise: 0.3,
            seed: 3,
        };
        config.network.hidden_dim = 16;
        config.network.feature_dim = 8;
        config.training.batch_size = 8;
        config.training.init_epochs = 2;
        config.training.epochs = 2;
        config.memory.fixed_memory = false;
        config.memory.memory_size = 6;
        config.memory.selection = SelectionMethod::Herding;
        config
    }

    fn setup(model_name: &str) -> (IncrementalTrainer<B>, DataManager) {
        let config = config(model_name);
        let data = DataManager::new(
            load_dataset(&config).unwrap(),
            config.shuffle,
            7,
            config.init_cls,
            config.increment,
        )
        .unwrap();
        let trainer =
            IncrementalTrainer::<B>::new(&config, data.input_shape(), 7, Default::default())
                .unwrap();
        (trainer, data)
    }

    #[test]
    fn test_phases_follow_task_lifecycle() {
        let (mut trainer, data) = setup("icarl");
        let task = data.task(0).unwrap();
        assert_eq!(trainer.phase(), TrainerPhase::Idle);

        trainer.incremental_train(&task, &data).unwrap();
        assert_eq!(trainer.phase(), TrainerPhase::Done);
        assert_eq!(trainer.network().unwrap().num_classes(), 2);

        let (cnn, nme) = trainer.eval_task(&task, &data).unwrap();
        assert_eq!(cnn.num_samples, task.test.len());
        assert!(nme.is_some());

        trainer.after_task().unwrap();
        assert_eq!(trainer.phase(), TrainerPhase::Idle);
        assert_eq!(trainer.known_classes(), 2);
    }

    #[test]
    fn test_out_of_order_calls_are_rejected() {
        let (mut trainer, data) = setup("replay");
        assert!(matches!(
            trainer.after_task(),
            Err(Error::IncrementalLearning(_))
        ));
        let later = data.task(1).unwrap();
        assert!(matches!(
            trainer.incremental_train(&later, &data),
            Err(Error::IncrementalLearning(_))
        ));
        // A rejected call does not move the trainer out of Idle.
        assert_eq!(trainer.phase(), TrainerPhase::Idle);
    }

    #[test]
    fn test_head_grows_and_memory_respects_budget() {
        let (mut trainer, data) = setup("icarl");
        for task in data.tasks() {
            let task = task.unwrap();
            trainer.incremental_train(&task, &data).unwrap();
            assert_eq!(
                trainer.network().unwrap().num_classes(),
                task.total_classes()
            );
            assert!(trainer.memory().total_count() <= 6);
            trainer.eval_task(&task, &data).unwrap();
            trainer.after_task().unwrap();
        }
        assert_eq!(trainer.memory().num_classes(), 4);
        assert_eq!(trainer.memory().budget(), MemoryBudget::FixedTotal { total: 6 });
    }

    #[test]
    fn test_memoryless_strategy_reports_no_nme() {
        let (mut trainer, data) = setup("lwf");
        let task = data.task(0).unwrap();
        trainer.incremental_train(&task, &data).unwrap();
        let (_, nme) = trainer.eval_task(&task, &data).unwrap();
        assert!(nme.is_none());
        assert!(trainer.memory().is_empty());
    }

    #[test]
    fn test_frozen_backbone_counts_head_only() {
        let mut config = config("finetune");
        config.strategy.freeze_backbone = true;
        let data = DataManager::new(load_dataset(&config).unwrap(), false, 1, 2, 2).unwrap();
        let mut trainer =
            IncrementalTrainer::<B>::new(&config, data.input_shape(), 1, Default::default())
                .unwrap();

        let first = data.task(0).unwrap();
        trainer.incremental_train(&first, &data).unwrap();
        assert_eq!(trainer.count_parameters(true), trainer.count_parameters(false));
        trainer.after_task().unwrap();

        let second = data.task(1).unwrap();
        trainer.incremental_train(&second, &data).unwrap();
        // Head of 8 features by 4 classes, plus bias.
        assert_eq!(trainer.count_parameters(true), 8 * 4 + 4);
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(Box::new("out of memory")), "out of memory");
        assert_eq!(
            panic_message(Box::new(String::from("device lost"))),
            "device lost"
        );
        assert_eq!(
            panic_message(Box::new(3usize)),
            "backend panicked without a message"
        );
    }
}
