//! End-to-end runs of the experiment driver on small synthetic data.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::Path;

use burn::backend::{Autodiff, NdArray};
use burn::tensor::{Int, Tensor};
use cil_core::{DataConfig, Error, LogFileSink, Result, RunConfig, RunPaths, StrategyKind};
use cil_dataset::{load_dataset, DataManager, SampleBatch};
use cil_incremental::{
    build_strategy, ExperimentDriver, IncrementalStrategy, IncrementalTrainer, LossContext,
    TrainerPhase, Tracker,
};
use cil_training::{Checkpoint, IncrementalNet};

type B = Autodiff<NdArray>;

fn config(model_name: &str, log_dir: &Path) -> RunConfig {
    let mut config = RunConfig::default();
    config.model_name = model_name.to_string();
    config.dataset = "toy".to_string();
    config.init_cls = 2;
    config.increment = 1;
    config.seed = vec![1, 3];
    config.data = DataConfig::Synthetic {
        num_classes: 4,
        train_per_class: 10,
        test_per_class: 4,
        dim: 5,
        separation: 5.0,
        noise: 0.2,
        seed: 11,
    };
    config.network.hidden_dim = 12;
    config.network.feature_dim = 6;
    config.training.batch_size = 8;
    config.training.init_epochs = 2;
    config.training.epochs = 1;
    config.memory.memory_size = 8;
    config.output.log_dir = log_dir.to_path_buf();
    config
}

struct BrokenTracker;

impl Tracker for BrokenTracker {
    fn start_run(&mut self, _project: Option<&str>, _run_name: &str) -> Result<()> {
        Err(Error::Tracking("dashboard offline".to_string()))
    }

    fn log_metrics(&mut self, _task: usize, _metrics: &BTreeMap<String, f64>) -> Result<()> {
        Err(Error::Tracking("dashboard offline".to_string()))
    }

    fn finish(&mut self) -> Result<()> {
        Err(Error::Tracking("dashboard offline".to_string()))
    }
}

/// Delegates to a real strategy, but the backend "dies" on `fail_on_task`:
/// inside the training loop, or while the driver prepares that task.
struct DeviceLostOnTask {
    inner: Box<dyn IncrementalStrategy<B>>,
    fail_on_task: usize,
    outside_training: bool,
}

impl DeviceLostOnTask {
    fn new(config: &RunConfig, fail_on_task: usize) -> Self {
        Self {
            inner: build_strategy(config.strategy_kind().unwrap(), &config.strategy),
            fail_on_task,
            outside_training: false,
        }
    }

    fn outside_training(mut self) -> Self {
        self.outside_training = true;
        self
    }
}

impl IncrementalStrategy<B> for DeviceLostOnTask {
    fn kind(&self) -> StrategyKind {
        self.inner.kind()
    }

    fn uses_memory(&self) -> bool {
        self.inner.uses_memory()
    }

    fn needs_old_logits(&self) -> bool {
        self.inner.needs_old_logits()
    }

    fn trains_backbone(&self, task: usize) -> bool {
        if self.outside_training && task == self.fail_on_task {
            panic!("device lost");
        }
        self.inner.trains_backbone(task)
    }

    fn loss(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
        ctx: &LossContext<B>,
        net: &IncrementalNet<B>,
    ) -> Tensor<B, 1> {
        if !self.outside_training && ctx.task == self.fail_on_task {
            panic!("device lost");
        }
        self.inner.loss(logits, targets, ctx, net)
    }

    fn needs_task_batches(&self) -> bool {
        self.inner.needs_task_batches()
    }

    fn after_train(
        &mut self,
        net: &IncrementalNet<B>,
        ctx: &LossContext<B>,
        batches: &[SampleBatch<B>],
    ) -> Result<()> {
        self.inner.after_train(net, ctx, batches)
    }
}

#[test]
fn test_icarl_run_records_one_entry_per_task() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config("icarl", dir.path());
    config.tracking_project = Some("cil-tests".to_string());

    let sink = LogFileSink::new();
    let summary = ExperimentDriver::<B>::new(config.clone(), Default::default())
        .with_log_sink(sink)
        .with_progress(false)
        .run()
        .unwrap();

    assert!(summary.all_succeeded());
    assert_eq!(summary.outcomes.len(), 2);
    for outcome in &summary.outcomes {
        // 2 + 1 + 1 classes
        assert_eq!(outcome.tasks_completed, 3);
        assert_eq!(outcome.curves.cnn.len(), 3);
        assert_eq!(outcome.curves.nme.len(), 3);
        assert!(outcome.average_cnn_top1().is_some());

        let paths = RunPaths::new(&config, outcome.seed);
        assert!(paths.log_file().exists());
        let metrics = std::fs::read_to_string(paths.metrics_file()).unwrap();
        assert_eq!(metrics.lines().count(), 3);

        let checkpoint = Checkpoint::load(&paths.checkpoint_file(2)).unwrap();
        assert_eq!(checkpoint.metadata.num_classes, 4);
        assert!(checkpoint.params.contains_key("fc1.weight"));
        assert!(!checkpoint.params.keys().any(|k| k.starts_with("convnet.")));
        // Only the final task is exported by default.
        assert!(!paths.checkpoint_file(0).exists());
    }
    assert!(summary.mean_cnn_top1().is_some());
}

#[test]
fn test_exemplar_free_run_has_no_nme_curve() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config("lwf", dir.path());
    config.seed = vec![5];
    config.output.save_checkpoint = false;

    let summary = ExperimentDriver::<B>::new(config, Default::default())
        .with_progress(false)
        .run()
        .unwrap();

    let outcome = &summary.outcomes[0];
    assert!(outcome.succeeded());
    assert_eq!(outcome.curves.cnn.len(), 3);
    assert!(outcome.curves.nme.is_empty());
    assert!(outcome.average_nme_top1().is_none());
}

#[test]
fn test_tracking_failures_do_not_abort_training() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config("ewc", dir.path());
    config.seed = vec![2];
    config.output.save_every_task = true;

    let summary = ExperimentDriver::<B>::new(config.clone(), Default::default())
        .with_tracker(|_, _| -> Box<dyn Tracker> { Box::new(BrokenTracker) })
        .with_progress(false)
        .run()
        .unwrap();

    assert!(summary.all_succeeded());
    assert!(summary.failed_seeds().is_empty());
    let paths = RunPaths::new(&config, 2);
    for task in 0..3 {
        assert!(paths.checkpoint_file(task).exists());
    }
}

#[test]
fn test_invalid_partition_stops_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config("replay", dir.path());
    config.init_cls = 9;

    let result = ExperimentDriver::<B>::new(config, Default::default())
        .with_progress(false)
        .run();
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_repetitions_do_not_share_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = config("replay", dir.path());
    let dataset = load_dataset(&config).unwrap();

    let first_data = DataManager::new(dataset.clone(), true, 1, 2, 1).unwrap();
    let mut first =
        IncrementalTrainer::<B>::new(&config, first_data.input_shape(), 1, Default::default())
            .unwrap();
    for task in first_data.tasks() {
        let task = task.unwrap();
        first.incremental_train(&task, &first_data).unwrap();
        first.eval_task(&task, &first_data).unwrap();
        first.after_task().unwrap();
    }
    assert_eq!(first.memory().num_classes(), 4);

    // A fresh repetition starts from nothing, whatever the previous one did.
    let second_data = DataManager::new(dataset, true, 3, 2, 1).unwrap();
    let second =
        IncrementalTrainer::<B>::new(&config, second_data.input_shape(), 3, Default::default())
            .unwrap();
    assert!(second.memory().is_empty());
    assert!(second.network().is_none());
    assert_eq!(second.known_classes(), 0);

    // Same seed, same curriculum.
    let again = DataManager::new(load_dataset(&config).unwrap(), true, 1, 2, 1).unwrap();
    assert_eq!(again.class_order(), first_data.class_order());
}

#[test]
fn test_failed_task_keeps_previous_memory() {
    let dir = tempfile::tempdir().unwrap();
    let config = config("icarl", dir.path());
    let data = DataManager::new(load_dataset(&config).unwrap(), true, 1, 2, 1).unwrap();
    let strategy = Box::new(DeviceLostOnTask::new(&config, 1));
    let mut trainer = IncrementalTrainer::<B>::with_strategy(
        &config,
        data.input_shape(),
        1,
        Default::default(),
        strategy,
    )
    .unwrap();

    let first = data.task(0).unwrap();
    trainer.incremental_train(&first, &data).unwrap();
    trainer.eval_task(&first, &data).unwrap();
    trainer.after_task().unwrap();
    let before = trainer.memory().exemplar_refs();
    assert_eq!(trainer.memory().num_classes(), 2);

    let second = data.task(1).unwrap();
    let result = trainer.incremental_train(&second, &data);
    assert!(matches!(result, Err(Error::Device(ref msg)) if msg.contains("device lost")));
    assert_eq!(trainer.phase(), TrainerPhase::Failed);
    assert_eq!(trainer.memory().exemplar_refs(), before);
    assert!(matches!(
        trainer.eval_task(&second, &data),
        Err(Error::IncrementalLearning(_))
    ));
}

#[test]
fn test_device_failure_ends_only_its_seed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config("icarl", dir.path());
    config.tracking_project = Some("cil-tests".to_string());
    config.output.save_checkpoint = false;

    // Only the first repetition loses its device, on its second task.
    let built = Cell::new(0usize);
    let summary = ExperimentDriver::<B>::new(config.clone(), Default::default())
        .with_strategy(move |config| -> Result<Box<dyn IncrementalStrategy<B>>> {
            built.set(built.get() + 1);
            if built.get() == 1 {
                Ok(Box::new(DeviceLostOnTask::new(config, 1)))
            } else {
                Ok(build_strategy(config.strategy_kind()?, &config.strategy))
            }
        })
        .with_progress(false)
        .run()
        .unwrap();

    assert_eq!(summary.failed_seeds(), vec![1]);
    let failed = &summary.outcomes[0];
    assert!(failed.device_failure);
    assert_eq!(failed.tasks_completed, 1);
    assert_eq!(failed.curves.cnn.len(), 1);
    let metrics = std::fs::read_to_string(RunPaths::new(&config, 1).metrics_file()).unwrap();
    assert_eq!(metrics.lines().count(), 1);

    let next = &summary.outcomes[1];
    assert!(next.succeeded());
    assert!(!next.device_failure);
    assert_eq!(next.tasks_completed, 3);
}

#[test]
fn test_panic_outside_training_ends_only_its_seed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config("replay", dir.path());
    config.output.save_checkpoint = false;

    let built = Cell::new(0usize);
    let summary = ExperimentDriver::<B>::new(config, Default::default())
        .with_strategy(move |config| -> Result<Box<dyn IncrementalStrategy<B>>> {
            built.set(built.get() + 1);
            let strategy = DeviceLostOnTask::new(config, 2);
            if built.get() == 1 {
                Ok(Box::new(strategy.outside_training()))
            } else {
                Ok(Box::new(DeviceLostOnTask {
                    fail_on_task: usize::MAX,
                    ..strategy
                }))
            }
        })
        .with_progress(false)
        .run()
        .unwrap();

    let failed = &summary.outcomes[0];
    assert!(failed.device_failure);
    assert!(failed.error.as_deref().unwrap().contains("device lost"));
    assert_eq!(failed.tasks_completed, 2);
    assert!(summary.outcomes[1].succeeded());
    assert_eq!(summary.outcomes[1].tasks_completed, 3);
}

#[test]
fn test_parameter_counts_logged_before_each_task() {
    use tracing_subscriber::{fmt, prelude::*};

    let dir = tempfile::tempdir().unwrap();
    let mut config = config("finetune", dir.path());
    config.seed = vec![4];
    config.output.save_checkpoint = false;

    let sink = LogFileSink::new();
    let subscriber = tracing_subscriber::registry().with(
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(sink.clone()),
    );
    let summary = tracing::subscriber::with_default(subscriber, || {
        ExperimentDriver::<B>::new(config.clone(), Default::default())
            .with_log_sink(sink)
            .with_progress(false)
            .run()
            .unwrap()
    });
    assert!(summary.all_succeeded());

    let log = std::fs::read_to_string(RunPaths::new(&config, 4).log_file()).unwrap();
    let counts: Vec<usize> = log
        .lines()
        .filter_map(|line| line.split("All params: ").nth(1))
        .map(|count| count.trim().parse().unwrap())
        .collect();
    // Backbone 5*12+12 + 12*6+6 = 150; each count shows the head of the
    // previous task, and nothing exists before the first one.
    assert_eq!(counts, vec![0, 150 + 6 * 2 + 2, 150 + 6 * 3 + 3]);
}
