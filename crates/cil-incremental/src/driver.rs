//! Experiment driver.
//!
//! Runs one independent repetition per configured seed. Each repetition
//! builds its own data manager, trainer, memory and tracker, walks the tasks
//! in order and records the accuracy curves. A failure ends only the
//! repetition it happens in; the summary tells which seeds failed.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use burn::{module::AutodiffModule, tensor::backend::AutodiffBackend};
use cil_core::{
    log_config, tracking_metrics, AccuracyReport, CurveSet, Error, LogFileSink, Result, RunConfig,
    RunPaths,
};
use cil_dataset::{load_dataset, task_increments, DataManager, IncrementalDataset, Task};
use cil_training::{save_model_record, Checkpoint, CheckpointMetadata, ParamNameTranslator};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::strategy::{build_strategy, IncrementalStrategy};
use crate::tracker::{JsonlTracker, NoopTracker, Tracker};
use crate::trainer::{panic_message, IncrementalTrainer};

/// Result of one repetition.
#[derive(Debug, Clone, Serialize)]
pub struct SeedOutcome {
    pub seed: u64,
    pub curves: CurveSet,
    /// Tasks whose metrics were recorded before the repetition ended
    pub tasks_completed: usize,
    pub error: Option<String>,
    /// The repetition was aborted by a compute-device failure
    pub device_failure: bool,
}

impl SeedOutcome {
    fn new(seed: u64) -> Self {
        Self {
            seed,
            curves: CurveSet::default(),
            tasks_completed: 0,
            error: None,
            device_failure: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Average incremental top-1 accuracy of the head classifier.
    pub fn average_cnn_top1(&self) -> Option<f64> {
        self.curves.cnn.average_top1()
    }

    pub fn average_nme_top1(&self) -> Option<f64> {
        self.curves.nme.average_top1()
    }
}

/// Outcomes of every repetition, in seed order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub outcomes: Vec<SeedOutcome>,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(SeedOutcome::succeeded)
    }

    pub fn failed_seeds(&self) -> Vec<u64> {
        self.outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.seed)
            .collect()
    }

    /// Mean over successful seeds of the average incremental CNN top-1.
    pub fn mean_cnn_top1(&self) -> Option<f64> {
        let values: Vec<f64> = self
            .outcomes
            .iter()
            .filter(|o| o.succeeded())
            .filter_map(SeedOutcome::average_cnn_top1)
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }
}

type TrackerFactory = Box<dyn Fn(&RunConfig, &RunPaths) -> Box<dyn Tracker>>;
type StrategyFactory<B> = Box<dyn Fn(&RunConfig) -> Result<Box<dyn IncrementalStrategy<B>>>>;

fn default_tracker(config: &RunConfig, paths: &RunPaths) -> Box<dyn Tracker> {
    if config.tracking_project.is_some() {
        Box::new(JsonlTracker::new(paths.metrics_file()))
    } else {
        Box::new(NoopTracker)
    }
}

pub struct ExperimentDriver<B: AutodiffBackend> {
    config: RunConfig,
    device: B::Device,
    log_sink: Option<LogFileSink>,
    tracker_factory: TrackerFactory,
    strategy_factory: StrategyFactory<B>,
    show_progress: bool,
}

impl<B: AutodiffBackend> ExperimentDriver<B> {
    pub fn new(config: RunConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            log_sink: None,
            tracker_factory: Box::new(default_tracker),
            strategy_factory: Box::new(|config: &RunConfig| {
                Ok(build_strategy::<B>(config.strategy_kind()?, &config.strategy))
            }),
            show_progress: true,
        }
    }

    /// Redirect the file log layer to each repetition's log file.
    pub fn with_log_sink(mut self, sink: LogFileSink) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn with_tracker<F>(mut self, factory: F) -> Self
    where
        F: Fn(&RunConfig, &RunPaths) -> Box<dyn Tracker> + 'static,
    {
        self.tracker_factory = Box::new(factory);
        self
    }

    /// Replace the strategy built from `model_name`; called once per repetition.
    pub fn with_strategy<F>(mut self, factory: F) -> Self
    where
        F: Fn(&RunConfig) -> Result<Box<dyn IncrementalStrategy<B>>> + 'static,
    {
        self.strategy_factory = Box::new(factory);
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run every seed. Configuration problems fail the whole run before any
    /// training; anything later only ends the affected repetition.
    pub fn run(&self) -> Result<RunSummary> {
        self.config.validate()?;
        let dataset = load_dataset(&self.config)?;
        task_increments(dataset.num_classes(), self.config.init_cls, self.config.increment)?;

        let mut summary = RunSummary::default();
        for &seed in &self.config.seed {
            let mut outcome = SeedOutcome::new(seed);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                self.run_seed(seed, dataset.clone(), &mut outcome)
            }))
            .unwrap_or_else(|payload| Err(Error::Device(panic_message(payload))));
            if let Err(err) = result {
                outcome.device_failure = err.is_device_failure();
                if outcome.device_failure {
                    error!("Seed {} aborted by a device failure: {}", seed, err);
                } else {
                    error!("Seed {} failed: {}", seed, err);
                }
                outcome.error = Some(err.to_string());
            }
            summary.outcomes.push(outcome);
        }

        if let Some(sink) = &self.log_sink {
            sink.close();
        }
        Ok(summary)
    }

    fn progress_bar(&self, tasks: usize, seed: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let progress = ProgressBar::new(tasks as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template(&format!("[seed {}] {{bar:40.cyan/blue}} {{pos}}/{{len}} tasks", seed))
        {
            progress.set_style(style.progress_chars("=>-"));
        }
        progress
    }

    fn run_seed(&self, seed: u64, dataset: IncrementalDataset, outcome: &mut SeedOutcome) -> Result<()> {
        let config = &self.config;
        let paths = RunPaths::new(config, seed);
        if let Some(sink) = &self.log_sink {
            sink.switch_to(&paths.log_file())?;
        }
        log_config(config)?;
        info!("Seed: {}", seed);

        let data = DataManager::new(
            dataset,
            config.shuffle,
            seed,
            config.init_cls,
            config.increment,
        )?;
        let strategy = (self.strategy_factory)(config)?;
        let mut trainer = IncrementalTrainer::<B>::with_strategy(
            config,
            data.input_shape(),
            seed,
            self.device.clone(),
            strategy,
        )?;

        let mut tracker = (self.tracker_factory)(config, &paths);
        if let Err(err) = tracker.start_run(config.tracking_project.as_deref(), paths.stem()) {
            warn!("Tracking unavailable: {}", err);
        }

        let progress = self.progress_bar(data.nb_tasks(), seed);
        let result = self.run_tasks(&data, &mut trainer, tracker.as_mut(), &paths, outcome, &progress);
        progress.finish_and_clear();
        if let Err(err) = tracker.finish() {
            warn!("Failed to close tracking run: {}", err);
        }
        result?;

        if let Some(avg) = outcome.average_cnn_top1() {
            info!("Average Accuracy (CNN): {:.2}", avg);
        }
        if let Some(avg) = outcome.average_nme_top1() {
            info!("Average Accuracy (NME): {:.2}", avg);
        }
        Ok(())
    }

    fn run_tasks(
        &self,
        data: &DataManager,
        trainer: &mut IncrementalTrainer<B>,
        tracker: &mut dyn Tracker,
        paths: &RunPaths,
        outcome: &mut SeedOutcome,
        progress: &ProgressBar,
    ) -> Result<()> {
        let last_task = data.nb_tasks().saturating_sub(1);
        for task in data.tasks() {
            let task = task?;
            info!("All params: {}", trainer.count_parameters(false));
            info!("Trainable params: {}", trainer.count_parameters(true));
            trainer.incremental_train(&task, data)?;
            let (cnn, nme) = trainer.eval_task(&task, data)?;
            trainer.after_task()?;

            outcome.curves.record(&cnn, nme.as_ref());
            outcome.tasks_completed = outcome.curves.tasks_completed();
            log_task_accuracy(&outcome.curves, &cnn, nme.as_ref());

            if let Err(err) = tracker.log_metrics(task.index, &tracking_metrics(&cnn, nme.as_ref())) {
                warn!("Failed to push metrics for task {}: {}", task.index, err);
            }

            let output = &self.config.output;
            if output.save_checkpoint && (task.index == last_task || output.save_every_task) {
                self.export_checkpoint(trainer, data, &task, outcome.seed, paths)?;
            }
            progress.inc(1);
        }
        Ok(())
    }

    fn export_checkpoint(
        &self,
        trainer: &IncrementalTrainer<B>,
        data: &DataManager,
        task: &Task,
        seed: u64,
        paths: &RunPaths,
    ) -> Result<PathBuf> {
        let net = trainer
            .network()
            .ok_or_else(|| Error::Model("no network to export".to_string()))?
            .valid();
        let metadata = CheckpointMetadata {
            model_name: self.config.model_name.clone(),
            convnet_type: self.config.convnet_type.clone(),
            dataset: self.config.dataset.clone(),
            seed,
            task: task.index,
            num_classes: net.num_classes(),
            num_parameters: trainer.count_parameters(false),
            class_order: data.class_order().to_vec(),
        };
        let path = paths.checkpoint_file(task.index);
        Checkpoint::from_net(&net, &ParamNameTranslator::standard_backbone(), metadata)?
            .save(&path)?;
        save_model_record(&net, &paths.model_record(task.index))?;
        Ok(path)
    }
}

fn log_task_accuracy(curves: &CurveSet, cnn: &AccuracyReport, nme: Option<&AccuracyReport>) {
    info!("CNN: {:?}", cnn.grouped);
    match nme {
        Some(nme) => {
            info!("NME: {:?}", nme.grouped);
            info!("CNN top1 curve: {:?}", curves.cnn.top1);
            info!("CNN top5 curve: {:?}", curves.cnn.top5);
            info!("NME top1 curve: {:?}", curves.nme.top1);
            info!("NME top5 curve: {:?}", curves.nme.top5);
        }
        None => {
            info!("No NME accuracy.");
            info!("CNN top1 curve: {:?}", curves.cnn.top1);
            info!("CNN top5 curve: {:?}", curves.cnn.top5);
        }
    }
}
