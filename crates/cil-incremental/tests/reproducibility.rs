//! Same seed, same run.
//!
//! Kept in its own test binary: the NdArray generator is process-wide, and
//! concurrent tests drawing from it would interleave with these runs.

use burn::backend::{Autodiff, NdArray};
use cil_core::{DataConfig, RunConfig};
use cil_dataset::{load_dataset, DataManager, SampleRef};
use cil_incremental::IncrementalTrainer;

type B = Autodiff<NdArray>;

fn config() -> RunConfig {
    let mut config = RunConfig::default();
    config.model_name = "icarl".to_string();
    config.init_cls = 2;
    config.increment = 2;
    config.data = DataConfig::Synthetic {
        num_classes: 4,
        train_per_class: 20,
        test_per_class: 5,
        dim: 6,
        separation: 3.0,
        noise: 0.8,
        seed: 5,
    };
    config.network.hidden_dim = 16;
    config.network.feature_dim = 8;
    config.training.batch_size = 8;
    config.training.init_epochs = 2;
    config.training.epochs = 2;
    config.memory.memory_size = 12;
    config
}

struct RunTrace {
    exemplars: Vec<Vec<SampleRef>>,
    cnn_top1: Vec<f64>,
    nme_top1: Vec<f64>,
}

fn run(seed: u64) -> RunTrace {
    let config = config();
    let data = DataManager::new(
        load_dataset(&config).unwrap(),
        true,
        seed,
        config.init_cls,
        config.increment,
    )
    .unwrap();
    let mut trainer =
        IncrementalTrainer::<B>::new(&config, data.input_shape(), seed, Default::default())
            .unwrap();

    let mut trace = RunTrace {
        exemplars: Vec::new(),
        cnn_top1: Vec::new(),
        nme_top1: Vec::new(),
    };
    for task in data.tasks() {
        let task = task.unwrap();
        trainer.incremental_train(&task, &data).unwrap();
        let (cnn, nme) = trainer.eval_task(&task, &data).unwrap();
        trace.cnn_top1.push(cnn.top1);
        trace.nme_top1.push(nme.unwrap().top1);
        trainer.after_task().unwrap();
    }
    trace.exemplars = (0..4)
        .map(|class| trainer.memory().exemplars(class).unwrap().to_vec())
        .collect();
    trace
}

#[test]
fn test_same_seed_reproduces_exemplars_and_curves() {
    let first = run(1);
    let second = run(1);
    assert_eq!(first.exemplars, second.exemplars);
    assert_eq!(first.cnn_top1, second.cnn_top1);
    assert_eq!(first.nme_top1, second.nme_top1);
}
