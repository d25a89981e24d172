//! Labelled train/test data for one experiment.

use cil_core::{DataConfig, Error, InputShape, Result, RunConfig};
use tracing::info;

use crate::split::DataSplit;
use crate::{image_folder, synthetic};

/// Train and test splits sharing one label space.
#[derive(Debug, Clone)]
pub struct IncrementalDataset {
    name: String,
    class_names: Vec<String>,
    train: DataSplit,
    test: DataSplit,
}

impl IncrementalDataset {
    pub fn new(
        name: impl Into<String>,
        class_names: Vec<String>,
        train: DataSplit,
        test: DataSplit,
    ) -> Result<Self> {
        if train.shape() != test.shape() {
            return Err(Error::Dataset(format!(
                "train shape {:?} differs from test shape {:?}",
                train.shape(),
                test.shape()
            )));
        }
        let num_classes = class_names.len();
        let out_of_range = train
            .labels()
            .iter()
            .chain(test.labels())
            .find(|&&label| label >= num_classes);
        if let Some(label) = out_of_range {
            return Err(Error::Dataset(format!(
                "label {} outside {} classes",
                label, num_classes
            )));
        }
        Ok(Self {
            name: name.into(),
            class_names,
            train,
            test,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn input_shape(&self) -> InputShape {
        self.train.shape()
    }

    pub fn train(&self) -> &DataSplit {
        &self.train
    }

    pub fn test(&self) -> &DataSplit {
        &self.test
    }

    pub(crate) fn into_parts(self) -> (String, Vec<String>, DataSplit, DataSplit) {
        (self.name, self.class_names, self.train, self.test)
    }
}

/// Build the dataset described by the configuration's data section.
pub fn load_dataset(config: &RunConfig) -> Result<IncrementalDataset> {
    let dataset = match &config.data {
        DataConfig::Synthetic {
            num_classes,
            train_per_class,
            test_per_class,
            dim,
            separation,
            noise,
            seed,
        } => synthetic::generate(
            &config.dataset,
            &synthetic::SyntheticSpec {
                num_classes: *num_classes,
                train_per_class: *train_per_class,
                test_per_class: *test_per_class,
                dim: *dim,
                separation: *separation,
                noise: *noise,
                seed: *seed,
            },
        )?,
        DataConfig::ImageFolder { root, image_size } => {
            image_folder::load(&config.dataset, root, *image_size)?
        }
    };
    info!(
        "Dataset {}: {} classes, {} train / {} test samples",
        dataset.name(),
        dataset.num_classes(),
        dataset.train().len(),
        dataset.test().len()
    );
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_label_outside_class_names() {
        let train = DataSplit::new(InputShape::Flat(1), vec![0.0, 1.0], vec![0, 2]).unwrap();
        let test = DataSplit::new(InputShape::Flat(1), vec![0.0], vec![0]).unwrap();
        let result = IncrementalDataset::new("bad", vec!["a".into(), "b".into()], train, test);
        assert!(matches!(result, Err(Error::Dataset(_))));
    }

    #[test]
    fn test_load_default_synthetic() {
        let config = RunConfig::default();
        let data = load_dataset(&config).unwrap();
        assert_eq!(data.num_classes(), 10);
        assert_eq!(data.input_shape(), InputShape::Flat(16));
    }
}
