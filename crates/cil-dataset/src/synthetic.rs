//! Seeded Gaussian-cluster dataset.
//!
//! Every class gets a random centre in `[-separation, separation]^dim`;
//! samples are drawn around it with isotropic noise. Generation depends only
//! on the dataset seed, never on the repetition seed, so every repetition
//! sees the same data under a different class order.

use cil_core::{Error, InputShape, Result};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use tracing::debug;

use crate::dataset::IncrementalDataset;
use crate::split::DataSplit;

#[derive(Debug, Clone)]
pub struct SyntheticSpec {
    pub num_classes: usize,
    pub train_per_class: usize,
    pub test_per_class: usize,
    pub dim: usize,
    pub separation: f32,
    pub noise: f32,
    pub seed: u64,
}

pub fn generate(name: &str, spec: &SyntheticSpec) -> Result<IncrementalDataset> {
    if !spec.noise.is_finite() || spec.noise < 0.0 {
        return Err(Error::Config(format!(
            "synthetic noise must be a finite non-negative deviation, got {}",
            spec.noise
        )));
    }
    let noise = Normal::new(0.0f32, spec.noise)
        .map_err(|e| Error::Config(format!("invalid synthetic noise {}: {}", spec.noise, e)))?;
    let mut rng = ChaCha8Rng::seed_from_u64(spec.seed);

    let centres: Vec<Vec<f32>> = (0..spec.num_classes)
        .map(|_| {
            (0..spec.dim)
                .map(|_| rng.gen_range(-1.0f32..=1.0) * spec.separation)
                .collect()
        })
        .collect();

    let mut draw = |per_class: usize| -> Result<DataSplit> {
        let mut features = Vec::with_capacity(spec.num_classes * per_class * spec.dim);
        let mut labels = Vec::with_capacity(spec.num_classes * per_class);
        for (class, centre) in centres.iter().enumerate() {
            for _ in 0..per_class {
                features.extend(centre.iter().map(|&c| c + noise.sample(&mut rng)));
                labels.push(class);
            }
        }
        DataSplit::new(InputShape::Flat(spec.dim), features, labels)
    };

    let train = draw(spec.train_per_class)?;
    let test = draw(spec.test_per_class)?;
    debug!(
        "Generated synthetic dataset: {} classes, {} train / {} test samples",
        spec.num_classes,
        train.len(),
        test.len()
    );

    let class_names = (0..spec.num_classes)
        .map(|c| format!("class_{:02}", c))
        .collect();
    IncrementalDataset::new(name, class_names, train, test)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::SampleRef;

    fn spec(seed: u64) -> SyntheticSpec {
        SyntheticSpec {
            num_classes: 3,
            train_per_class: 4,
            test_per_class: 2,
            dim: 5,
            separation: 4.0,
            noise: 0.1,
            seed,
        }
    }

    #[test]
    fn test_sizes_and_labels() {
        let data = generate("blobs", &spec(1)).unwrap();
        assert_eq!(data.num_classes(), 3);
        assert_eq!(data.train().len(), 12);
        assert_eq!(data.test().len(), 6);
        assert_eq!(data.train().label(SampleRef(4)), 1);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let a = generate("blobs", &spec(9)).unwrap();
        let b = generate("blobs", &spec(9)).unwrap();
        let c = generate("blobs", &spec(10)).unwrap();
        assert_eq!(a.train().features(SampleRef(3)), b.train().features(SampleRef(3)));
        assert_ne!(a.train().features(SampleRef(3)), c.train().features(SampleRef(3)));
    }

    #[test]
    fn test_negative_noise_rejected() {
        let mut bad = spec(1);
        bad.noise = -1.0;
        assert!(matches!(generate("blobs", &bad), Err(Error::Config(_))));
        bad.noise = f32::NAN;
        assert!(matches!(generate("blobs", &bad), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_noise_puts_samples_on_centres() {
        let mut exact = spec(4);
        exact.noise = 0.0;
        let data = generate("blobs", &exact).unwrap();
        assert_eq!(data.train().features(SampleRef(0)), data.train().features(SampleRef(1)));
    }
}
