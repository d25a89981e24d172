//! Loss terms shared by the strategies.

use burn::{
    nn::loss::CrossEntropyLossConfig,
    tensor::{activation, backend::Backend, Int, Tensor},
};

/// Mean cross-entropy over all logits.
pub fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    CrossEntropyLossConfig::new()
        .init(&logits.device())
        .forward(logits, targets)
}

/// Cross-entropy restricted to the logits of classes `known..`.
///
/// Every target must be a new class.
pub fn new_class_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    known_classes: usize,
) -> Tensor<B, 1> {
    let [batch, total] = logits.dims();
    cross_entropy(
        logits.slice([0..batch, known_classes..total]),
        targets.sub_scalar(known_classes as i64),
    )
}

/// Soft-target distillation at temperature `t`:
/// `-sum(softmax(old / t) * log_softmax(new / t)) / batch`.
pub fn kd_loss<B: Backend>(
    logits: Tensor<B, 2>,
    old_logits: Tensor<B, 2>,
    temperature: f64,
) -> Tensor<B, 1> {
    let [batch, _] = logits.dims();
    let log_p = activation::log_softmax(logits.div_scalar(temperature), 1);
    let q = activation::softmax(old_logits.div_scalar(temperature), 1);
    (q * log_p).sum().neg().div_scalar(batch.max(1) as f64)
}

/// The first `known` columns of `logits`, matching a previous head.
pub fn old_class_logits<B: Backend>(logits: Tensor<B, 2>, known_classes: usize) -> Tensor<B, 2> {
    let [batch, _] = logits.dims();
    logits.slice([0..batch, 0..known_classes])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type B = NdArray;

    fn scalar(t: Tensor<B, 1>) -> f32 {
        t.into_data().convert::<f32>().to_vec::<f32>().unwrap()[0]
    }

    #[test]
    fn test_kd_is_entropy_when_outputs_match() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::from_data(TensorData::from([[0.0f32, 0.0]]), &device);
        // Uniform over two classes: -sum(0.5 * ln 0.5) = ln 2.
        let loss = scalar(kd_loss(logits.clone(), logits, 2.0));
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_kd_grows_with_disagreement() {
        let device = Default::default();
        let old = Tensor::<B, 2>::from_data(TensorData::from([[4.0f32, -4.0]]), &device);
        let same = scalar(kd_loss(old.clone(), old.clone(), 2.0));
        let flipped = Tensor::<B, 2>::from_data(TensorData::from([[-4.0f32, 4.0]]), &device);
        assert!(scalar(kd_loss(flipped, old, 2.0)) > same);
    }

    #[test]
    fn test_new_class_cross_entropy_shifts_targets() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::from_data(
            TensorData::from([[9.0f32, 9.0, 10.0, -10.0]]),
            &device,
        );
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::from([2i64]), &device);
        // Only columns 2 and 3 count; class 2 dominates there.
        let loss = scalar(new_class_cross_entropy(logits, targets, 2));
        assert!(loss < 1e-3);
    }

    #[test]
    fn test_old_class_logits_slice() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::zeros([3, 5], &device);
        assert_eq!(old_class_logits(logits, 2).dims(), [3, 2]);
    }
}
