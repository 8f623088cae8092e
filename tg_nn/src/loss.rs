//! Loss functions. Each returns a scalar and releases its intermediates.

use tg_tensor::prelude::*;

use crate::activations::log_softmax;

/// Mean Squared Error loss: mean((pred - target)^2)
pub fn mse_loss(engine: &Engine, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    engine.tidy(|| {
        let diff = engine.sub(pred, target)?;
        engine.mean(&engine.square(&diff)?, None, false)
    })
}

/// Binary Cross-Entropy loss with logits.
///
/// Computes: mean(max(logits, 0) - logits * targets + log(1 + exp(-|logits|)))
/// This is numerically stable.
pub fn binary_cross_entropy_with_logits(
    engine: &Engine,
    logits: &Tensor,
    targets: &Tensor,
) -> Result<Tensor> {
    engine.tidy(|| {
        let relu_logits = engine.relu(logits)?;
        let logits_targets = engine.mul(logits, targets)?;
        let neg_abs = engine.neg(&engine.abs(logits)?)?;
        let log_term = engine.log(&engine.add(&engine.scalar(1.0)?, &engine.exp(&neg_abs)?)?)?;

        let loss = engine.add(&engine.sub(&relu_logits, &logits_targets)?, &log_term)?;
        engine.mean(&loss, None, false)
    })
}

/// Soft Cross-Entropy loss with target probabilities.
///
/// `logits` and `targets` have shape `[batch, num_classes]`; targets hold
/// probabilities (one-hot or soft labels).
///
/// Returns: -mean(sum(targets * log_softmax(logits)))
pub fn soft_cross_entropy_loss(engine: &Engine, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    engine.tidy(|| {
        let log_probs = log_softmax(engine, logits)?;
        let neg_log_probs = engine.neg(&engine.mul(targets, &log_probs)?)?;

        // Sum over classes, mean over batch
        engine.mean(&engine.sum(&neg_log_probs, Some(&[1]), false)?, None, false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_backend_cpu::cpu_engine;

    #[test]
    fn test_mse_loss() {
        let e = cpu_engine().unwrap();
        let pred = e.tensor1d(&[1.0, 2.0, 3.0]).unwrap();
        let target = e.tensor1d(&[1.0, 2.0, 3.0]).unwrap();
        assert!(e.item(&mse_loss(&e, &pred, &target).unwrap()).unwrap().abs() < 1e-6);

        let pred = e.tensor1d(&[0.0, 0.0]).unwrap();
        let target = e.tensor1d(&[1.0, 3.0]).unwrap();
        let before = e.memory().num_tensors;
        let loss = mse_loss(&e, &pred, &target).unwrap();
        assert!((e.item(&loss).unwrap() - 5.0).abs() < 1e-6);
        assert_eq!(e.memory().num_tensors, before + 1);
    }

    #[test]
    fn test_bce_with_logits() {
        let e = cpu_engine().unwrap();
        let logits = e.tensor1d(&[0.0]).unwrap();
        let targets = e.tensor1d(&[0.5]).unwrap();

        let loss = binary_cross_entropy_with_logits(&e, &logits, &targets).unwrap();
        // At logits=0, sigmoid=0.5, BCE = log(2)
        assert!((e.item(&loss).unwrap() - 0.6931).abs() < 0.01);
    }

    #[test]
    fn test_soft_cross_entropy_gradient() {
        let e = cpu_engine().unwrap();
        let logits = e.tensor2d(&[2.0, 1.0, 0.0], 1, 3).unwrap();
        // One-hot target for class 0
        let targets = e.tensor2d(&[1.0, 0.0, 0.0], 1, 3).unwrap();

        let r = e
            .value_and_grad(|l| soft_cross_entropy_loss(&e, l, &targets), &logits, None)
            .unwrap();

        let z: f32 = [2.0f32, 1.0, 0.0].iter().map(|v| v.exp()).sum();
        let probs: Vec<f32> = [2.0f32, 1.0, 0.0].iter().map(|v| v.exp() / z).collect();
        assert!((e.item(&r.value).unwrap() + probs[0].ln()).abs() < 1e-5);

        // d/dlogits = softmax - target
        let grad = e.to_vec(&r.grad).unwrap();
        let expected = [probs[0] - 1.0, probs[1], probs[2]];
        for (g, ex) in grad.iter().zip(expected.iter()) {
            assert!((g - ex).abs() < 1e-5);
        }
    }
}
