//! Softmax family activations.
//!
//! Element-wise activations (`relu`, `sigmoid`, `tanh`) are engine
//! operations; this module adds the ones that reduce over an axis.

use tg_tensor::prelude::*;

/// `log(sum(exp(x)))` over `axes` (all axes when `None`).
///
/// Evaluated as `max + log(sum(exp(x - max)))` so large inputs do not
/// overflow. Registered as a single custom-gradient operation whose
/// gradient is `softmax(x) * dy`.
pub fn log_sum_exp(
    engine: &Engine,
    x: &Tensor,
    axes: Option<&[usize]>,
    keepdims: bool,
) -> Result<Tensor> {
    engine.custom_grad("LogSumExp", &[x], || {
        let max = engine.max(x, axes, true)?;
        let shifted = engine.sub(x, &max)?;
        let summed = engine.sum(&engine.exp(&shifted)?, axes, true)?;
        let kept = engine.add(&engine.log(&summed)?, &max)?;
        let value = if keepdims {
            kept.clone()
        } else {
            engine.reshape(&kept, reduced_shape(x, axes))?
        };

        Ok(CustomGradient::new(
            value,
            vec![x.clone(), kept],
            |e, dy, saved| {
                let (x, kept) = (&saved[0], &saved[1]);
                let dy = e.reshape(dy, kept.shape().clone())?;
                let softmax = e.exp(&e.sub(x, kept)?)?;
                Ok(vec![e.mul(&dy, &softmax)?])
            },
        ))
    })
}

/// Shape of `x` with `axes` dropped.
fn reduced_shape(x: &Tensor, axes: Option<&[usize]>) -> Shape {
    let dims = x
        .dims()
        .iter()
        .enumerate()
        .filter(|(i, _)| axes.is_some_and(|axes| !axes.contains(i)))
        .map(|(_, &d)| d)
        .collect::<Vec<_>>();
    Shape::new(dims)
}

fn last_axis(x: &Tensor) -> Option<[usize; 1]> {
    x.rank().checked_sub(1).map(|axis| [axis])
}

/// Log-softmax along the last axis: `x - log_sum_exp(x)`.
pub fn log_softmax(engine: &Engine, x: &Tensor) -> Result<Tensor> {
    let axis = last_axis(x);
    engine.tidy(|| {
        let lse = log_sum_exp(engine, x, axis.as_ref().map(|a| &a[..]), true)?;
        engine.sub(x, &lse)
    })
}

/// Softmax along the last axis.
pub fn softmax(engine: &Engine, x: &Tensor) -> Result<Tensor> {
    engine.tidy(|| engine.exp(&log_softmax(engine, x)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_backend_cpu::cpu_engine;

    #[test]
    fn test_log_sum_exp_is_stable() {
        let e = cpu_engine().unwrap();
        let x = e.tensor1d(&[1000.0, 1000.0]).unwrap();
        let y = log_sum_exp(&e, &x, None, false).unwrap();
        assert!(y.is_scalar());
        assert!((e.item(&y).unwrap() - (1000.0 + 2.0f32.ln())).abs() < 1e-3);
    }

    #[test]
    fn test_log_sum_exp_axes() {
        let e = cpu_engine().unwrap();
        let x = e.tensor2d(&[0.0, 0.0, 1.0, 1.0], 2, 2).unwrap();
        let y = log_sum_exp(&e, &x, Some(&[1]), false).unwrap();
        assert_eq!(y.dims(), &[2]);
        let values = e.to_vec(&y).unwrap();
        assert!((values[0] - 2.0f32.ln()).abs() < 1e-5);
        assert!((values[1] - (1.0 + 2.0f32.ln())).abs() < 1e-5);

        let kept = log_sum_exp(&e, &x, Some(&[1]), true).unwrap();
        assert_eq!(kept.dims(), &[2, 1]);
    }

    #[test]
    fn test_log_sum_exp_releases_intermediates_at_root() {
        let e = cpu_engine().unwrap();
        let x = e.tensor2d(&[1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
        let before = e.memory();

        let y = log_sum_exp(&e, &x, Some(&[1]), false).unwrap();
        assert_eq!(e.memory().num_tensors, before.num_tensors + 1);

        let kept = log_sum_exp(&e, &x, None, true).unwrap();
        assert_eq!(e.memory().num_tensors, before.num_tensors + 2);

        e.dispose(&(y, kept)).unwrap();
        assert_eq!(e.memory(), before);
    }

    #[test]
    fn test_softmax() {
        let e = cpu_engine().unwrap();
        let x = e.tensor1d(&[1.0, 2.0, 3.0]).unwrap();
        let y = e.to_vec(&softmax(&e, &x).unwrap()).unwrap();

        // Softmax should sum to 1
        let sum: f32 = y.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);

        // Larger values should have larger probabilities
        assert!(y[2] > y[1]);
        assert!(y[1] > y[0]);
    }

    #[test]
    fn test_log_softmax_rows() {
        let e = cpu_engine().unwrap();
        let x = e.tensor2d(&[1.0, 2.0, 3.0, -1.0, 0.0, 1.0], 2, 3).unwrap();
        let before = e.memory().num_tensors;
        let y = log_softmax(&e, &x).unwrap();
        assert_eq!(e.memory().num_tensors, before + 1);

        // each row of exp(log_softmax) sums to 1, and shifting a row changes nothing
        let values = e.to_vec(&y).unwrap();
        for row in values.chunks(3) {
            let sum: f32 = row.iter().map(|v| v.exp()).sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
        for i in 0..3 {
            assert!((values[i] - values[i + 3]).abs() < 1e-5);
        }
    }
}
