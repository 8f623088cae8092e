//! Adam optimizer.

use std::collections::{BTreeMap, HashMap};

use tg_tensor::prelude::*;

use super::{dispose_slots, find_variable, replace_slot, Optimizer};

/// Adam optimizer (Adaptive Moment Estimation).
pub struct Adam {
    /// Learning rate.
    pub lr: f32,
    /// Exponential decay rate for first moment.
    pub beta1: f32,
    /// Exponential decay rate for second moment.
    pub beta2: f32,
    /// Small constant for numerical stability.
    pub eps: f32,
    /// First moment estimates (m).
    m: HashMap<String, Tensor>,
    /// Second moment estimates (v).
    v: HashMap<String, Tensor>,
    /// Step counter.
    t: i32,
}

impl Adam {
    /// Adam with the usual defaults: `beta1 = 0.9`, `beta2 = 0.999`, `eps = 1e-8`.
    pub fn new(lr: f32) -> Self {
        Self::with_params(lr, 0.9, 0.999, 1e-8)
    }

    pub fn with_params(lr: f32, beta1: f32, beta2: f32, eps: f32) -> Self {
        Adam {
            lr,
            beta1,
            beta2,
            eps,
            m: HashMap::new(),
            v: HashMap::new(),
            t: 0,
        }
    }

    pub fn iterations(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn apply_gradients(&mut self, engine: &Engine, grads: &BTreeMap<String, Tensor>) -> Result<()> {
        self.t += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(self.t);
        let bias_correction2 = 1.0 - self.beta2.powi(self.t);

        for (name, grad) in grads {
            let var = find_variable(engine, name)?;
            engine.tidy_named("adam", || {
                let (m_prev, v_prev) = match (self.m.get(name), self.v.get(name)) {
                    (Some(m), Some(v)) => (m.clone(), v.clone()),
                    _ => {
                        let zeros = engine.zeros_like(grad)?;
                        (zeros.clone(), zeros)
                    }
                };

                // m = beta1 * m + (1 - beta1) * g
                let m = engine.add(
                    &engine.mul(&m_prev, &engine.scalar(self.beta1)?)?,
                    &engine.mul(grad, &engine.scalar(1.0 - self.beta1)?)?,
                )?;
                // v = beta2 * v + (1 - beta2) * g^2
                let v = engine.add(
                    &engine.mul(&v_prev, &engine.scalar(self.beta2)?)?,
                    &engine.mul(&engine.square(grad)?, &engine.scalar(1.0 - self.beta2)?)?,
                )?;

                let m_hat = engine.div(&m, &engine.scalar(bias_correction1)?)?;
                let v_hat = engine.div(&v, &engine.scalar(bias_correction2)?)?;
                let denom = engine.add(&engine.sqrt(&v_hat)?, &engine.scalar(self.eps)?)?;
                let update = engine.mul(&engine.div(&m_hat, &denom)?, &engine.scalar(self.lr)?)?;

                let value = engine.read_variable(&var)?;
                engine.assign(&var, &engine.sub(&value, &update)?)?;

                replace_slot(engine, &mut self.m, name, &m)?;
                replace_slot(engine, &mut self.v, name, &v)?;
                Ok(())
            })?;
        }
        Ok(())
    }

    fn dispose(&mut self, engine: &Engine) -> Result<()> {
        dispose_slots(engine, &mut self.m)?;
        dispose_slots(engine, &mut self.v)?;
        self.t = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_backend_cpu::cpu_engine;

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let e = cpu_engine().unwrap();
        let w = e.variable(&e.tensor1d(&[1.0, 2.0]).unwrap(), Some("w"), true).unwrap();
        let grads = BTreeMap::from([("w".to_string(), e.tensor1d(&[0.1, -0.2]).unwrap())]);

        let mut opt = Adam::new(0.1);
        opt.apply_gradients(&e, &grads).unwrap();

        // after bias correction the first step is lr * sign(g)
        let after = e.to_vec(&e.read_variable(&w).unwrap()).unwrap();
        assert!((after[0] - 0.9).abs() < 1e-4);
        assert!((after[1] - 2.1).abs() < 1e-4);
        assert_eq!(opt.iterations(), 1);
    }

    #[test]
    fn test_adam_convergence() {
        // minimize x^2, optimal at x = 0
        let e = cpu_engine().unwrap();
        let x = e.variable(&e.tensor1d(&[10.0]).unwrap(), Some("x"), true).unwrap();
        let mut opt = Adam::new(0.5);

        for _ in 0..10 {
            opt.minimize(&e, || e.sum(&e.square(&e.read_variable(&x)?)?, None, false), None, false)
                .unwrap();
        }

        let final_value = e.to_vec(&e.read_variable(&x).unwrap()).unwrap()[0];
        assert!(final_value.abs() < 10.0);

        let before = e.memory().num_tensors;
        opt.dispose(&e).unwrap();
        assert_eq!(e.memory().num_tensors, before - 2);
    }
}
