//! Stochastic Gradient Descent optimizer.

use std::collections::{BTreeMap, HashMap};

use tg_tensor::prelude::*;

use super::{dispose_slots, find_variable, replace_slot, Optimizer};

/// SGD optimizer with optional momentum.
pub struct Sgd {
    /// Learning rate.
    pub lr: f32,
    /// Momentum coefficient. Zero disables the velocity slots.
    pub momentum: f32,
    /// Velocity per variable name.
    velocities: HashMap<String, Tensor>,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Sgd {
            lr,
            momentum: 0.0,
            velocities: HashMap::new(),
        }
    }

    pub fn with_momentum(lr: f32, momentum: f32) -> Self {
        Sgd {
            lr,
            momentum,
            velocities: HashMap::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn apply_gradients(&mut self, engine: &Engine, grads: &BTreeMap<String, Tensor>) -> Result<()> {
        for (name, grad) in grads {
            let var = find_variable(engine, name)?;
            engine.tidy_named("sgd", || {
                // v = momentum * v + grad; param = param - lr * v
                let step = if self.momentum > 0.0 {
                    let velocity = match self.velocities.get(name) {
                        Some(v) => engine.add(&engine.mul(v, &engine.scalar(self.momentum)?)?, grad)?,
                        None => engine.clone_tensor(grad)?,
                    };
                    replace_slot(engine, &mut self.velocities, name, &velocity)?
                } else {
                    grad.clone()
                };
                let value = engine.read_variable(&var)?;
                let update = engine.mul(&step, &engine.scalar(self.lr)?)?;
                engine.assign(&var, &engine.sub(&value, &update)?)
            })?;
        }
        Ok(())
    }

    fn dispose(&mut self, engine: &Engine) -> Result<()> {
        dispose_slots(engine, &mut self.velocities)
    }
}
