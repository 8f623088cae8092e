//! Optimizers for neural network training.
//!
//! An optimizer consumes gradients keyed by variable name and rebinds the
//! variables with [`Engine::assign`]. Per-variable state (momentum, moment
//! estimates) lives in kept tensors until [`Optimizer::dispose`].

mod adam;
mod sgd;

use std::collections::{BTreeMap, HashMap};

use tg_tensor::prelude::*;
use tg_tensor::VariableGrads;

pub use adam::Adam;
pub use sgd::Sgd;

pub trait Optimizer {
    /// Update every variable named in `grads`.
    fn apply_gradients(&mut self, engine: &Engine, grads: &BTreeMap<String, Tensor>) -> Result<()>;

    /// Release the optimizer's state tensors.
    fn dispose(&mut self, engine: &Engine) -> Result<()>;

    /// Differentiate the scalar `f` with respect to `var_list` (every
    /// trainable variable when `None`) and apply one update step.
    ///
    /// Gradients are disposed. With `return_cost` the value of `f` is
    /// returned and owned by the caller.
    fn minimize<F>(
        &mut self,
        engine: &Engine,
        f: F,
        var_list: Option<&[Variable]>,
        return_cost: bool,
    ) -> Result<Option<Tensor>>
    where
        F: FnOnce() -> Result<Tensor>,
        Self: Sized,
    {
        engine.tidy_named("minimize", || {
            let VariableGrads { value, grads } = engine.variable_grads(f, var_list)?;
            self.apply_gradients(engine, &grads)?;
            Ok(return_cost.then_some(value))
        })
    }
}

/// Look up the variable a gradient belongs to.
fn find_variable(engine: &Engine, name: &str) -> Result<Variable> {
    engine
        .find_variable(name)
        .ok_or_else(|| Error::UnknownVariable(name.to_string()))
}

/// Store `value` as the slot for `name`, keeping it alive across scopes and
/// disposing the slot it replaces.
fn replace_slot(
    engine: &Engine,
    slots: &mut HashMap<String, Tensor>,
    name: &str,
    value: &Tensor,
) -> Result<Tensor> {
    let kept = engine.keep(value)?;
    if let Some(old) = slots.insert(name.to_string(), kept.clone()) {
        engine.dispose(&old)?;
    }
    Ok(kept)
}

fn dispose_slots(engine: &Engine, slots: &mut HashMap<String, Tensor>) -> Result<()> {
    for (_, slot) in slots.drain() {
        engine.dispose(&slot)?;
    }
    Ok(())
}
