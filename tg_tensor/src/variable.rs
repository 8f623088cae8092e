//! Variable registry: named, mutable bindings that outlive scopes.

use crate::engine::{Engine, TensorRecord};
use crate::error::{Error, Result};
use crate::tensor::{Tensor, Variable};

impl Engine {
    /// Register a variable initialized from `initial`.
    ///
    /// The variable aliases `initial`'s storage. Without a name one is
    /// generated (`var0`, `var1`, ...).
    pub fn variable(&self, initial: &Tensor, name: Option<&str>, trainable: bool) -> Result<Variable> {
        let mut state = self.state_mut();
        state.ensure_live(initial, "variable")?;

        let name = match name {
            Some(name) => name.to_string(),
            None => loop {
                let candidate = format!("var{}", state.next_variable);
                state.next_variable += 1;
                if !state.variables.iter().any(|v| v.name == candidate) {
                    break candidate;
                }
            },
        };
        if state.variables.iter().any(|v| v.name == name) {
            return Err(Error::VariableExists(name));
        }

        state.acquire_data(initial.data_id, initial.size_in_bytes());
        let id = state.next_id();
        state.tensors.insert(
            id,
            TensorRecord {
                data_id: initial.data_id,
                shape: initial.shape.clone(),
                dtype: initial.dtype,
                variable: Some(name.clone()),
            },
        );
        let var = Variable {
            name,
            id,
            trainable,
        };
        state.variables.push(var.clone());
        Ok(var)
    }

    /// Current value of `var`. The handle goes stale after the next
    /// [`assign`](Self::assign).
    pub fn read_variable(&self, var: &Variable) -> Result<Tensor> {
        let state = self.state.borrow();
        let record = state
            .tensors
            .get(&var.id)
            .filter(|r| r.variable.as_deref() == Some(var.name.as_str()))
            .ok_or_else(|| Error::UnknownVariable(var.name.clone()))?;
        Ok(Tensor {
            id: var.id,
            shape: record.shape.clone(),
            dtype: record.dtype,
            data_id: record.data_id,
        })
    }

    /// Rebind `var` to `value`'s storage, releasing the previous binding.
    pub fn assign(&self, var: &Variable, value: &Tensor) -> Result<()> {
        let mut state = self.state_mut();
        state.ensure_live(value, "assign")?;
        let (old_data, shape, dtype) = match state.tensors.get(&var.id) {
            Some(r) if r.variable.as_deref() == Some(var.name.as_str()) => {
                (r.data_id, r.shape.clone(), r.dtype)
            }
            _ => return Err(Error::UnknownVariable(var.name.clone())),
        };
        if value.shape != shape {
            return Err(Error::shape_mismatch("assign", &shape, &value.shape));
        }
        if value.dtype != dtype {
            return Err(Error::dtype_mismatch("assign", dtype, value.dtype));
        }

        state.acquire_data(value.data_id, value.size_in_bytes());
        if let Some(record) = state.tensors.get_mut(&var.id) {
            record.data_id = value.data_id;
        }
        state.release_data(old_data)
    }

    /// Unregister `var` and release its storage.
    pub fn dispose_variable(&self, var: &Variable) -> Result<()> {
        let mut state = self.state_mut();
        if !state.variables.iter().any(|v| v.id == var.id) {
            return Err(Error::UnknownVariable(var.name.clone()));
        }
        state.dispose_tensor(var.id)
    }

    /// Every registered variable, in registration order.
    pub fn registered_variables(&self) -> Vec<Variable> {
        self.state.borrow().variables.clone()
    }

    pub fn find_variable(&self, name: &str) -> Option<Variable> {
        self.state
            .borrow()
            .variables
            .iter()
            .find(|v| v.name == name)
            .cloned()
    }

    /// Dispose every registered variable.
    pub fn dispose_variables(&self) -> Result<()> {
        for var in self.registered_variables() {
            self.dispose_variable(&var)?;
        }
        Ok(())
    }
}
