//! Reverse-mode differentiation entry points.
//!
//! All of them reduce to [`Engine::gradients`]: run `f` while recording a
//! tape, then walk the tape backwards from the output. Recording nests, so a
//! gradient computed inside another `gradients` call is itself recorded and
//! can be differentiated again.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::scope::TensorContainer;
use crate::tape::{backpropagate, filter_tape, GradFn, GradThunks, TapeNode};
use crate::tensor::{Tensor, Variable};

/// Output of `f` together with its gradients.
#[derive(Debug, Clone)]
pub struct ValueAndGrads {
    pub value: Tensor,
    /// One gradient per source, in order.
    pub grads: Vec<Tensor>,
}

#[derive(Debug, Clone)]
pub struct ValueAndGrad {
    pub value: Tensor,
    pub grad: Tensor,
}

/// Output of [`Engine::variable_grads`].
#[derive(Debug, Clone)]
pub struct VariableGrads {
    pub value: Tensor,
    /// Gradient per variable name.
    pub grads: BTreeMap<String, Tensor>,
}

impl TensorContainer for ValueAndGrads {
    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        out.push(&self.value);
        self.grads.collect_tensors(out);
    }
}

impl TensorContainer for ValueAndGrad {
    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        out.push(&self.value);
        out.push(&self.grad);
    }
}

impl TensorContainer for VariableGrads {
    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        out.push(&self.value);
        self.grads.collect_tensors(out);
    }
}

/// User backward rule: `(engine, dy, saved)` to one gradient per input.
pub type CustomGradFn = Rc<dyn Fn(&Engine, &Tensor, &[Tensor]) -> Result<Vec<Tensor>>>;

/// What the forward function of [`Engine::custom_grad`] returns.
pub struct CustomGradient {
    pub value: Tensor,
    /// Tensors the backward rule needs; held until the backward pass.
    pub saved: Vec<Tensor>,
    pub gradient: CustomGradFn,
}

impl CustomGradient {
    pub fn new<G>(value: Tensor, saved: Vec<Tensor>, gradient: G) -> Self
    where
        G: Fn(&Engine, &Tensor, &[Tensor]) -> Result<Vec<Tensor>> + 'static,
    {
        CustomGradient {
            value,
            saved,
            gradient: Rc::new(gradient),
        }
    }
}

impl TensorContainer for CustomGradient {
    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        out.push(&self.value);
        self.saved.collect_tensors(out);
    }
}

impl Engine {
    /// Compute `f()` and the gradient of its output with respect to each of
    /// `xs`.
    ///
    /// Without `dy` the output must be a scalar and is seeded with one.
    /// Sources the output does not depend on get zero gradients. Every
    /// intermediate tensor is disposed before returning.
    pub fn gradients<F>(&self, f: F, xs: &[&Tensor], dy: Option<&Tensor>) -> Result<ValueAndGrads>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        if xs.is_empty() {
            return Err(Error::invalid_argument(
                "gradients",
                "at least one source tensor is required",
            ));
        }
        {
            let state = self.state.borrow();
            for x in xs {
                state.ensure_live(x, "gradients")?;
            }
            if let Some(dy) = dy {
                state.ensure_live(dy, "gradients")?;
            }
        }
        log::debug!("gradients: {} sources", xs.len());

        self.tidy_named("gradients", || {
            self.state_mut().start_tape();
            let forward = self.tidy_named("forward", f);
            self.state_mut().end_tape();

            let result = forward.and_then(|value| {
                let grads = self.backward(&value, xs, dy)?;
                Ok(ValueAndGrads { value, grads })
            });
            self.state_mut().release_tape_if_idle();
            result
        })
    }

    fn backward(&self, y: &Tensor, xs: &[&Tensor], dy: Option<&Tensor>) -> Result<Vec<Tensor>> {
        match dy {
            Some(dy) if dy.shape != y.shape => {
                return Err(Error::shape_mismatch("gradients", &y.shape, &dy.shape));
            }
            None if !y.is_scalar() => {
                return Err(Error::NonScalarGradient {
                    shape: y.shape.to_string(),
                });
            }
            _ => {}
        }

        let nodes: Vec<TapeNode> = filter_tape(&self.state.borrow().tape, xs, y);
        log::trace!("backward over {} tape nodes", nodes.len());

        self.tidy_named("backward", || {
            let seed = match dy {
                Some(dy) => dy.clone(),
                None => self.ones_like(y)?,
            };
            let mut grads = HashMap::new();
            grads.insert(y.id, seed);
            backpropagate(self, &nodes, &mut grads)?;

            xs.iter()
                .map(|x| match grads.get(&x.id) {
                    Some(g) => Ok(g.clone()),
                    None => self.zeros_like(x),
                })
                .collect::<Result<Vec<_>>>()
        })
    }

    /// Gradient of `f(x)` with respect to `x`. The value is disposed.
    pub fn grad<F>(&self, f: F, x: &Tensor, dy: Option<&Tensor>) -> Result<Tensor>
    where
        F: FnOnce(&Tensor) -> Result<Tensor>,
    {
        self.tidy_named("grad", || Ok(self.value_and_grad(f, x, dy)?.grad))
    }

    /// Gradients of `f(xs)` with respect to every `xs`. The value is disposed.
    pub fn grads<F>(&self, f: F, xs: &[Tensor], dy: Option<&Tensor>) -> Result<Vec<Tensor>>
    where
        F: FnOnce(&[Tensor]) -> Result<Tensor>,
    {
        self.tidy_named("grads", || Ok(self.value_and_grads(f, xs, dy)?.grads))
    }

    pub fn value_and_grad<F>(&self, f: F, x: &Tensor, dy: Option<&Tensor>) -> Result<ValueAndGrad>
    where
        F: FnOnce(&Tensor) -> Result<Tensor>,
    {
        let ValueAndGrads { value, mut grads } = self.gradients(|| f(x), &[x], dy)?;
        let grad = grads
            .pop()
            .ok_or_else(|| Error::invalid_argument("value_and_grad", "no gradient produced"))?;
        Ok(ValueAndGrad { value, grad })
    }

    pub fn value_and_grads<F>(&self, f: F, xs: &[Tensor], dy: Option<&Tensor>) -> Result<ValueAndGrads>
    where
        F: FnOnce(&[Tensor]) -> Result<Tensor>,
    {
        let refs: Vec<&Tensor> = xs.iter().collect();
        self.gradients(|| f(xs), &refs, dy)
    }

    /// Gradients of the scalar `f()` with respect to `var_list`, or every
    /// trainable variable when `None`.
    pub fn variable_grads<F>(&self, f: F, var_list: Option<&[Variable]>) -> Result<VariableGrads>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        let vars: Vec<Variable> = match var_list {
            Some(list) => list.to_vec(),
            None => self
                .registered_variables()
                .into_iter()
                .filter(|v| v.trainable)
                .collect(),
        };
        if vars.is_empty() {
            return Err(Error::invalid_argument(
                "variable_grads",
                "there are no variables to differentiate",
            ));
        }

        let sources = vars
            .iter()
            .map(|v| self.read_variable(v))
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&Tensor> = sources.iter().collect();
        let ValueAndGrads { value, grads } = self.gradients(f, &refs, None)?;
        let grads = vars.into_iter().map(|v| v.name).zip(grads).collect();
        Ok(VariableGrads { value, grads })
    }

    /// Run `forward` as a single differentiable operation named `name`.
    ///
    /// `forward` runs in its own scope: only the value and the saved tensors
    /// outlive it. Kernels inside it are not recorded. One tape node is
    /// recorded instead, whose backward pass calls the returned rule once and
    /// hands out one gradient per input. When nothing is recording, saved
    /// tensors created by `forward` are released right away.
    pub fn custom_grad<F>(&self, name: &str, inputs: &[&Tensor], forward: F) -> Result<Tensor>
    where
        F: FnOnce() -> Result<CustomGradient>,
    {
        let first_new = {
            let state = self.state.borrow();
            for input in inputs {
                state.ensure_live(input, name)?;
            }
            state.peek_next_id()
        };

        self.state_mut().tape_paused += 1;
        let result = self.tidy_named(name, forward);
        self.state_mut().tape_paused -= 1;
        let CustomGradient {
            value,
            saved,
            gradient,
        } = result?;

        let mut state = self.state_mut();
        state.ensure_live(&value, name)?;
        if !state.is_recording() {
            let mut released = HashSet::new();
            for t in &saved {
                if t.id >= first_new
                    && t.id != value.id
                    && released.insert(t.id)
                    && state.tensors.contains_key(&t.id)
                {
                    state.dispose_tensor(t.id)?;
                }
            }
            return Ok(value);
        }

        let count = inputs.len();
        let kernel = name.to_string();
        let saved_for_rule = saved.clone();
        let gradient_fn: GradFn = Rc::new(move |dy: &Tensor, _y: &Tensor| {
            let computed: Rc<RefCell<Option<Vec<Tensor>>>> = Rc::new(RefCell::new(None));
            let mut thunks = GradThunks::new();
            for i in 0..count {
                let computed = Rc::clone(&computed);
                let rule = Rc::clone(&gradient);
                let dy = dy.clone();
                let saved = saved_for_rule.clone();
                let kernel = kernel.clone();
                thunks = thunks.with(&format!("x{i}"), move |engine: &Engine| {
                    let mut slot = computed.borrow_mut();
                    if slot.is_none() {
                        let grads = rule(engine, &dy, &saved)?;
                        if grads.len() != count {
                            return Err(Error::invalid_argument(
                                &kernel,
                                format!(
                                    "custom gradient returned {} gradients for {count} inputs",
                                    grads.len()
                                ),
                            ));
                        }
                        *slot = Some(grads);
                    }
                    slot.as_ref()
                        .and_then(|grads| grads.get(i).cloned())
                        .ok_or_else(|| Error::MissingGradient {
                            kernel: kernel.clone(),
                        })
                });
            }
            thunks
        });

        state.record(TapeNode {
            kernel: name.to_string(),
            inputs: inputs
                .iter()
                .enumerate()
                .map(|(i, t)| (format!("x{i}"), (*t).clone()))
                .collect(),
            output: value.clone(),
            saved,
            gradient: Some(gradient_fn),
        });
        Ok(value)
    }
}
