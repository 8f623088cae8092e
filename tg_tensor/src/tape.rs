//! The gradient tape and the reverse pass over it.
//!
//! While a `gradients` call is recording, every kernel appends a
//! [`TapeNode`]. The backward pass filters the tape down to the nodes that
//! connect the sources to the output and walks them in reverse, asking each
//! node's gradient function for one deferred computation per input.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::engine::{Engine, EngineState};
use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorId};

/// Deferred computation of one input's gradient.
pub type GradThunk = Box<dyn FnOnce(&Engine) -> Result<Tensor>>;

/// Backward rule of a kernel: `(dy, y)` to one thunk per input name.
pub type GradFn = Rc<dyn Fn(&Tensor, &Tensor) -> GradThunks>;

/// Named gradient thunks returned by a [`GradFn`].
#[derive(Default)]
pub struct GradThunks {
    thunks: Vec<(String, GradThunk)>,
}

impl GradThunks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the thunk for input `name`.
    pub fn with<F>(mut self, name: &str, f: F) -> Self
    where
        F: FnOnce(&Engine) -> Result<Tensor> + 'static,
    {
        self.thunks.push((name.to_string(), Box::new(f)));
        self
    }

    /// Remove and return the thunk for input `name`.
    pub fn take(&mut self, name: &str) -> Option<GradThunk> {
        let pos = self.thunks.iter().position(|(n, _)| n == name)?;
        Some(self.thunks.swap_remove(pos).1)
    }

    pub fn len(&self) -> usize {
        self.thunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thunks.is_empty()
    }
}

/// One recorded kernel invocation.
#[derive(Clone)]
pub(crate) struct TapeNode {
    pub kernel: String,
    pub inputs: Vec<(String, Tensor)>,
    pub output: Tensor,
    /// Extra tensors the gradient function reads.
    pub saved: Vec<Tensor>,
    pub gradient: Option<GradFn>,
}

impl TapeNode {
    fn held(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.inputs
            .iter()
            .map(|(_, t)| t.id)
            .chain(std::iter::once(self.output.id))
            .chain(self.saved.iter().map(|t| t.id))
    }
}

impl EngineState {
    pub(crate) fn is_recording(&self) -> bool {
        self.gradient_depth > 0 && self.tape_paused == 0
    }

    pub(crate) fn record(&mut self, node: TapeNode) {
        for id in node.held() {
            *self.tape_holds.entry(id).or_insert(0) += 1;
        }
        self.tape.push(node);
    }

    /// Enter a recording region; the outermost one starts a fresh tape.
    pub(crate) fn start_tape(&mut self) {
        if self.gradient_depth == 0 {
            self.tape.clear();
            self.tape_holds.clear();
        }
        self.gradient_depth += 1;
    }

    pub(crate) fn end_tape(&mut self) {
        self.gradient_depth = self.gradient_depth.saturating_sub(1);
    }

    /// Drop the tape once no recording region is open.
    pub(crate) fn release_tape_if_idle(&mut self) {
        if self.gradient_depth == 0 {
            self.tape.clear();
            self.tape_holds.clear();
        }
    }
}

/// Nodes on a path from `xs` to `y`, with inputs not reachable from `xs`
/// pruned.
pub(crate) fn filter_tape(tape: &[TapeNode], xs: &[&Tensor], y: &Tensor) -> Vec<TapeNode> {
    let mut from_x: HashSet<TensorId> = xs.iter().map(|x| x.id).collect();
    let mut node_from_x = vec![false; tape.len()];
    for (i, node) in tape.iter().enumerate() {
        if node.inputs.iter().any(|(_, t)| from_x.contains(&t.id)) {
            from_x.insert(node.output.id);
            node_from_x[i] = true;
        }
    }

    let mut to_y: HashSet<TensorId> = HashSet::from([y.id]);
    let mut node_to_y = vec![false; tape.len()];
    for (i, node) in tape.iter().enumerate().rev() {
        if to_y.contains(&node.output.id) {
            for (_, t) in &node.inputs {
                to_y.insert(t.id);
            }
            node_to_y[i] = true;
        }
    }

    tape.iter()
        .enumerate()
        .filter(|(i, _)| node_from_x[*i] && node_to_y[*i])
        .map(|(_, node)| {
            let mut node = node.clone();
            node.inputs.retain(|(_, t)| from_x.contains(&t.id));
            node
        })
        .collect()
}

/// Walk `nodes` in reverse, accumulating gradients into `grads` (keyed by
/// tensor id, seeded with the output gradient).
pub(crate) fn backpropagate(
    engine: &Engine,
    nodes: &[TapeNode],
    grads: &mut HashMap<TensorId, Tensor>,
) -> Result<()> {
    for node in nodes.iter().rev() {
        let dy = match grads.get(&node.output.id) {
            Some(dy) => dy.clone(),
            None => continue,
        };
        let gradient = node.gradient.clone().ok_or_else(|| Error::MissingGradient {
            kernel: node.kernel.clone(),
        })?;

        let input_grads = engine.tidy_named(&node.kernel, || {
            let mut thunks = gradient(&dy, &node.output);
            let mut out = Vec::with_capacity(node.inputs.len());
            for (name, input) in &node.inputs {
                let thunk = thunks.take(name).ok_or_else(|| Error::MissingGradient {
                    kernel: format!("{}:{name}", node.kernel),
                })?;
                let g = thunk(engine)?;
                if g.shape() != input.shape() {
                    return Err(Error::GradientShape {
                        kernel: node.kernel.clone(),
                        input: name.clone(),
                        expected: input.shape().to_string(),
                        got: g.shape().to_string(),
                    });
                }
                out.push(g);
            }
            Ok(out)
        })?;

        for ((_, input), g) in node.inputs.iter().zip(input_grads) {
            let total = match grads.remove(&input.id) {
                Some(prev) => engine.add(&prev, &g)?,
                None => g,
            };
            grads.insert(input.id, total);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::shape::Shape;
    use crate::tensor::DataId;

    fn t(id: u64) -> Tensor {
        Tensor {
            id: TensorId(id),
            shape: Shape::scalar(),
            dtype: DType::Float32,
            data_id: DataId::next(),
        }
    }

    fn node(kernel: &str, inputs: &[&Tensor], output: &Tensor) -> TapeNode {
        TapeNode {
            kernel: kernel.to_string(),
            inputs: inputs
                .iter()
                .enumerate()
                .map(|(i, t)| (format!("x{i}"), (*t).clone()))
                .collect(),
            output: output.clone(),
            saved: Vec::new(),
            gradient: None,
        }
    }

    #[test]
    fn test_filter_keeps_only_connecting_nodes() {
        let (x, c, a, b, y, z) = (t(0), t(1), t(2), t(3), t(4), t(5));
        let tape = vec![
            node("Exp", &[&x], &a),
            node("Neg", &[&c], &b),
            node("Mul", &[&a, &b], &y),
            node("Sin", &[&x], &z),
        ];
        let filtered = filter_tape(&tape, &[&x], &y);
        let kernels: Vec<&str> = filtered.iter().map(|n| n.kernel.as_str()).collect();
        assert_eq!(kernels, vec!["Exp", "Mul"]);
        // b does not depend on x
        assert_eq!(filtered[1].inputs.len(), 1);
        assert_eq!(filtered[1].inputs[0].1.id(), a.id());
    }

    #[test]
    fn test_filter_unconnected_source() {
        let (x, w, y) = (t(0), t(1), t(2));
        let tape = vec![node("Neg", &[&w], &y)];
        assert!(filter_tape(&tape, &[&x], &y).is_empty());
    }

    #[test]
    fn test_grad_thunks_take() {
        let mut thunks = GradThunks::new()
            .with("a", |_| Err(Error::NoBackend))
            .with("b", |_| Err(Error::NoBackend));
        assert_eq!(thunks.len(), 2);
        assert!(thunks.take("b").is_some());
        assert!(thunks.take("b").is_none());
        assert!(thunks.take("a").is_some());
        assert!(thunks.is_empty());
    }
}
