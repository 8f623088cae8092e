//! Shape manipulation, copies, casts and comparisons.

use std::rc::Rc;

use super::{broadcast_shape, same_dtype};
use crate::backend::TensorInfo;
use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tape::{GradFn, GradThunks, TapeNode};
use crate::tensor::Tensor;

/// Gradient rule passing `dy` straight through.
fn identity_grad() -> GradFn {
    Rc::new(|dy: &Tensor, _: &Tensor| {
        let dy = dy.clone();
        GradThunks::new().with("x", move |_| Ok(dy))
    })
}

/// Zero gradients for piecewise-constant comparisons.
fn zero_grad(a: &Tensor, b: &Tensor) -> GradFn {
    let (a, b) = (a.clone(), b.clone());
    Rc::new(move |_: &Tensor, _: &Tensor| {
        let (a, b) = (a.clone(), b.clone());
        GradThunks::new()
            .with("a", move |e| e.zeros_like(&a))
            .with("b", move |e| e.zeros_like(&b))
    })
}

impl Engine {
    /// Same data viewed with a new shape. No copy is made; the result
    /// shares storage with `x`.
    pub fn reshape(&self, x: &Tensor, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if shape.numel() != x.numel() {
            return Err(Error::shape_mismatch(
                "Reshape",
                format!("{} elements", x.numel()),
                format!("{shape} ({} elements)", shape.numel()),
            ));
        }

        let mut state = self.state_mut();
        state.ensure_live(x, "Reshape")?;
        let out = state.register_output(TensorInfo::new(x.data_id, shape, x.dtype));
        if state.is_recording() {
            let x_shape = x.shape.clone();
            let grad: GradFn = Rc::new(move |dy: &Tensor, _: &Tensor| {
                let (dy, x_shape) = (dy.clone(), x_shape.clone());
                GradThunks::new().with("x", move |e| e.reshape(&dy, x_shape))
            });
            state.record(TapeNode {
                kernel: "Reshape".to_string(),
                inputs: vec![("x".to_string(), x.clone())],
                output: out.clone(),
                saved: Vec::new(),
                gradient: Some(grad),
            });
        }
        Ok(out)
    }

    /// Permute axes. `None` reverses them.
    pub fn transpose(&self, x: &Tensor, perm: Option<&[usize]>) -> Result<Tensor> {
        let perm: Vec<usize> = match perm {
            Some(perm) => perm.to_vec(),
            None => (0..x.rank()).rev().collect(),
        };
        let mut seen = vec![false; x.rank()];
        let valid = perm.len() == x.rank()
            && perm.iter().all(|&p| p < x.rank() && !std::mem::replace(&mut seen[p], true));
        if !valid {
            return Err(Error::invalid_argument(
                "Transpose",
                format!("{perm:?} is not a permutation of the axes of {}", x.shape),
            ));
        }

        let mut inverse = vec![0; perm.len()];
        for (i, &p) in perm.iter().enumerate() {
            inverse[p] = i;
        }
        let grad: GradFn = Rc::new(move |dy: &Tensor, _: &Tensor| {
            let (dy, inverse) = (dy.clone(), inverse.clone());
            GradThunks::new().with("x", move |e| e.transpose(&dy, Some(&inverse)))
        });
        self.run_kernel(
            "Transpose",
            &[("x", x)],
            |backend| backend.transpose(x, &perm),
            Some(grad),
        )
    }

    /// Broadcast `x` to `shape`, materializing the result.
    pub fn broadcast_to(&self, x: &Tensor, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if x.shape.broadcast_with(&shape).as_ref() != Some(&shape) {
            return Err(Error::shape_mismatch("BroadcastTo", &shape, &x.shape));
        }
        let x_shape = x.shape.clone();
        let grad: GradFn = Rc::new(move |dy: &Tensor, _: &Tensor| {
            let (dy, x_shape) = (dy.clone(), x_shape.clone());
            GradThunks::new().with("x", move |e| e.sum_to(&dy, &x_shape))
        });
        self.run_kernel(
            "BroadcastTo",
            &[("x", x)],
            |backend| backend.broadcast_to(x, &shape),
            Some(grad),
        )
    }

    /// Copy `x` into new storage.
    pub fn clone_tensor(&self, x: &Tensor) -> Result<Tensor> {
        self.run_kernel(
            "Identity",
            &[("x", x)],
            |backend| backend.identity(x),
            Some(identity_grad()),
        )
    }

    /// Convert to `dtype`. The gradient passes through unchanged.
    pub fn cast(&self, x: &Tensor, dtype: DType) -> Result<Tensor> {
        self.run_kernel(
            "Cast",
            &[("x", x)],
            |backend| backend.cast(x, dtype),
            Some(identity_grad_as(x.dtype)),
        )
    }

    /// `a > b`, element-wise, as bool.
    pub fn greater(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        broadcast_shape("Greater", a, b)?;
        same_dtype("Greater", a, b)?;
        self.run_kernel(
            "Greater",
            &[("a", a), ("b", b)],
            |backend| backend.greater(a, b),
            Some(zero_grad(a, b)),
        )
    }

    /// `a == b`, element-wise, as bool.
    pub fn equal(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        broadcast_shape("Equal", a, b)?;
        same_dtype("Equal", a, b)?;
        self.run_kernel(
            "Equal",
            &[("a", a), ("b", b)],
            |backend| backend.equal(a, b),
            Some(zero_grad(a, b)),
        )
    }
}

/// Pass `dy` through, cast back to the input's dtype when it differs.
fn identity_grad_as(dtype: DType) -> GradFn {
    Rc::new(move |dy: &Tensor, _: &Tensor| {
        let dy = dy.clone();
        GradThunks::new().with("x", move |e| {
            if dy.dtype == dtype {
                Ok(dy)
            } else {
                e.cast(&dy, dtype)
            }
        })
    })
}
