//! Element-wise unary math.

use std::rc::Rc;

use super::expect_float;
use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::Result;
use crate::tape::{GradFn, GradThunks};
use crate::tensor::Tensor;

/// Local derivative `dy/dx` given `x` and `y`.
type LocalGrad = fn(&Engine, &Tensor, &Tensor) -> Result<Tensor>;

/// Backward rule `dx = dy * local(x, y)`.
fn chain_rule(x: &Tensor, local: LocalGrad) -> GradFn {
    let x = x.clone();
    Rc::new(move |dy: &Tensor, y: &Tensor| {
        let (dy, x, y) = (dy.clone(), x.clone(), y.clone());
        GradThunks::new().with("x", move |e| {
            let d = local(e, &x, &y)?;
            e.mul(&dy, &d)
        })
    })
}

impl Engine {
    pub fn exp(&self, x: &Tensor) -> Result<Tensor> {
        expect_float("Exp", x)?;
        let grad = chain_rule(x, |_, _, y| Ok(y.clone()));
        self.run_kernel("Exp", &[("x", x)], |backend| backend.exp(x), Some(grad))
    }

    /// Natural logarithm.
    pub fn log(&self, x: &Tensor) -> Result<Tensor> {
        expect_float("Log", x)?;
        let grad = chain_rule(x, |e, x, _| e.div(&e.scalar(1.0)?, x));
        self.run_kernel("Log", &[("x", x)], |backend| backend.log(x), Some(grad))
    }

    pub fn sqrt(&self, x: &Tensor) -> Result<Tensor> {
        expect_float("Sqrt", x)?;
        let grad = chain_rule(x, |e, _, y| e.div(&e.scalar(0.5)?, y));
        self.run_kernel("Sqrt", &[("x", x)], |backend| backend.sqrt(x), Some(grad))
    }

    pub fn abs(&self, x: &Tensor) -> Result<Tensor> {
        expect_float("Abs", x)?;
        let grad = chain_rule(x, |e, x, _| e.sign(x));
        self.run_kernel("Abs", &[("x", x)], |backend| backend.abs(x), Some(grad))
    }

    /// `1` where `x > 0`, `-1` where `x < 0`, else `0`.
    pub fn sign(&self, x: &Tensor) -> Result<Tensor> {
        self.tidy_named("Sign", || {
            let zero = self.scalar(0.0)?;
            let pos = self.cast(&self.greater(x, &zero)?, DType::Float32)?;
            let neg = self.cast(&self.greater(&zero, x)?, DType::Float32)?;
            self.sub(&pos, &neg)
        })
    }

    pub fn relu(&self, x: &Tensor) -> Result<Tensor> {
        expect_float("Relu", x)?;
        let grad = chain_rule(x, |e, x, _| {
            e.cast(&e.greater(x, &e.scalar(0.0)?)?, DType::Float32)
        });
        self.run_kernel("Relu", &[("x", x)], |backend| backend.relu(x), Some(grad))
    }

    pub fn sigmoid(&self, x: &Tensor) -> Result<Tensor> {
        expect_float("Sigmoid", x)?;
        let grad = chain_rule(x, |e, _, y| {
            let one_minus = e.sub(&e.scalar(1.0)?, y)?;
            e.mul(y, &one_minus)
        });
        self.run_kernel("Sigmoid", &[("x", x)], |backend| backend.sigmoid(x), Some(grad))
    }

    pub fn tanh(&self, x: &Tensor) -> Result<Tensor> {
        expect_float("Tanh", x)?;
        let grad = chain_rule(x, |e, _, y| e.sub(&e.scalar(1.0)?, &e.square(y)?));
        self.run_kernel("Tanh", &[("x", x)], |backend| backend.tanh(x), Some(grad))
    }

    pub fn sin(&self, x: &Tensor) -> Result<Tensor> {
        expect_float("Sin", x)?;
        let grad = chain_rule(x, |e, x, _| e.cos(x));
        self.run_kernel("Sin", &[("x", x)], |backend| backend.sin(x), Some(grad))
    }

    pub fn cos(&self, x: &Tensor) -> Result<Tensor> {
        expect_float("Cos", x)?;
        let grad = chain_rule(x, |e, x, _| e.neg(&e.sin(x)?));
        self.run_kernel("Cos", &[("x", x)], |backend| backend.cos(x), Some(grad))
    }
}
