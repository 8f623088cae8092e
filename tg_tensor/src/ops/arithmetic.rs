//! Broadcasting binary arithmetic.
//!
//! Gradients of broadcast inputs are summed back to the input's shape with
//! [`Engine::sum_to`].

use std::rc::Rc;

use super::{broadcast_shape, same_dtype};
use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tape::{GradFn, GradThunks};
use crate::tensor::Tensor;

/// Floor for `log` in the exponent gradient of `pow`.
const POW_LOG_EPS: f32 = 1e-30;

impl Engine {
    pub fn add(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        broadcast_shape("Add", a, b)?;
        same_dtype("Add", a, b)?;
        let (sa, sb) = (a.shape.clone(), b.shape.clone());
        let grad: GradFn = Rc::new(move |dy: &Tensor, _: &Tensor| {
            let (dy_a, dy_b) = (dy.clone(), dy.clone());
            let (sa, sb) = (sa.clone(), sb.clone());
            GradThunks::new()
                .with("a", move |e| e.sum_to(&dy_a, &sa))
                .with("b", move |e| e.sum_to(&dy_b, &sb))
        });
        self.run_kernel("Add", &[("a", a), ("b", b)], |backend| backend.add(a, b), Some(grad))
    }

    /// Addition without broadcasting.
    pub fn add_strict(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        if a.shape != b.shape {
            return Err(Error::shape_mismatch("AddStrict", &a.shape, &b.shape));
        }
        self.add(a, b)
    }

    pub fn sub(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        broadcast_shape("Sub", a, b)?;
        same_dtype("Sub", a, b)?;
        let (sa, sb) = (a.shape.clone(), b.shape.clone());
        let grad: GradFn = Rc::new(move |dy: &Tensor, _: &Tensor| {
            let (dy_a, dy_b) = (dy.clone(), dy.clone());
            let (sa, sb) = (sa.clone(), sb.clone());
            GradThunks::new()
                .with("a", move |e| e.sum_to(&dy_a, &sa))
                .with("b", move |e| {
                    let neg = e.neg(&dy_b)?;
                    e.sum_to(&neg, &sb)
                })
        });
        self.run_kernel("Sub", &[("a", a), ("b", b)], |backend| backend.sub(a, b), Some(grad))
    }

    pub fn mul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        broadcast_shape("Mul", a, b)?;
        same_dtype("Mul", a, b)?;
        let (a_in, b_in) = (a.clone(), b.clone());
        let grad: GradFn = Rc::new(move |dy: &Tensor, _: &Tensor| {
            let (dy_a, dy_b) = (dy.clone(), dy.clone());
            let (a1, b1) = (a_in.clone(), b_in.clone());
            let (a2, b2) = (a_in.clone(), b_in.clone());
            GradThunks::new()
                .with("a", move |e| {
                    let g = e.mul(&dy_a, &b1)?;
                    e.sum_to(&g, &a1.shape)
                })
                .with("b", move |e| {
                    let g = e.mul(&dy_b, &a2)?;
                    e.sum_to(&g, &b2.shape)
                })
        });
        self.run_kernel("Mul", &[("a", a), ("b", b)], |backend| backend.mul(a, b), Some(grad))
    }

    pub fn div(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        broadcast_shape("Div", a, b)?;
        same_dtype("Div", a, b)?;
        let (a_in, b_in) = (a.clone(), b.clone());
        let grad: GradFn = Rc::new(move |dy: &Tensor, _: &Tensor| {
            let (dy_a, dy_b) = (dy.clone(), dy.clone());
            let (a1, b1) = (a_in.clone(), b_in.clone());
            let (a2, b2) = (a_in.clone(), b_in.clone());
            GradThunks::new()
                .with("a", move |e| {
                    let g = e.div(&dy_a, &b1)?;
                    e.sum_to(&g, &a1.shape)
                })
                .with("b", move |e| {
                    // -dy * a / b^2
                    let num = e.mul(&dy_b, &a2)?;
                    let den = e.square(&b2)?;
                    let g = e.neg(&e.div(&num, &den)?)?;
                    e.sum_to(&g, &b2.shape)
                })
        });
        self.run_kernel("Div", &[("a", a), ("b", b)], |backend| backend.div(a, b), Some(grad))
    }

    /// Element-wise maximum. Ties send the gradient to `a`.
    pub fn maximum(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        broadcast_shape("Maximum", a, b)?;
        same_dtype("Maximum", a, b)?;
        let (a_in, b_in) = (a.clone(), b.clone());
        let grad: GradFn = Rc::new(move |dy: &Tensor, _: &Tensor| {
            let (dy_a, dy_b) = (dy.clone(), dy.clone());
            let (a1, b1) = (a_in.clone(), b_in.clone());
            let (a2, b2) = (a_in.clone(), b_in.clone());
            GradThunks::new()
                .with("a", move |e| {
                    let b_wins = e.cast(&e.greater(&b1, &a1)?, DType::Float32)?;
                    let mask = e.sub(&e.scalar(1.0)?, &b_wins)?;
                    let g = e.mul(&dy_a, &mask)?;
                    e.sum_to(&g, &a1.shape)
                })
                .with("b", move |e| {
                    let mask = e.cast(&e.greater(&b2, &a2)?, DType::Float32)?;
                    let g = e.mul(&dy_b, &mask)?;
                    e.sum_to(&g, &b2.shape)
                })
        });
        self.run_kernel(
            "Maximum",
            &[("a", a), ("b", b)],
            |backend| backend.maximum(a, b),
            Some(grad),
        )
    }

    /// `a` raised to `b`, element-wise.
    pub fn pow(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        broadcast_shape("Pow", a, b)?;
        same_dtype("Pow", a, b)?;
        let (a_in, b_in) = (a.clone(), b.clone());
        let grad: GradFn = Rc::new(move |dy: &Tensor, y: &Tensor| {
            let (dy_a, dy_b, y) = (dy.clone(), dy.clone(), y.clone());
            let (a1, b1) = (a_in.clone(), b_in.clone());
            let (a2, b2) = (a_in.clone(), b_in.clone());
            GradThunks::new()
                .with("a", move |e| {
                    // dy * b * a^(b - 1)
                    let exp = e.sub(&b1, &e.scalar(1.0)?)?;
                    let g = e.mul(&dy_a, &e.mul(&b1, &e.pow(&a1, &exp)?)?)?;
                    e.sum_to(&g, &a1.shape)
                })
                .with("b", move |e| {
                    // dy * y * ln(a), zero where a <= 0
                    let safe = e.maximum(&a2, &e.scalar(POW_LOG_EPS)?)?;
                    let positive = e.cast(&e.greater(&a2, &e.scalar(0.0)?)?, DType::Float32)?;
                    let ln = e.mul(&e.log(&safe)?, &positive)?;
                    let g = e.mul(&dy_b, &e.mul(&y, &ln)?)?;
                    e.sum_to(&g, &b2.shape)
                })
        });
        self.run_kernel("Pow", &[("a", a), ("b", b)], |backend| backend.pow(a, b), Some(grad))
    }

    /// `x` raised to a constant power.
    pub fn powf(&self, x: &Tensor, exponent: f32) -> Result<Tensor> {
        self.tidy_named("Powf", || self.pow(x, &self.scalar(exponent)?))
    }

    pub fn neg(&self, x: &Tensor) -> Result<Tensor> {
        let grad: GradFn = Rc::new(|dy: &Tensor, _: &Tensor| {
            let dy = dy.clone();
            GradThunks::new().with("x", move |e| e.neg(&dy))
        });
        self.run_kernel("Neg", &[("x", x)], |backend| backend.neg(x), Some(grad))
    }

    /// `x * x`. Its gradient comes from the two uses of `x` in one `Mul`.
    pub fn square(&self, x: &Tensor) -> Result<Tensor> {
        self.mul(x, x)
    }

    /// Sum `x` over its broadcast axes so the result has `shape`.
    pub fn sum_to(&self, x: &Tensor, shape: &Shape) -> Result<Tensor> {
        if &x.shape == shape {
            return Ok(x.clone());
        }
        if x.shape.broadcast_with(shape).as_ref() != Some(&x.shape) {
            return Err(Error::shape_mismatch("SumTo", shape, &x.shape));
        }
        let axes = shape.reduction_axes_from(&x.shape);
        self.tidy_named("SumTo", || {
            let summed = self.sum(x, Some(&axes), false)?;
            self.reshape(&summed, shape.clone())
        })
    }
}
