//! Reductions over a set of axes.
//!
//! `axes: None` reduces every axis. Kernels drop the reduced axes; with
//! `keepdims` the result is reshaped to keep them as size-1 dimensions.

use std::rc::Rc;

use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::tape::{GradFn, GradThunks};
use crate::tensor::Tensor;

impl Engine {
    pub fn sum(&self, x: &Tensor, axes: Option<&[usize]>, keepdims: bool) -> Result<Tensor> {
        let axes = x.shape.normalize_axes("Sum", axes)?;
        let x_shape = x.shape.clone();
        let kept = x.shape.reduced(&axes, true);
        let grad: GradFn = Rc::new(move |dy: &Tensor, _: &Tensor| {
            let (dy, x_shape, kept) = (dy.clone(), x_shape.clone(), kept.clone());
            GradThunks::new().with("x", move |e| {
                let dy = e.reshape(&dy, kept)?;
                e.broadcast_to(&dy, x_shape)
            })
        });
        let run = || self.run_kernel("Sum", &[("x", x)], |backend| backend.sum(x, &axes), Some(grad));
        if keepdims {
            self.tidy_named("Sum", || self.reshape(&run()?, x.shape.reduced(&axes, true)))
        } else {
            run()
        }
    }

    pub fn mean(&self, x: &Tensor, axes: Option<&[usize]>, keepdims: bool) -> Result<Tensor> {
        let normalized = x.shape.normalize_axes("Mean", axes)?;
        let count: usize = normalized.iter().map(|&ax| x.shape.dim(ax)).product();
        if count == 0 {
            return Err(Error::invalid_argument("Mean", "cannot average over an empty axis"));
        }
        self.tidy_named("Mean", || {
            let total = if x.dtype == DType::Float32 {
                self.sum(x, Some(&normalized), keepdims)?
            } else {
                self.sum(&self.cast(x, DType::Float32)?, Some(&normalized), keepdims)?
            };
            self.div(&total, &self.scalar(count as f32)?)
        })
    }

    /// Maximum over `axes`. Every position equal to the maximum receives the
    /// gradient.
    pub fn max(&self, x: &Tensor, axes: Option<&[usize]>, keepdims: bool) -> Result<Tensor> {
        let axes = x.shape.normalize_axes("Max", axes)?;
        if x.numel() == 0 {
            return Err(Error::invalid_argument("Max", "cannot reduce an empty tensor"));
        }
        let x_in = x.clone();
        let kept = x.shape.reduced(&axes, true);
        let grad: GradFn = Rc::new(move |dy: &Tensor, y: &Tensor| {
            let (dy, y, x, kept) = (dy.clone(), y.clone(), x_in.clone(), kept.clone());
            GradThunks::new().with("x", move |e| {
                let y = e.reshape(&y, kept.clone())?;
                let dy = e.reshape(&dy, kept)?;
                let mask = e.cast(&e.equal(&x, &y)?, x.dtype)?;
                e.mul(&mask, &dy)
            })
        });
        let run = || self.run_kernel("Max", &[("x", x)], |backend| backend.max(x, &axes), Some(grad));
        if keepdims {
            self.tidy_named("Max", || self.reshape(&run()?, x.shape.reduced(&axes, true)))
        } else {
            run()
        }
    }
}
