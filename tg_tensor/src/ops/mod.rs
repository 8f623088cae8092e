//! Differentiable operations.
//!
//! Each operation validates its arguments, dispatches one kernel through
//! [`Engine::run_kernel`](crate::Engine::run_kernel) and attaches the
//! backward rule as a [`GradFn`](crate::tape::GradFn). Backward rules are
//! themselves built from these operations, so they can be differentiated
//! again.

mod arithmetic;
mod creation;
mod manipulation;
mod matmul;
mod reduction;
mod unary;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Broadcast shape of a binary operation.
pub(crate) fn broadcast_shape(op: &str, a: &Tensor, b: &Tensor) -> Result<Shape> {
    a.shape
        .broadcast_with(&b.shape)
        .ok_or_else(|| Error::shape_mismatch(op, &a.shape, &b.shape))
}

pub(crate) fn same_dtype(op: &str, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.dtype != b.dtype {
        return Err(Error::dtype_mismatch(op, a.dtype, b.dtype));
    }
    Ok(())
}

pub(crate) fn expect_float(op: &str, x: &Tensor) -> Result<()> {
    if x.dtype != DType::Float32 {
        return Err(Error::dtype_mismatch(op, DType::Float32, x.dtype));
    }
    Ok(())
}
