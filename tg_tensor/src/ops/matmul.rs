use std::rc::Rc;

use super::{expect_float, same_dtype};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::tape::{GradFn, GradThunks};
use crate::tensor::Tensor;

impl Engine {
    /// Matrix product of rank-2 tensors, optionally transposing either side.
    pub fn matmul(
        &self,
        a: &Tensor,
        b: &Tensor,
        transpose_a: bool,
        transpose_b: bool,
    ) -> Result<Tensor> {
        if a.rank() != 2 || b.rank() != 2 {
            return Err(Error::invalid_argument(
                "BatchMatMul",
                format!("expected rank-2 operands, got {} and {}", a.shape, b.shape),
            ));
        }
        expect_float("BatchMatMul", a)?;
        same_dtype("BatchMatMul", a, b)?;
        let inner_a = if transpose_a { a.shape.dim(0) } else { a.shape.dim(1) };
        let inner_b = if transpose_b { b.shape.dim(1) } else { b.shape.dim(0) };
        if inner_a != inner_b {
            return Err(Error::shape_mismatch(
                "BatchMatMul",
                format!("inner dimensions to agree for {} x {}", a.shape, b.shape),
                format!("{inner_a} vs {inner_b}"),
            ));
        }

        let (a_in, b_in) = (a.clone(), b.clone());
        let grad: GradFn = Rc::new(move |dy: &Tensor, _: &Tensor| {
            let (dy_a, dy_b) = (dy.clone(), dy.clone());
            let (a, b) = (a_in.clone(), b_in.clone());
            GradThunks::new()
                .with("a", move |e| match (transpose_a, transpose_b) {
                    (false, false) => e.matmul(&dy_a, &b, false, true),
                    (false, true) => e.matmul(&dy_a, &b, false, false),
                    (true, false) => e.matmul(&b, &dy_a, false, true),
                    (true, true) => e.matmul(&b, &dy_a, true, true),
                })
                .with("b", move |e| match (transpose_a, transpose_b) {
                    (false, false) => e.matmul(&a, &dy_b, true, false),
                    (false, true) => e.matmul(&dy_b, &a, true, false),
                    (true, false) => e.matmul(&a, &dy_b, false, false),
                    (true, true) => e.matmul(&dy_b, &a, true, true),
                })
        });
        self.run_kernel(
            "BatchMatMul",
            &[("a", a), ("b", b)],
            |backend| backend.matmul(a, b, transpose_a, transpose_b),
            Some(grad),
        )
    }
}
