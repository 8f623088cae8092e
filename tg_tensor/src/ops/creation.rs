use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::Result;
use crate::shape::Shape;
use crate::tensor::Tensor;

impl Engine {
    /// A tensor of `shape` with every element set to `value`.
    pub fn fill(&self, shape: impl Into<Shape>, value: f32, dtype: DType) -> Result<Tensor> {
        let shape = shape.into();
        self.run_kernel("Fill", &[], |backend| backend.fill(&shape, value, dtype), None)
    }

    pub fn zeros(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        self.fill(shape, 0.0, DType::Float32)
    }

    pub fn ones(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        self.fill(shape, 1.0, DType::Float32)
    }

    pub fn zeros_like(&self, x: &Tensor) -> Result<Tensor> {
        self.fill(x.shape.clone(), 0.0, x.dtype)
    }

    pub fn ones_like(&self, x: &Tensor) -> Result<Tensor> {
        self.fill(x.shape.clone(), 1.0, x.dtype)
    }
}
