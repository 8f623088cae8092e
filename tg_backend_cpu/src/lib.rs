//! CPU Backend for tg_tensor.
//!
//! Every dtype is stored as a flat, row-major `Vec<f32>`; int32 and bool
//! results are normalized on store. Storage is always synchronously
//! readable, so [`KernelBackend::read`] resolves immediately.

use std::collections::HashMap;

use futures::future::{BoxFuture, FutureExt};
use tg_tensor::prelude::*;
use tg_tensor::{BackendError, BackendResult, DataId, TensorInfo};

mod kernels;

use kernels::{binary_op_broadcast, broadcast_values, matmul_2d, reduce_op, transpose_values};

/// Registry name of the CPU backend.
pub const CPU_BACKEND_NAME: &str = "cpu";

/// Lowest priority: the CPU backend is the fallback of last resort.
pub const CPU_BACKEND_PRIORITY: i32 = 1;

/// CPU storage for one data id.
#[derive(Clone, Debug)]
struct CpuBuffer {
    values: Vec<f32>,
    dtype: DType,
}

/// Reference backend running every kernel on the host.
#[derive(Debug, Default)]
pub struct CpuBackend {
    buffers: HashMap<DataId, CpuBuffer>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self, t: &Tensor) -> BackendResult<&[f32]> {
        self.buffers
            .get(&t.data_id())
            .map(|b| b.values.as_slice())
            .ok_or(BackendError::UnknownData(t.data_id()))
    }

    /// Store a kernel result under a fresh data id.
    fn store(&mut self, mut values: Vec<f32>, shape: Shape, dtype: DType) -> TensorInfo {
        normalize(&mut values, dtype);
        let data_id = DataId::next();
        self.buffers.insert(data_id, CpuBuffer { values, dtype });
        TensorInfo::new(data_id, shape, dtype)
    }

    fn unary<F>(&mut self, x: &Tensor, op: F) -> BackendResult<TensorInfo>
    where
        F: Fn(f32) -> f32,
    {
        let data = self.values(x)?.iter().map(|&v| op(v)).collect();
        Ok(self.store(data, x.shape().clone(), x.dtype()))
    }

    fn binary<F>(
        &mut self,
        kernel: &'static str,
        a: &Tensor,
        b: &Tensor,
        dtype: DType,
        op: F,
    ) -> BackendResult<TensorInfo>
    where
        F: Fn(f32, f32) -> f32,
    {
        let (data, shape) = binary_op_broadcast(self.values(a)?, a.shape(), self.values(b)?, b.shape(), op)
            .ok_or_else(|| invalid_input(kernel, format!("cannot broadcast {} with {}", a.shape(), b.shape())))?;
        Ok(self.store(data, shape, dtype))
    }

    fn reduce<F>(&mut self, x: &Tensor, axes: &[usize], init: f32, dtype: DType, op: F) -> BackendResult<TensorInfo>
    where
        F: Fn(f32, f32) -> f32,
    {
        let (data, shape) = reduce_op(self.values(x)?, x.shape(), axes, init, op);
        Ok(self.store(data, shape, dtype))
    }
}

fn invalid_input(kernel: &'static str, reason: String) -> BackendError {
    BackendError::InvalidInput {
        backend: CPU_BACKEND_NAME.to_string(),
        kernel,
        reason,
    }
}

/// Bring stored values in line with `dtype`.
fn normalize(values: &mut [f32], dtype: DType) {
    match dtype {
        DType::Float32 => {}
        DType::Int32 => values.iter_mut().for_each(|v| *v = v.trunc()),
        DType::Bool => values
            .iter_mut()
            .for_each(|v| *v = if *v != 0.0 { 1.0 } else { 0.0 }),
    }
}

fn flag(cond: bool) -> f32 {
    if cond {
        1.0
    } else {
        0.0
    }
}

impl KernelBackend for CpuBackend {
    fn name(&self) -> &str {
        CPU_BACKEND_NAME
    }

    // === Storage ===

    fn allocate(&mut self, shape: &Shape, dtype: DType) -> BackendResult<DataId> {
        let data_id = DataId::next();
        self.buffers.insert(
            data_id,
            CpuBuffer {
                values: vec![0.0; shape.numel()],
                dtype,
            },
        );
        Ok(data_id)
    }

    fn write(&mut self, data_id: DataId, values: TensorValues) -> BackendResult<()> {
        let buffer = self
            .buffers
            .get_mut(&data_id)
            .ok_or(BackendError::UnknownData(data_id))?;
        if values.len() != buffer.values.len() {
            return Err(BackendError::ValueCount {
                backend: CPU_BACKEND_NAME.to_string(),
                expected: buffer.values.len(),
                got: values.len(),
            });
        }
        buffer.dtype = values.dtype();
        buffer.values = values.to_f32_vec();
        normalize(&mut buffer.values, buffer.dtype);
        Ok(())
    }

    fn read(&self, data_id: DataId) -> BoxFuture<'static, BackendResult<TensorValues>> {
        futures::future::ready(self.read_sync(data_id)).boxed()
    }

    fn read_sync(&self, data_id: DataId) -> BackendResult<TensorValues> {
        let buffer = self
            .buffers
            .get(&data_id)
            .ok_or(BackendError::UnknownData(data_id))?;
        Ok(TensorValues::from_f32(buffer.values.clone(), buffer.dtype))
    }

    fn dispose_data(&mut self, data_id: DataId) -> BackendResult<()> {
        let buffer = self
            .buffers
            .remove(&data_id)
            .ok_or(BackendError::UnknownData(data_id))?;
        log::trace!("freed {} values of {:?}", buffer.values.len(), buffer.dtype);
        Ok(())
    }

    fn num_data_ids(&self) -> usize {
        self.buffers.len()
    }

    // === Creation ===

    fn fill(&mut self, shape: &Shape, value: f32, dtype: DType) -> BackendResult<TensorInfo> {
        Ok(self.store(vec![value; shape.numel()], shape.clone(), dtype))
    }

    fn identity(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        let data = self.values(x)?.to_vec();
        Ok(self.store(data, x.shape().clone(), x.dtype()))
    }

    fn cast(&mut self, x: &Tensor, dtype: DType) -> BackendResult<TensorInfo> {
        let data = self.values(x)?.to_vec();
        Ok(self.store(data, x.shape().clone(), dtype))
    }

    // === Unary element-wise ===

    fn neg(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        self.unary(x, |v| -v)
    }

    fn exp(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        self.unary(x, f32::exp)
    }

    fn log(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        self.unary(x, f32::ln)
    }

    fn sqrt(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        self.unary(x, f32::sqrt)
    }

    fn abs(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        self.unary(x, f32::abs)
    }

    fn relu(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        self.unary(x, |v| v.max(0.0))
    }

    fn sigmoid(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        self.unary(x, |v| 1.0 / (1.0 + (-v).exp()))
    }

    fn tanh(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        self.unary(x, f32::tanh)
    }

    fn sin(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        self.unary(x, f32::sin)
    }

    fn cos(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        self.unary(x, f32::cos)
    }

    // === Binary element-wise with broadcasting ===

    fn add(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        self.binary("Add", a, b, a.dtype(), |x, y| x + y)
    }

    fn sub(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        self.binary("Sub", a, b, a.dtype(), |x, y| x - y)
    }

    fn mul(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        self.binary("Mul", a, b, a.dtype(), |x, y| x * y)
    }

    fn div(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        self.binary("Div", a, b, a.dtype(), |x, y| x / y)
    }

    fn pow(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        self.binary("Pow", a, b, a.dtype(), f32::powf)
    }

    fn maximum(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        self.binary("Maximum", a, b, a.dtype(), f32::max)
    }

    // === Comparison ===

    fn greater(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        self.binary("Greater", a, b, DType::Bool, |x, y| flag(x > y))
    }

    fn equal(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        self.binary("Equal", a, b, DType::Bool, |x, y| flag(x == y))
    }

    // === Reductions ===

    fn sum(&mut self, x: &Tensor, axes: &[usize]) -> BackendResult<TensorInfo> {
        let dtype = match x.dtype() {
            DType::Bool => DType::Int32,
            dtype => dtype,
        };
        self.reduce(x, axes, 0.0, dtype, |acc, v| acc + v)
    }

    fn max(&mut self, x: &Tensor, axes: &[usize]) -> BackendResult<TensorInfo> {
        self.reduce(x, axes, f32::NEG_INFINITY, x.dtype(), f32::max)
    }

    // === Linear algebra ===

    fn matmul(
        &mut self,
        a: &Tensor,
        b: &Tensor,
        transpose_a: bool,
        transpose_b: bool,
    ) -> BackendResult<TensorInfo> {
        if a.rank() != 2 || b.rank() != 2 {
            return Err(invalid_input("BatchMatMul", format!("{} x {} is not rank 2", a.shape(), b.shape())));
        }
        let (data, shape) = matmul_2d(
            self.values(a)?,
            a.shape(),
            self.values(b)?,
            b.shape(),
            transpose_a,
            transpose_b,
        )
        .ok_or_else(|| invalid_input("BatchMatMul", format!("inner dimensions of {} x {} differ", a.shape(), b.shape())))?;
        Ok(self.store(data, shape, a.dtype()))
    }

    // === Shape operations ===

    fn transpose(&mut self, x: &Tensor, perm: &[usize]) -> BackendResult<TensorInfo> {
        let (data, shape) = transpose_values(self.values(x)?, x.shape(), perm);
        Ok(self.store(data, shape, x.dtype()))
    }

    fn broadcast_to(&mut self, x: &Tensor, shape: &Shape) -> BackendResult<TensorInfo> {
        if x.shape().broadcast_with(shape).as_ref() != Some(shape) {
            return Err(invalid_input("BroadcastTo", format!("cannot broadcast {} to {shape}", x.shape())));
        }
        let data = broadcast_values(self.values(x)?, x.shape(), shape);
        Ok(self.store(data, shape.clone(), x.dtype()))
    }
}

/// Register the CPU backend under [`CPU_BACKEND_NAME`].
pub fn register(registry: &mut BackendRegistry) -> bool {
    registry.register(CPU_BACKEND_NAME, CPU_BACKEND_PRIORITY, || {
        log::debug!("initializing cpu backend");
        Ok(Box::new(CpuBackend::new()) as Box<dyn KernelBackend>)
    })
}

/// An engine with only the CPU backend registered.
pub fn cpu_engine() -> Result<Engine> {
    cpu_engine_with(EngineConfig::default())
}

pub fn cpu_engine_with(config: EngineConfig) -> Result<Engine> {
    let mut registry = BackendRegistry::new();
    register(&mut registry);
    Engine::new(registry, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        cpu_engine().unwrap()
    }

    #[test]
    fn test_tensor_creation() {
        let e = engine();
        let t = e.zeros([2, 3]).unwrap();
        assert_eq!(t.dims(), &[2, 3]);
        assert_eq!(e.to_vec(&t).unwrap(), vec![0.0; 6]);

        let s = e.scalar(42.0).unwrap();
        assert!(s.is_scalar());
        assert_eq!(e.item(&s).unwrap(), 42.0);
    }

    #[test]
    fn test_unary_ops() {
        let e = engine();
        let x = e.tensor1d(&[1.0, 2.0, -3.0]).unwrap();
        assert_eq!(e.to_vec(&e.neg(&x).unwrap()).unwrap(), vec![-1.0, -2.0, 3.0]);
        assert_eq!(e.to_vec(&e.relu(&x).unwrap()).unwrap(), vec![1.0, 2.0, 0.0]);
        assert_eq!(e.to_vec(&e.abs(&x).unwrap()).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_binary_ops() {
        let e = engine();
        let a = e.tensor1d(&[1.0, 2.0, 3.0]).unwrap();
        let b = e.tensor1d(&[4.0, 5.0, 6.0]).unwrap();
        assert_eq!(e.to_vec(&e.add(&a, &b).unwrap()).unwrap(), vec![5.0, 7.0, 9.0]);
        assert_eq!(e.to_vec(&e.mul(&a, &b).unwrap()).unwrap(), vec![4.0, 10.0, 18.0]);

        let ten = e.scalar(10.0).unwrap();
        assert_eq!(e.to_vec(&e.add(&a, &ten).unwrap()).unwrap(), vec![11.0, 12.0, 13.0]);
    }

    #[test]
    fn test_comparison_is_bool() {
        let e = engine();
        let a = e.tensor1d(&[1.0, 5.0]).unwrap();
        let b = e.tensor1d(&[2.0, 5.0]).unwrap();
        let gt = e.greater(&b, &a).unwrap();
        assert_eq!(gt.dtype(), DType::Bool);
        assert_eq!(e.read_sync(&gt).unwrap(), TensorValues::Bool(vec![true, false]));
        let eq = e.equal(&a, &b).unwrap();
        assert_eq!(e.to_vec(&eq).unwrap(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_int_storage_truncates() {
        let e = engine();
        let x = e.tensor(vec![7, -7], [2]).unwrap();
        let two = e.tensor(vec![2, 2], [2]).unwrap();
        let q = e.div(&x, &two).unwrap();
        assert_eq!(e.read_sync(&q).unwrap(), TensorValues::Int32(vec![3, -3]));
    }

    #[test]
    fn test_write_checks_length() {
        let mut backend = CpuBackend::new();
        let id = backend.allocate(&Shape::new(vec![2]), DType::Float32).unwrap();
        let err = backend.write(id, TensorValues::from(vec![1.0, 2.0, 3.0])).unwrap_err();
        assert!(matches!(err, BackendError::ValueCount { expected: 2, got: 3, .. }));
        backend.dispose_data(id).unwrap();
        assert_eq!(backend.dispose_data(id), Err(BackendError::UnknownData(id)));
        assert_eq!(backend.num_data_ids(), 0);
    }
}
