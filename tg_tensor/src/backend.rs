//! Backend trait - abstraction for compute backends (CPU, GPU, WASM).
//!
//! A backend owns raw storage and executes numeric primitives. It never does
//! gradient or scope bookkeeping; the [`Engine`](crate::Engine) does that
//! around every call.

use std::fmt;

use futures::future::BoxFuture;

use crate::dtype::{DType, TensorValues};
use crate::error::{BackendError, BackendResult};
use crate::shape::Shape;
use crate::tensor::{DataId, Tensor};

/// Storage produced by a kernel, before the engine wraps it in a [`Tensor`].
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub data_id: DataId,
    pub shape: Shape,
    pub dtype: DType,
}

impl TensorInfo {
    pub fn new(data_id: DataId, shape: Shape, dtype: DType) -> Self {
        TensorInfo {
            data_id,
            shape,
            dtype,
        }
    }
}

/// Error for a primitive the backend does not implement.
pub fn unsupported(backend: &str, kernel: &'static str) -> BackendError {
    BackendError::UnsupportedKernel {
        backend: backend.to_string(),
        kernel,
    }
}

/// Capability contract every execution backend implements.
///
/// Inputs to numeric primitives are already validated by the operation
/// wrappers: dtypes are compatible and shapes broadcast. Every primitive
/// returns freshly allocated storage. Primitives a backend does not provide
/// keep the default body and fail with [`BackendError::UnsupportedKernel`].
pub trait KernelBackend {
    /// Registry name of this backend.
    fn name(&self) -> &str;

    // === Storage ===

    /// Reserve storage for a tensor of `shape` and `dtype`.
    fn allocate(&mut self, shape: &Shape, dtype: DType) -> BackendResult<DataId>;

    /// Overwrite the contents of `data_id`.
    fn write(&mut self, data_id: DataId, values: TensorValues) -> BackendResult<()>;

    /// Read values back, possibly waiting on the device.
    fn read(&self, data_id: DataId) -> BoxFuture<'static, BackendResult<TensorValues>>;

    /// Read values back without waiting. Fails with
    /// [`BackendError::DataPending`] if the data is still in flight.
    fn read_sync(&self, data_id: DataId) -> BackendResult<TensorValues>;

    /// Release storage. Releasing an unknown id is an error.
    fn dispose_data(&mut self, data_id: DataId) -> BackendResult<()>;

    /// Number of storage buffers currently held.
    fn num_data_ids(&self) -> usize;

    // === Creation ===

    fn fill(&mut self, shape: &Shape, value: f32, dtype: DType) -> BackendResult<TensorInfo> {
        let _ = (shape, value, dtype);
        Err(unsupported(self.name(), "Fill"))
    }

    /// Copy `x` into new storage.
    fn identity(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        let _ = x;
        Err(unsupported(self.name(), "Identity"))
    }

    fn cast(&mut self, x: &Tensor, dtype: DType) -> BackendResult<TensorInfo> {
        let _ = (x, dtype);
        Err(unsupported(self.name(), "Cast"))
    }

    // === Element-wise unary ===

    fn neg(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        let _ = x;
        Err(unsupported(self.name(), "Neg"))
    }

    fn exp(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        let _ = x;
        Err(unsupported(self.name(), "Exp"))
    }

    fn log(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        let _ = x;
        Err(unsupported(self.name(), "Log"))
    }

    fn sqrt(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        let _ = x;
        Err(unsupported(self.name(), "Sqrt"))
    }

    fn abs(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        let _ = x;
        Err(unsupported(self.name(), "Abs"))
    }

    fn relu(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        let _ = x;
        Err(unsupported(self.name(), "Relu"))
    }

    fn sigmoid(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        let _ = x;
        Err(unsupported(self.name(), "Sigmoid"))
    }

    fn tanh(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        let _ = x;
        Err(unsupported(self.name(), "Tanh"))
    }

    fn sin(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        let _ = x;
        Err(unsupported(self.name(), "Sin"))
    }

    fn cos(&mut self, x: &Tensor) -> BackendResult<TensorInfo> {
        let _ = x;
        Err(unsupported(self.name(), "Cos"))
    }

    // === Element-wise binary (broadcasting) ===

    fn add(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        let _ = (a, b);
        Err(unsupported(self.name(), "Add"))
    }

    fn sub(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        let _ = (a, b);
        Err(unsupported(self.name(), "Sub"))
    }

    fn mul(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        let _ = (a, b);
        Err(unsupported(self.name(), "Mul"))
    }

    fn div(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        let _ = (a, b);
        Err(unsupported(self.name(), "Div"))
    }

    fn pow(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        let _ = (a, b);
        Err(unsupported(self.name(), "Pow"))
    }

    fn maximum(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        let _ = (a, b);
        Err(unsupported(self.name(), "Maximum"))
    }

    // === Comparison (bool outputs) ===

    fn greater(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        let _ = (a, b);
        Err(unsupported(self.name(), "Greater"))
    }

    fn equal(&mut self, a: &Tensor, b: &Tensor) -> BackendResult<TensorInfo> {
        let _ = (a, b);
        Err(unsupported(self.name(), "Equal"))
    }

    // === Reductions ===
    // `axes` is sorted and valid; reduced axes are removed from the output.

    fn sum(&mut self, x: &Tensor, axes: &[usize]) -> BackendResult<TensorInfo> {
        let _ = (x, axes);
        Err(unsupported(self.name(), "Sum"))
    }

    fn max(&mut self, x: &Tensor, axes: &[usize]) -> BackendResult<TensorInfo> {
        let _ = (x, axes);
        Err(unsupported(self.name(), "Max"))
    }

    // === Linear algebra ===

    /// Rank-2 matrix product with optional transposition of either operand.
    fn matmul(
        &mut self,
        a: &Tensor,
        b: &Tensor,
        transpose_a: bool,
        transpose_b: bool,
    ) -> BackendResult<TensorInfo> {
        let _ = (a, b, transpose_a, transpose_b);
        Err(unsupported(self.name(), "BatchMatMul"))
    }

    // === Shape ===

    fn transpose(&mut self, x: &Tensor, perm: &[usize]) -> BackendResult<TensorInfo> {
        let _ = (x, perm);
        Err(unsupported(self.name(), "Transpose"))
    }

    fn broadcast_to(&mut self, x: &Tensor, shape: &Shape) -> BackendResult<TensorInfo> {
        let _ = (x, shape);
        Err(unsupported(self.name(), "BroadcastTo"))
    }
}

/// Constructor for a backend; may fail, e.g. when no device is present.
pub type BackendFactory = Box<dyn Fn() -> BackendResult<Box<dyn KernelBackend>>>;

struct RegistryEntry {
    name: String,
    priority: i32,
    factory: BackendFactory,
}

/// Name -> factory table used to pick the active backend.
///
/// Higher priority wins; the engine falls back down the list when a
/// factory fails.
#[derive(Default)]
pub struct BackendRegistry {
    entries: Vec<RegistryEntry>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (&e.name, e.priority)))
            .finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend factory. Returns `false` (and leaves the registry
    /// unchanged) if `name` is already taken.
    pub fn register<F>(&mut self, name: &str, priority: i32, factory: F) -> bool
    where
        F: Fn() -> BackendResult<Box<dyn KernelBackend>> + 'static,
    {
        if self.contains(name) {
            log::warn!("backend '{name}' was already registered");
            return false;
        }
        self.entries.push(RegistryEntry {
            name: name.to_string(),
            priority,
            factory: Box::new(factory),
        });
        true
    }

    /// Remove a backend; returns whether it was present.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        self.entries.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn priority(&self, name: &str) -> Option<i32> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.priority)
    }

    /// Registered names, best first. Ties keep registration order.
    pub fn names_by_priority(&self) -> Vec<String> {
        let mut sorted: Vec<&RegistryEntry> = self.entries.iter().collect();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));
        sorted.into_iter().map(|e| e.name.clone()).collect()
    }

    /// Run the factory registered under `name`.
    pub fn create(&self, name: &str) -> BackendResult<Box<dyn KernelBackend>> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| BackendError::Init {
                backend: name.to_string(),
                reason: "not registered".to_string(),
            })?;
        (entry.factory)()
    }
}
