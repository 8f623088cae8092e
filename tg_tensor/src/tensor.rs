//! Tensor and variable handles.
//!
//! A [`Tensor`] does not own memory. It names backend storage through a
//! [`DataId`] whose lifetime is managed by the [`Engine`](crate::Engine):
//! storage is released when the tensor is disposed, either explicitly or
//! when the scope that tracks it exits.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::dtype::DType;
use crate::shape::Shape;

/// Global counter for storage handles, shared by every backend.
static DATA_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque handle to backend-owned storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId(u64);

impl DataId {
    /// Allocate a fresh, never reused handle. Backends call this from `allocate`.
    pub fn next() -> Self {
        DataId(DATA_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data#{}", self.0)
    }
}

/// Engine-unique tensor identity. Ids increase in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u64);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor#{}", self.0)
    }
}

/// Immutable handle to a multidimensional array living in a backend.
///
/// Cloning a `Tensor` copies the handle, not the data; all clones are
/// disposed together.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    pub(crate) id: TensorId,
    pub(crate) shape: Shape,
    pub(crate) dtype: DType,
    pub(crate) data_id: DataId,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish()
    }
}

impl Tensor {
    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn data_id(&self) -> DataId {
        self.data_id
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_scalar()
    }

    /// Storage footprint in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype.byte_size()
    }
}

/// A named, mutable binding registered with the engine.
///
/// The variable's tensor id is stable across [`Engine::assign`](crate::Engine::assign);
/// only the storage it points at changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Variable {
    pub(crate) name: String,
    pub(crate) id: TensorId,
    pub(crate) trainable: bool,
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_ids_are_unique() {
        let a = DataId::next();
        let b = DataId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_tensor_accessors() {
        let t = Tensor {
            id: TensorId(7),
            shape: Shape::new(vec![2, 3]),
            dtype: DType::Int32,
            data_id: DataId::next(),
        };
        assert_eq!(t.rank(), 2);
        assert_eq!(t.numel(), 6);
        assert_eq!(t.size_in_bytes(), 24);
        assert_eq!(t.id().to_string(), "tensor#7");
    }
}
