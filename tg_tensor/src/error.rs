//! Error types for the engine and its backends.

use thiserror::Error;

use crate::tensor::{DataId, TensorId};

pub type Result<T> = std::result::Result<T, Error>;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Failures reported by a [`KernelBackend`](crate::backend::KernelBackend).
///
/// These are kept distinct from usage errors so callers can decide to retry
/// on another backend. The engine itself never retries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("backend '{backend}' failed to allocate {bytes} bytes")]
    Allocation { backend: String, bytes: usize },

    #[error("data {0} is not synchronously available; use the async read instead")]
    DataPending(DataId),

    #[error("kernel '{kernel}' is not supported by backend '{backend}'")]
    UnsupportedKernel { backend: String, kernel: &'static str },

    #[error("backend has no data for {0}")]
    UnknownData(DataId),

    #[error("backend '{backend}' failed to initialize: {reason}")]
    Init { backend: String, reason: String },

    #[error("kernel '{kernel}' on backend '{backend}' rejected its input: {reason}")]
    InvalidInput {
        backend: String,
        kernel: &'static str,
        reason: String,
    },

    #[error("backend '{backend}' received {got} values for {expected} elements")]
    ValueCount {
        backend: String,
        expected: usize,
        got: usize,
    },
}

/// Errors raised by the engine, its operations and the gradient machinery.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("shape mismatch in '{op}': expected {expected}, got {got}")]
    ShapeMismatch {
        op: String,
        expected: String,
        got: String,
    },

    #[error("dtype mismatch in '{op}': expected {expected}, got {got}")]
    DTypeMismatch {
        op: String,
        expected: String,
        got: String,
    },

    #[error("invalid argument to '{op}': {reason}")]
    InvalidArgument { op: String, reason: String },

    #[error("gradients require a scalar output when no seed gradient is given, got shape {shape}")]
    NonScalarGradient { shape: String },

    #[error("cannot compute gradient: kernel '{kernel}' has no registered gradient function")]
    MissingGradient { kernel: String },

    #[error("gradient of '{kernel}' for input '{input}' has shape {got}, expected {expected}")]
    GradientShape {
        kernel: String,
        input: String,
        expected: String,
        got: String,
    },

    #[error("'{op}' used tensor {id} after it was disposed")]
    DisposedTensor { id: TensorId, op: String },

    #[error("tensor {id} was already disposed")]
    AlreadyDisposed { id: TensorId },

    #[error("variable '{0}' is already registered")]
    VariableExists(String),

    #[error("no variable named '{0}'")]
    UnknownVariable(String),

    #[error("no backend named '{0}' is registered or it failed to initialize")]
    UnknownBackend(String),

    #[error("cannot switch away from backend '{backend}' while {live} data buffers are alive")]
    BackendInUse { backend: String, live: usize },

    #[error("no registered backend could be initialized")]
    NoBackend,

    #[error("kernel '{kernel}' produced NaN")]
    NanDetected { kernel: String },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl Error {
    pub(crate) fn invalid_argument(op: &str, reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            op: op.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape_mismatch(op: &str, expected: impl ToString, got: impl ToString) -> Self {
        Error::ShapeMismatch {
            op: op.to_string(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    pub(crate) fn dtype_mismatch(op: &str, expected: impl ToString, got: impl ToString) -> Self {
        Error::DTypeMismatch {
            op: op.to_string(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}
