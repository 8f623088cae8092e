//! # tg_tensor - Tape-based Autodiff with Scoped Tensor Memory
//!
//! This crate provides a reverse-mode automatic differentiation engine over
//! pluggable compute backends, with explicit memory scoping that releases
//! backend storage deterministically.
//!
//! ## Overview
//!
//! The core abstractions are:
//! - [`Engine`] - Owns the active backend, live tensors, scopes, tape and variables
//! - [`KernelBackend`] - Trait for compute backends executing numeric primitives
//! - [`BackendRegistry`] - Named backend factories, picked by priority
//! - [`Tensor`] - Immutable handle to backend storage
//! - [`Variable`] - Named, mutable binding that outlives scopes
//!
//! ## Example
//!
//! ```ignore
//! use tg_tensor::prelude::*;
//! use tg_backend_cpu::cpu_engine;
//!
//! let e = cpu_engine()?;
//! let x = e.tensor1d(&[1.0, 2.0, 3.0])?;
//!
//! // dy/dx of sum(x^2) = 2x; every intermediate is released
//! let dx = e.grad(|x| e.sum(&e.square(x)?, None, false), &x, None)?;
//! assert_eq!(e.to_vec(&dx)?, vec![2.0, 4.0, 6.0]);
//! ```

pub mod backend;
pub mod config;
pub mod dtype;
pub mod engine;
pub mod error;
pub mod gradients;
pub mod ops;
pub mod profiler;
pub mod scope;
pub mod shape;
pub mod tape;
pub mod tensor;
pub mod variable;

pub use backend::{BackendFactory, BackendRegistry, KernelBackend, TensorInfo};
pub use config::EngineConfig;
pub use dtype::{DType, TensorValues};
pub use engine::{Engine, MemoryInfo};
pub use error::{BackendError, BackendResult, Error, Result};
pub use gradients::{CustomGradFn, CustomGradient, ValueAndGrad, ValueAndGrads, VariableGrads};
pub use profiler::{KernelProfile, ProfileInfo, TimingInfo};
pub use scope::TensorContainer;
pub use shape::{Shape, Strides};
pub use tape::{GradFn, GradThunk, GradThunks};
pub use tensor::{DataId, Tensor, TensorId, Variable};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::{BackendRegistry, KernelBackend};
    pub use crate::config::EngineConfig;
    pub use crate::dtype::{DType, TensorValues};
    pub use crate::engine::Engine;
    pub use crate::error::{Error, Result};
    pub use crate::gradients::CustomGradient;
    pub use crate::scope::TensorContainer;
    pub use crate::shape::Shape;
    pub use crate::tensor::{Tensor, Variable};
}
