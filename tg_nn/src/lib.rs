//! # tg_nn - Training Utilities for tg_tensor
//!
//! This crate provides neural network building blocks on top of the tg_tensor engine:
//!
//! - **Layers**: Linear (fully connected), parameters held as variables
//! - **Activations**: Softmax, Log-Softmax, and a custom-gradient Log-Sum-Exp
//! - **Losses**: MSE, Binary Cross-Entropy, Soft Cross-Entropy
//! - **Optimizers**: SGD (with momentum), Adam
//!
//! ## Example: Fitting a Linear Model
//!
//! ```ignore
//! use tg_backend_cpu::cpu_engine;
//! use tg_nn::{mse_loss, Linear, Optimizer, Sgd};
//!
//! let e = cpu_engine()?;
//! let layer = Linear::new(&e, "dense", 2, 1, true)?;
//! let mut opt = Sgd::with_momentum(0.05, 0.9);
//!
//! let x = e.tensor2d(&[1.0, 2.0, 3.0, 4.0], 2, 2)?;
//! let y = e.tensor2d(&[5.0, 11.0], 2, 1)?;
//!
//! for _ in 0..100 {
//!     // gradients of every trainable variable, applied and released
//!     opt.minimize(&e, || mse_loss(&e, &layer.forward(&e, &x)?, &y), None, false)?;
//! }
//! ```

pub mod activations;
pub mod layers;
pub mod loss;
pub mod optim;

// Re-exports for convenience
pub use activations::{log_softmax, log_sum_exp, softmax};
pub use layers::Linear;
pub use loss::{binary_cross_entropy_with_logits, mse_loss, soft_cross_entropy_loss};
pub use optim::{Adam, Optimizer, Sgd};
