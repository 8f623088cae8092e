//! Layers holding their parameters as engine variables.

mod linear;

pub use linear::Linear;
