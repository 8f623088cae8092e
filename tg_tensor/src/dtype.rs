//! Element types and host-side value buffers.

use std::fmt;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    #[default]
    Float32,
    Int32,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn byte_size(self) -> usize {
        match self {
            DType::Float32 | DType::Int32 => 4,
            DType::Bool => 1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Float32 => "float32",
            DType::Int32 => "int32",
            DType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Flat, row-major values moving between host and backend.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValues {
    Float32(Vec<f32>),
    Int32(Vec<i32>),
    Bool(Vec<bool>),
}

impl TensorValues {
    pub fn dtype(&self) -> DType {
        match self {
            TensorValues::Float32(_) => DType::Float32,
            TensorValues::Int32(_) => DType::Int32,
            TensorValues::Bool(_) => DType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorValues::Float32(v) => v.len(),
            TensorValues::Int32(v) => v.len(),
            TensorValues::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert every element to `f32` (bools become 0.0 / 1.0).
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            TensorValues::Float32(v) => v.clone(),
            TensorValues::Int32(v) => v.iter().map(|&x| x as f32).collect(),
            TensorValues::Bool(v) => v.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect(),
        }
    }

    /// Build values of `dtype` from `f32` storage.
    pub fn from_f32(data: Vec<f32>, dtype: DType) -> Self {
        match dtype {
            DType::Float32 => TensorValues::Float32(data),
            DType::Int32 => TensorValues::Int32(data.into_iter().map(|x| x as i32).collect()),
            DType::Bool => TensorValues::Bool(data.into_iter().map(|x| x != 0.0).collect()),
        }
    }

    /// True if any float element is NaN.
    pub fn has_nan(&self) -> bool {
        match self {
            TensorValues::Float32(v) => v.iter().any(|x| x.is_nan()),
            _ => false,
        }
    }
}

impl From<Vec<f32>> for TensorValues {
    fn from(v: Vec<f32>) -> Self {
        TensorValues::Float32(v)
    }
}

impl From<&[f32]> for TensorValues {
    fn from(v: &[f32]) -> Self {
        TensorValues::Float32(v.to_vec())
    }
}

impl From<Vec<i32>> for TensorValues {
    fn from(v: Vec<i32>) -> Self {
        TensorValues::Int32(v)
    }
}

impl From<Vec<bool>> for TensorValues {
    fn from(v: Vec<bool>) -> Self {
        TensorValues::Bool(v)
    }
}
