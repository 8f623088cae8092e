//! Shape and stride utilities for tensors.

use std::fmt;

use crate::error::{Error, Result};

/// A tensor shape (dimensions).
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    /// Create a new shape from dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// Create a scalar shape (0-dimensional).
    pub fn scalar() -> Self {
        Shape(vec![])
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Get dimension at index.
    pub fn dim(&self, idx: usize) -> usize {
        self.0[idx]
    }

    /// Get dimensions as slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Check if this is a scalar (0-dim tensor).
    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// Compute row-major (C-contiguous) strides for this shape.
    pub fn contiguous_strides(&self) -> Strides {
        let rank = self.0.len();
        if rank == 0 {
            return Strides(vec![]);
        }

        let mut strides = vec![1usize; rank];
        for i in (0..rank - 1).rev() {
            strides[i] = strides[i + 1] * self.0[i + 1];
        }
        Strides(strides)
    }

    /// Check if two shapes are broadcast-compatible.
    /// Returns the broadcast result shape if compatible.
    pub fn broadcast_with(&self, other: &Shape) -> Option<Shape> {
        let rank = self.rank().max(other.rank());
        let mut result = vec![0usize; rank];

        for (i, out) in result.iter_mut().enumerate() {
            let d1 = if i < rank - self.rank() {
                1
            } else {
                self.0[i - (rank - self.rank())]
            };
            let d2 = if i < rank - other.rank() {
                1
            } else {
                other.0[i - (rank - other.rank())]
            };

            if d1 == d2 || d2 == 1 {
                *out = d1;
            } else if d1 == 1 {
                *out = d2;
            } else {
                return None;
            }
        }

        Some(Shape(result))
    }

    /// Compute which axes need to be reduced when going from broadcast shape back to this shape.
    /// Returns axes that were broadcast (size 1 expanded to larger).
    pub fn reduction_axes_from(&self, broadcast_shape: &Shape) -> Vec<usize> {
        let mut axes = Vec::new();
        let offset = broadcast_shape.rank() - self.rank();

        // Leading dimensions that don't exist in self
        axes.extend(0..offset);

        // Dimensions that were size 1 in self but expanded
        for i in 0..self.rank() {
            if self.0[i] == 1 && broadcast_shape.0[offset + i] > 1 {
                axes.push(offset + i);
            }
        }

        axes
    }

    /// Validate a list of reduction axes against this shape and return them sorted
    /// and deduplicated. `None` selects every axis.
    pub fn normalize_axes(&self, op: &str, axes: Option<&[usize]>) -> Result<Vec<usize>> {
        let mut out: Vec<usize> = match axes {
            Some(axes) => axes.to_vec(),
            None => (0..self.rank()).collect(),
        };
        out.sort_unstable();
        out.dedup();
        if let Some(&bad) = out.iter().find(|&&ax| ax >= self.rank()) {
            return Err(Error::invalid_argument(
                op,
                format!("axis {bad} is out of range for shape {self}"),
            ));
        }
        Ok(out)
    }

    /// Shape left after reducing `axes`, optionally keeping them as size-1 dims.
    pub fn reduced(&self, axes: &[usize], keepdims: bool) -> Shape {
        let dims = self
            .0
            .iter()
            .enumerate()
            .filter_map(|(i, &d)| {
                if !axes.contains(&i) {
                    Some(d)
                } else if keepdims {
                    Some(1)
                } else {
                    None
                }
            })
            .collect();
        Shape(dims)
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(s: [usize; N]) -> Self {
        Shape(s.to_vec())
    }
}

/// Tensor strides (step size in each dimension).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Strides(pub Vec<usize>);

impl Strides {
    pub fn new(strides: Vec<usize>) -> Self {
        Strides(strides)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Compute flat index from multi-dimensional indices.
    pub fn index(&self, indices: &[usize]) -> usize {
        debug_assert_eq!(self.0.len(), indices.len());
        self.0.iter().zip(indices.iter()).map(|(s, i)| s * i).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_basics() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.rank(), 3);
        assert_eq!(s.dim(1), 3);
        assert_eq!(s.numel(), 24);
        assert!(!s.is_scalar());
        assert_eq!(s.to_string(), "[2, 3, 4]");
    }

    #[test]
    fn test_scalar_shape() {
        let s = Shape::scalar();
        assert_eq!(s.rank(), 0);
        assert_eq!(s.numel(), 1);
        assert!(s.is_scalar());
    }

    #[test]
    fn test_empty_dim_has_no_elements() {
        assert_eq!(Shape::from([3, 0]).numel(), 0);
    }

    #[test]
    fn test_contiguous_strides() {
        let strides = Shape::new(vec![2, 3, 4]).contiguous_strides();
        assert_eq!(strides.0, vec![12, 4, 1]);
    }

    #[test]
    fn test_broadcast() {
        let a = Shape::new(vec![1, 4]);
        assert_eq!(a.broadcast_with(&Shape::new(vec![3, 1])), Some(Shape::new(vec![3, 4])));
        assert_eq!(a.broadcast_with(&Shape::scalar()), Some(a.clone()));
        assert_eq!(
            Shape::new(vec![3, 4]).broadcast_with(&Shape::new(vec![2, 3, 4])),
            Some(Shape::new(vec![2, 3, 4]))
        );
        assert_eq!(Shape::new(vec![2, 3]).broadcast_with(&Shape::new(vec![2, 4])), None);
    }

    #[test]
    fn test_reduction_axes() {
        let original = Shape::new(vec![1, 4]);
        assert_eq!(original.reduction_axes_from(&Shape::new(vec![3, 4])), vec![0]);

        let original2 = Shape::new(vec![4]);
        assert_eq!(original2.reduction_axes_from(&Shape::new(vec![2, 3, 4])), vec![0, 1]);
    }

    #[test]
    fn test_normalize_and_reduce() {
        let s = Shape::new(vec![2, 3, 4]);
        let axes = s.normalize_axes("sum", Some(&[2, 0, 2])).unwrap();
        assert_eq!(axes, vec![0, 2]);
        assert_eq!(s.reduced(&axes, false), Shape::new(vec![3]));
        assert_eq!(s.reduced(&axes, true), Shape::new(vec![1, 3, 1]));
        assert!(s.normalize_axes("sum", Some(&[3])).is_err());
    }

    #[test]
    fn test_stride_index() {
        let strides = Strides::new(vec![12, 4, 1]);
        assert_eq!(strides.index(&[0, 0, 0]), 0);
        assert_eq!(strides.index(&[0, 1, 0]), 4);
        assert_eq!(strides.index(&[1, 2, 3]), 12 + 8 + 3);
    }
}
