//! Slice-level numeric kernels over row-major `f32` buffers.

use tg_tensor::Shape;

/// Iterator over all multi-dimensional indices of a shape, row-major.
pub(crate) struct TensorIndices<'a> {
    shape: &'a Shape,
    current: Vec<usize>,
    done: bool,
}

impl<'a> TensorIndices<'a> {
    pub(crate) fn new(shape: &'a Shape) -> Self {
        TensorIndices {
            shape,
            current: vec![0; shape.rank()],
            // a scalar yields one empty index; an empty shape yields none
            done: shape.rank() > 0 && shape.numel() == 0,
        }
    }
}

impl Iterator for TensorIndices<'_> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.shape.rank() == 0 {
            self.done = true;
            return Some(vec![]);
        }

        let result = self.current.clone();

        // Increment indices (rightmost first, like odometer)
        let mut i = self.shape.rank() - 1;
        loop {
            self.current[i] += 1;
            if self.current[i] < self.shape.dim(i) {
                break;
            }
            self.current[i] = 0;
            if i == 0 {
                self.done = true;
                break;
            }
            i -= 1;
        }

        Some(result)
    }
}

/// Materialize `data` (of shape `from`) broadcast to `to`.
pub(crate) fn broadcast_values(data: &[f32], from: &Shape, to: &Shape) -> Vec<f32> {
    if from == to {
        return data.to_vec();
    }

    let offset = to.rank() - from.rank();
    let from_strides = from.contiguous_strides();
    let mut out = Vec::with_capacity(to.numel());

    for out_idx in TensorIndices::new(to) {
        // Map output index to input index (accounting for broadcasting)
        let in_flat: usize = (0..from.rank())
            .map(|i| {
                let idx = if from.dim(i) == 1 { 0 } else { out_idx[offset + i] };
                idx * from_strides.as_slice()[i]
            })
            .sum();
        out.push(data[in_flat]);
    }

    out
}

/// Binary operation with broadcasting. `None` if the shapes are incompatible.
pub(crate) fn binary_op_broadcast<F>(
    a: &[f32],
    a_shape: &Shape,
    b: &[f32],
    b_shape: &Shape,
    op: F,
) -> Option<(Vec<f32>, Shape)>
where
    F: Fn(f32, f32) -> f32,
{
    let out_shape = a_shape.broadcast_with(b_shape)?;

    if a_shape == b_shape {
        let data = a.iter().zip(b).map(|(&x, &y)| op(x, y)).collect();
        return Some((data, out_shape));
    }

    let a_broadcast = broadcast_values(a, a_shape, &out_shape);
    let b_broadcast = broadcast_values(b, b_shape, &out_shape);
    let data = a_broadcast
        .iter()
        .zip(b_broadcast.iter())
        .map(|(&x, &y)| op(x, y))
        .collect();

    Some((data, out_shape))
}

/// Reduce over sorted, valid `axes`, dropping them from the output shape.
pub(crate) fn reduce_op<F>(
    data: &[f32],
    shape: &Shape,
    axes: &[usize],
    init: f32,
    op: F,
) -> (Vec<f32>, Shape)
where
    F: Fn(f32, f32) -> f32,
{
    if axes.is_empty() {
        return (data.to_vec(), shape.clone());
    }

    let out_shape = shape.reduced(axes, false);
    let out_strides = out_shape.contiguous_strides();
    let in_strides = shape.contiguous_strides();
    let mut out = vec![init; out_shape.numel()];

    // Iterate over input and accumulate to output
    for in_idx in TensorIndices::new(shape) {
        let in_flat = in_strides.index(&in_idx);
        let out_idx: Vec<usize> = (0..shape.rank())
            .filter(|i| !axes.contains(i))
            .map(|i| in_idx[i])
            .collect();
        let out_flat = if out_idx.is_empty() {
            0
        } else {
            out_strides.index(&out_idx)
        };
        out[out_flat] = op(out[out_flat], data[in_flat]);
    }

    (out, out_shape)
}

/// `(M, K) @ (K, N)` where either operand may be stored transposed.
pub(crate) fn matmul_2d(
    a: &[f32],
    a_shape: &Shape,
    b: &[f32],
    b_shape: &Shape,
    transpose_a: bool,
    transpose_b: bool,
) -> Option<(Vec<f32>, Shape)> {
    let (m, k) = if transpose_a {
        (a_shape.dim(1), a_shape.dim(0))
    } else {
        (a_shape.dim(0), a_shape.dim(1))
    };
    let (k2, n) = if transpose_b {
        (b_shape.dim(1), b_shape.dim(0))
    } else {
        (b_shape.dim(0), b_shape.dim(1))
    };
    if k != k2 {
        return None;
    }

    let a_at = |i: usize, l: usize| if transpose_a { a[l * m + i] } else { a[i * k + l] };
    let b_at = |l: usize, j: usize| if transpose_b { b[j * k + l] } else { b[l * n + j] };

    let mut data = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0;
            for l in 0..k {
                sum += a_at(i, l) * b_at(l, j);
            }
            data[i * n + j] = sum;
        }
    }
    Some((data, Shape::new(vec![m, n])))
}

/// Permute the axes of `data`.
pub(crate) fn transpose_values(data: &[f32], shape: &Shape, perm: &[usize]) -> (Vec<f32>, Shape) {
    if shape.rank() == 0 {
        return (data.to_vec(), shape.clone());
    }

    let new_shape = Shape::new(perm.iter().map(|&i| shape.dim(i)).collect());
    let in_strides = shape.contiguous_strides();
    let out_strides = new_shape.contiguous_strides();
    let mut out = vec![0.0f32; data.len()];

    for idx in TensorIndices::new(shape) {
        let new_idx: Vec<usize> = perm.iter().map(|&i| idx[i]).collect();
        out[out_strides.index(&new_idx)] = data[in_strides.index(&idx)];
    }

    (out, new_shape)
}
