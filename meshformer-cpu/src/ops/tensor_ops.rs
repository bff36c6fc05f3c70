//! TensorOps and TensorFactory implementations.

use meshformer::backend::{TensorFactory, TensorOps};
use meshformer::tensor::Tensor;
use meshformer::{Error, Result};

use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl TensorFactory for CpuBackend {
    fn from_f32(shape: &[usize], data: &[f32]) -> Result<CpuTensor> {
        CpuTensor::from_f32(shape, data)
    }

    fn to_f32_vec(tensor: &CpuTensor) -> Result<Vec<f32>> {
        Ok(tensor.to_f32_vec())
    }
}

/// `(outer, dim, inner)` sizes around `axis`.
fn split_at_axis(shape: &[usize], axis: usize) -> Result<(usize, usize, usize)> {
    if axis >= shape.len() {
        return Err(Error::InvalidShape(format!(
            "axis {axis} out of range for shape {shape:?}"
        )));
    }
    Ok((
        shape[..axis].iter().product(),
        shape[axis],
        shape[axis + 1..].iter().product(),
    ))
}

impl TensorOps for CpuBackend {
    fn transpose_2d(input: &CpuTensor) -> Result<CpuTensor> {
        let &[rows, cols] = input.shape() else {
            return Err(Error::InvalidShape(format!(
                "transpose_2d: expected 2D tensor, got {:?}",
                input.shape()
            )));
        };
        let data = input.as_f32_slice();

        let mut out = vec![0.0f32; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                out[j * rows + i] = data[i * cols + j];
            }
        }
        CpuTensor::from_vec(&[cols, rows], out)
    }

    fn concat(parts: &[CpuTensor], axis: usize) -> Result<CpuTensor> {
        let first = parts
            .first()
            .ok_or_else(|| Error::InvalidShape("concat of zero tensors".into()))?;
        let (outer, _, inner) = split_at_axis(first.shape(), axis)?;
        let mut total = 0;
        for part in parts {
            let same_frame = part.ndim() == first.ndim()
                && part
                    .shape()
                    .iter()
                    .zip(first.shape())
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !same_frame {
                return Err(Error::InvalidShape(format!(
                    "concat: {:?} vs {:?} on axis {axis}",
                    part.shape(),
                    first.shape()
                )));
            }
            total += part.shape()[axis];
        }

        let mut out = Vec::with_capacity(outer * total * inner);
        for o in 0..outer {
            for part in parts {
                let block = part.shape()[axis] * inner;
                out.extend_from_slice(&part.as_f32_slice()[o * block..(o + 1) * block]);
            }
        }
        let mut shape = first.shape().to_vec();
        shape[axis] = total;
        CpuTensor::from_vec(&shape, out)
    }

    fn narrow(input: &CpuTensor, axis: usize, start: usize, len: usize) -> Result<CpuTensor> {
        let (outer, dim, inner) = split_at_axis(input.shape(), axis)?;
        if start + len > dim {
            return Err(Error::InvalidShape(format!(
                "narrow: {start}..{} exceeds axis {axis} of {:?}",
                start + len,
                input.shape()
            )));
        }
        let data = input.as_f32_slice();
        let mut out = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let from = (o * dim + start) * inner;
            out.extend_from_slice(&data[from..from + len * inner]);
        }
        let mut shape = input.shape().to_vec();
        shape[axis] = len;
        CpuTensor::from_vec(&shape, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::cast_precision_loss)]
    fn arange(shape: &[usize]) -> CpuTensor {
        let n: usize = shape.iter().product();
        CpuTensor::from_vec(shape, (0..n).map(|i| i as f32).collect()).unwrap()
    }

    #[test]
    fn test_transpose_2d() {
        let t = arange(&[2, 3]);
        let tt = CpuBackend::transpose_2d(&t).unwrap();
        assert_eq!(tt.shape(), &[3, 2]);
        assert_eq!(tt.as_f32_slice(), &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_narrow_and_concat_middle_axis() {
        let t = arange(&[2, 3, 2]);
        let a = CpuBackend::narrow(&t, 1, 0, 1).unwrap();
        let b = CpuBackend::narrow(&t, 1, 1, 2).unwrap();
        assert_eq!(a.as_f32_slice(), &[0.0, 1.0, 6.0, 7.0]);
        let joined = CpuBackend::concat(&[a, b], 1).unwrap();
        assert_eq!(joined.as_f32_slice(), t.as_f32_slice());
    }

    #[test]
    fn test_errors() {
        let t = arange(&[2, 3]);
        assert!(CpuBackend::narrow(&t, 1, 2, 2).is_err());
        assert!(CpuBackend::concat(&[], 0).is_err());
        assert!(CpuBackend::concat(&[t.clone(), arange(&[3, 3])], 1).is_err());
        assert!(CpuBackend::transpose_2d(&arange(&[2])).is_err());
    }
}
