//! MatmulOps implementation for CpuBackend.
//!
//! All matmul is f32 row-major, using standard `A (M,K) × B (K,N) → C (M,N)`.
//! Weight matrices are stored as `(in_features, out_features)`.
//!
//! B is transposed to `Bᵀ(N,K)` so that `C[m,n] = dot(A[m,:], Bᵀ[n,:])`
//! becomes a contiguous dot product. Output rows are parallelized with Rayon.

use meshformer::backend::MatmulOps;
use meshformer::tensor::Tensor;
use meshformer::{Error, Result};
use rayon::prelude::*;

use crate::kernels;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Transpose `B (K,N)` → `Bᵀ (N,K)` in row-major order.
#[allow(clippy::many_single_char_names)]
fn transpose(b: &[f32], k: usize, n: usize) -> Vec<f32> {
    let mut bt = vec![0.0f32; n * k];
    for row in 0..k {
        for col in 0..n {
            bt[col * k + row] = b[row * n + col];
        }
    }
    bt
}

/// Compute one row of C: `C[m,:] = A[m,:] × Bᵀ`.
#[allow(clippy::many_single_char_names)]
fn gemm_row(a_row: &[f32], bt: &[f32], c_row: &mut [f32], k: usize) {
    for (col, c) in c_row.iter_mut().enumerate() {
        *c = kernels::dot_f32(a_row, &bt[col * k..(col + 1) * k]);
    }
}

/// Standard gemm: `A (M,K) × B (K,N) → C (M,N)`.
#[allow(clippy::many_single_char_names)]
fn gemm(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let bt = transpose(b, k, n);
    let mut c = vec![0.0f32; m * n];
    if n == 0 {
        return c;
    }

    if m == 1 {
        // Single decode row, skip thread-pool overhead
        gemm_row(&a[..k], &bt, &mut c[..n], k);
    } else {
        c.par_chunks_mut(n).enumerate().for_each(|(row, c_row)| {
            gemm_row(&a[row * k..(row + 1) * k], &bt, c_row, k);
        });
    }

    c
}

impl MatmulOps for CpuBackend {
    fn matmul(input: &CpuTensor, weight: &CpuTensor) -> Result<CpuTensor> {
        // input (..., K) × weight (K, N) → (..., N)
        let w_shape = weight.shape();
        let &[k, n] = w_shape else {
            return Err(Error::InvalidShape(format!(
                "matmul: weight must be 2D, got {w_shape:?}"
            )));
        };
        let i_shape = input.shape();
        if i_shape.is_empty() || input.last_dim() != k {
            return Err(Error::InvalidShape(format!(
                "matmul: input {i_shape:?} does not match weight {w_shape:?}"
            )));
        }
        let m = input.rows();

        let output = gemm(input.as_f32_slice(), weight.as_f32_slice(), m, k, n);

        let mut out_shape = i_shape[..i_shape.len() - 1].to_vec();
        out_shape.push(n);
        CpuTensor::from_vec(&out_shape, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_2x3_3x2() {
        let a = CpuTensor::from_f32(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = CpuTensor::from_f32(&[3, 2], &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let c = CpuBackend::matmul(&a, &b).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.as_f32_slice(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_keeps_leading_dims() {
        let a = CpuTensor::from_f32(&[2, 1, 2], &[1.0, 0.0, 0.0, 1.0]).unwrap();
        let b = CpuTensor::from_f32(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let c = CpuBackend::matmul(&a, &b).unwrap();
        assert_eq!(c.shape(), &[2, 1, 3]);
        assert_eq!(c.as_f32_slice(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_matmul_shape_errors() {
        let a = CpuTensor::from_f32(&[1, 2], &[1.0, 2.0]).unwrap();
        let b = CpuTensor::from_f32(&[3, 1], &[1.0, 2.0, 3.0]).unwrap();
        assert!(CpuBackend::matmul(&a, &b).is_err());
        let flat = CpuTensor::from_f32(&[2], &[1.0, 2.0]).unwrap();
        assert!(CpuBackend::matmul(&a, &flat).is_err());
    }
}
