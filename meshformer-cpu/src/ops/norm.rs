//! NormOps implementation for CpuBackend.

use meshformer::backend::NormOps;
use meshformer::tensor::Tensor;
use meshformer::{Error, Result};

use crate::kernels;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Check that a norm parameter covers `width` features (or is a scalar when
/// `allow_scalar`).
fn check_param(name: &str, param: &CpuTensor, width: usize, allow_scalar: bool) -> Result<()> {
    let n = param.numel();
    if n == width || (allow_scalar && n == 1) {
        Ok(())
    } else {
        Err(Error::InvalidShape(format!(
            "norm {name} of {n} elements for rows of {width}"
        )))
    }
}

/// Broadcast value `i` of a per-feature or scalar parameter.
fn at(param: &[f32], i: usize) -> f32 {
    if param.len() == 1 {
        param[0]
    } else {
        param[i]
    }
}

#[allow(clippy::cast_precision_loss)]
impl NormOps for CpuBackend {
    fn layer_norm(
        input: &CpuTensor,
        scale: &CpuTensor,
        offset: Option<&CpuTensor>,
        eps: f32,
    ) -> Result<CpuTensor> {
        let width = input.last_dim();
        check_param("scale", scale, width, false)?;
        if let Some(offset) = offset {
            check_param("offset", offset, width, false)?;
        }
        let scale = scale.as_f32_slice();
        let offset = offset.map(CpuTensor::as_f32_slice);

        let mut out = input.to_f32_vec();
        for row in out.chunks_exact_mut(width.max(1)) {
            let mean = row.iter().sum::<f32>() / width as f32;
            let var = row.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / width as f32;
            let inv = 1.0 / (var + eps).sqrt();
            for (i, x) in row.iter_mut().enumerate() {
                *x = (*x - mean) * inv * scale[i] + offset.map_or(0.0, |o| o[i]);
            }
        }
        CpuTensor::from_vec(input.shape(), out)
    }

    fn l2_norm(
        input: &CpuTensor,
        scale: &CpuTensor,
        offset: Option<&CpuTensor>,
        eps: f32,
    ) -> Result<CpuTensor> {
        let width = input.last_dim();
        check_param("scale", scale, width, true)?;
        if let Some(offset) = offset {
            check_param("offset", offset, width, false)?;
        }
        let scale = scale.as_f32_slice();
        let offset = offset.map(CpuTensor::as_f32_slice);

        let mut out = input.to_f32_vec();
        for row in out.chunks_exact_mut(width.max(1)) {
            let inv = 1.0 / (kernels::sum_of_squares(row).sqrt() + eps);
            for (i, x) in row.iter_mut().enumerate() {
                *x = *x * inv * at(scale, i) + offset.map_or(0.0, |o| o[i]);
            }
        }
        CpuTensor::from_vec(input.shape(), out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(shape: &[usize], data: &[f32]) -> CpuTensor {
        CpuTensor::from_f32(shape, data).unwrap()
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_var() {
        let x = t(&[1, 4], &[1.0, 2.0, 3.0, 4.0]);
        let out = CpuBackend::layer_norm(&x, &t(&[4], &[1.0; 4]), None, 1e-5).unwrap();
        let data = out.as_f32_slice();
        let mean: f32 = data.iter().sum::<f32>() / 4.0;
        let var: f32 = data.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_layer_norm_scale_and_offset() {
        let x = t(&[1, 2], &[-1.0, 1.0]);
        let out = CpuBackend::layer_norm(
            &x,
            &t(&[2], &[2.0, 3.0]),
            Some(&t(&[2], &[10.0, 20.0])),
            0.0,
        )
        .unwrap();
        assert_eq!(out.as_f32_slice(), &[8.0, 23.0]);
    }

    #[test]
    fn test_l2_norm_scalar_scale() {
        let x = t(&[1, 2], &[3.0, 4.0]);
        let out = CpuBackend::l2_norm(&x, &t(&[1], &[5.0]), None, 0.0).unwrap();
        let data = out.as_f32_slice();
        assert!((data[0] - 3.0).abs() < 1e-6);
        assert!((data[1] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_norm_rejects_wrong_param() {
        let x = t(&[1, 2], &[3.0, 4.0]);
        assert!(CpuBackend::layer_norm(&x, &t(&[1], &[1.0]), None, 1e-5).is_err());
        assert!(CpuBackend::l2_norm(&x, &t(&[3], &[1.0; 3]), None, 1e-5).is_err());
    }
}
