//! ArithOps implementation for CpuBackend.

use meshformer::backend::ArithOps;
use meshformer::tensor::Tensor;
use meshformer::{Error, Result};

use crate::kernels;
use crate::ops::check_same_len;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl ArithOps for CpuBackend {
    fn add(a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        let a_data = a.as_f32_slice();
        let b_data = b.as_f32_slice();
        check_same_len("add", a_data.len(), b_data.len())?;
        let mut out = vec![0.0f32; a_data.len()];
        kernels::vec_add(a_data, b_data, &mut out);
        CpuTensor::from_vec(a.shape(), out)
    }

    fn add_inplace(a: &mut CpuTensor, b: &CpuTensor) -> Result<()> {
        check_same_len("add_inplace", a.numel(), b.numel())?;
        kernels::vec_add_inplace(a.as_f32_slice_mut(), b.as_f32_slice());
        Ok(())
    }

    fn mul(a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        let a_data = a.as_f32_slice();
        let b_data = b.as_f32_slice();
        check_same_len("mul", a_data.len(), b_data.len())?;
        let mut out = vec![0.0f32; a_data.len()];
        kernels::vec_mul(a_data, b_data, &mut out);
        CpuTensor::from_vec(a.shape(), out)
    }

    fn scale_inplace(a: &mut CpuTensor, scale: f32) -> Result<()> {
        kernels::vec_scale(a.as_f32_slice_mut(), scale);
        Ok(())
    }

    fn add_bias(input: &CpuTensor, bias: &CpuTensor) -> Result<CpuTensor> {
        let n = bias.numel();
        if input.last_dim() != n {
            return Err(Error::InvalidShape(format!(
                "add_bias: bias of {n} for input {:?}",
                input.shape()
            )));
        }
        let bias_data = bias.as_f32_slice();
        let mut out = input.to_f32_vec();
        for row in out.chunks_exact_mut(n.max(1)) {
            kernels::vec_add_inplace(row, bias_data);
        }
        CpuTensor::from_vec(input.shape(), out)
    }
}
