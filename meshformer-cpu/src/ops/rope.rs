//! RopeOps implementation for CpuBackend (interleaved and half-rotation layouts).

use meshformer::backend::RopeOps;
use meshformer::config::RotaryLayout;
use meshformer::tensor::Tensor;
use meshformer::{Error, Result};

use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl RopeOps for CpuBackend {
    fn apply_rotary(
        input: &CpuTensor,
        cos_cache: &CpuTensor,
        sin_cache: &CpuTensor,
        rotary_dims: usize,
        layout: RotaryLayout,
        position_offset: usize,
    ) -> Result<CpuTensor> {
        // input: (seq_len, num_heads, head_dim)
        let shape = input.shape();
        let &[seq_len, num_heads, head_dim] = shape else {
            return Err(Error::InvalidShape(format!(
                "apply_rotary: expected (seq, heads, d_head), got {shape:?}"
            )));
        };
        let half_dim = rotary_dims / 2;
        if rotary_dims > head_dim || rotary_dims % 2 != 0 || cos_cache.last_dim() != half_dim {
            return Err(Error::InvalidShape(format!(
                "apply_rotary: {rotary_dims} rotary dims for d_head {head_dim}, table {:?}",
                cos_cache.shape()
            )));
        }
        if (position_offset + seq_len) * half_dim > cos_cache.numel() {
            return Err(Error::InvalidShape(format!(
                "apply_rotary: positions {position_offset}..{} exceed the table",
                position_offset + seq_len
            )));
        }

        let input_data = input.as_f32_slice();
        let cos_data = cos_cache.as_f32_slice();
        let sin_data = sin_cache.as_f32_slice();

        let mut out = input_data.to_vec();

        for s in 0..seq_len {
            let pos = position_offset + s;
            let cos_row = &cos_data[pos * half_dim..(pos + 1) * half_dim];
            let sin_row = &sin_data[pos * half_dim..(pos + 1) * half_dim];

            for h in 0..num_heads {
                let base = (s * num_heads + h) * head_dim;
                for d in 0..half_dim {
                    let (i0, i1) = match layout {
                        RotaryLayout::Interleaved => (base + 2 * d, base + 2 * d + 1),
                        RotaryLayout::Halves => (base + d, base + half_dim + d),
                    };
                    let x0 = input_data[i0];
                    let x1 = input_data[i1];
                    out[i0] = x0 * cos_row[d] - x1 * sin_row[d];
                    out[i1] = x1 * cos_row[d] + x0 * sin_row[d];
                }
            }
        }

        CpuTensor::from_vec(shape, out)
    }
}
