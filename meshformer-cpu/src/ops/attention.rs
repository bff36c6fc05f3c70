//! AttentionOps implementation for CpuBackend.
//!
//! Dense attention with an additive `(heads | 1, q_len, k_len)` bias. All
//! masking is carried by the bias; this kernel never inspects positions.

use meshformer::backend::AttentionOps;
use meshformer::tensor::Tensor;
use meshformer::{Error, Result};
use rayon::prelude::*;

use crate::kernels;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Shape triple of a `(seq, heads, d_head)` tensor.
fn heads_layout(name: &str, t: &CpuTensor) -> Result<(usize, usize, usize)> {
    match *t.shape() {
        [seq, heads, dim] => Ok((seq, heads, dim)),
        ref other => Err(Error::InvalidShape(format!(
            "attention: {name} must be (seq, heads, d_head), got {other:?}"
        ))),
    }
}

impl AttentionOps for CpuBackend {
    #[allow(clippy::many_single_char_names)]
    fn attention(
        q: &CpuTensor,
        k: &CpuTensor,
        v: &CpuTensor,
        bias: &CpuTensor,
        scale: f32,
    ) -> Result<CpuTensor> {
        let (q_len, heads, head_dim) = heads_layout("q", q)?;
        let (k_len, k_heads, k_dim) = heads_layout("k", k)?;
        if k.shape() != v.shape() || k_heads != heads || k_dim != head_dim {
            return Err(Error::InvalidShape(format!(
                "attention: q {:?}, k {:?}, v {:?}",
                q.shape(),
                k.shape(),
                v.shape()
            )));
        }
        let bias_heads = match *bias.shape() {
            [h, sq, sk] if (h == heads || h == 1) && sq == q_len && sk == k_len => h,
            ref other => {
                return Err(Error::InvalidShape(format!(
                    "attention: bias {other:?} for {heads} heads, {q_len} queries, {k_len} keys"
                )))
            }
        };

        let q_data = q.as_f32_slice();
        let k_data = k.as_f32_slice();
        let v_data = v.as_f32_slice();
        let bias_data = bias.as_f32_slice();

        // One output row per (query, head), computed independently.
        let mut output = vec![0.0f32; q_len * heads * head_dim];
        if head_dim == 0 {
            return CpuTensor::from_vec(q.shape(), output);
        }
        output
            .par_chunks_mut(head_dim)
            .enumerate()
            .for_each(|(row, out)| {
                let s = row / heads;
                let h = row % heads;
                let q_vec = &q_data[row * head_dim..(row + 1) * head_dim];
                let bh = if bias_heads == 1 { 0 } else { h };
                let bias_row = &bias_data[(bh * q_len + s) * k_len..(bh * q_len + s + 1) * k_len];

                let mut scores: Vec<f32> = (0..k_len)
                    .map(|j| {
                        let k_off = (j * heads + h) * head_dim;
                        kernels::dot_f32(q_vec, &k_data[k_off..k_off + head_dim]) * scale
                            + bias_row[j]
                    })
                    .collect();
                kernels::softmax_inplace(&mut scores);

                for (j, p) in scores.iter().enumerate() {
                    let v_off = (j * heads + h) * head_dim;
                    for (o, x) in out.iter_mut().zip(&v_data[v_off..v_off + head_dim]) {
                        *o += p * x;
                    }
                }
            });

        CpuTensor::from_vec(q.shape(), output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshformer::MASK_SENTINEL;

    fn t(shape: &[usize], data: &[f32]) -> CpuTensor {
        CpuTensor::from_f32(shape, data).unwrap()
    }

    #[test]
    fn test_single_key_returns_value() {
        let q = t(&[1, 1, 2], &[1.0, 0.0]);
        let k = t(&[1, 1, 2], &[1.0, 0.0]);
        let v = t(&[1, 1, 2], &[3.0, 4.0]);
        let bias = CpuTensor::zeros(&[1, 1, 1]);
        let out = CpuBackend::attention(&q, &k, &v, &bias, 1.0).unwrap();
        assert_eq!(out.as_f32_slice(), &[3.0, 4.0]);
    }

    #[test]
    fn test_bias_masks_key() {
        let q = t(&[1, 1, 1], &[1.0]);
        let k = t(&[2, 1, 1], &[1.0, 1.0]);
        let v = t(&[2, 1, 1], &[10.0, 20.0]);
        let bias = t(&[1, 1, 2], &[MASK_SENTINEL, 0.0]);
        let out = CpuBackend::attention(&q, &k, &v, &bias, 1.0).unwrap();
        assert!((out.as_f32_slice()[0] - 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_fully_masked_row_is_uniform() {
        let q = t(&[1, 1, 1], &[1.0]);
        let k = t(&[3, 1, 1], &[0.1, 0.2, 0.3]);
        let v = t(&[3, 1, 1], &[3.0, 6.0, 9.0]);
        let bias = t(&[1, 1, 3], &[MASK_SENTINEL; 3]);
        let out = CpuBackend::attention(&q, &k, &v, &bias, 1.0).unwrap();
        assert!((out.as_f32_slice()[0] - 6.0).abs() < 1e-4);
    }

    #[test]
    fn test_per_head_bias() {
        // two heads, same q/k, opposite biases
        let q = t(&[1, 2, 1], &[0.0, 0.0]);
        let k = t(&[2, 2, 1], &[0.0; 4]);
        let v = t(&[2, 2, 1], &[1.0, 1.0, 2.0, 2.0]);
        let bias = t(&[2, 1, 2], &[MASK_SENTINEL, 0.0, 0.0, MASK_SENTINEL]);
        let out = CpuBackend::attention(&q, &k, &v, &bias, 1.0).unwrap();
        let data = out.as_f32_slice();
        assert!((data[0] - 2.0).abs() < 1e-4);
        assert!((data[1] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_shape_errors() {
        let q = t(&[1, 1, 2], &[0.0; 2]);
        let k = t(&[2, 1, 2], &[0.0; 4]);
        let bias = CpuTensor::zeros(&[1, 1, 3]);
        assert!(CpuBackend::attention(&q, &k, &k, &bias, 1.0).is_err());
    }
}
