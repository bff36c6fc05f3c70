//! Rotary position embedding precomputation, and the fixed sinusoidal
//! position table built from the same frequencies.
//!
//! Pure host-side computation of cos/sin tables. The results are
//! `Vec<f32>` arrays that backends upload via
//! [`TensorFactory::from_f32`](crate::backend::TensorFactory::from_f32).

#![allow(clippy::cast_precision_loss, clippy::doc_markdown)]

use crate::config::SinusoidLayout;

/// Base of the inverse-frequency schedule.
pub const ROTARY_BASE: f32 = 10_000.0;

/// Precompute rotary cos/sin tables.
///
/// Pair `i` of the rotated prefix turns at `inv_freq_i = 1 / base^(2i / rotary_dims)`
/// and position `p` uses angle `(p + offset) * inv_freq_i`. The offset
/// exists for checkpoints trained with shifted positions; rotary attention
/// only sees position differences, so it never changes which keys a query
/// prefers, only the exact angles.
///
/// Returns `(cos_data, sin_data)` each of length `positions * (rotary_dims / 2)`,
/// stored in row-major order `[positions, rotary_dims / 2]`.
#[must_use]
pub fn precompute_rotary_data(
    positions: usize,
    rotary_dims: usize,
    base: f32,
    offset: usize,
) -> (Vec<f32>, Vec<f32>) {
    let half_dim = rotary_dims / 2;
    let mut cos_data = vec![0.0_f32; positions * half_dim];
    let mut sin_data = vec![0.0_f32; positions * half_dim];

    let inv_freq: Vec<f32> = (0..half_dim)
        .map(|i| 1.0 / base.powf(2.0 * i as f32 / rotary_dims as f32))
        .collect();

    for pos in 0..positions {
        let p = (pos + offset) as f32;
        for (i, freq) in inv_freq.iter().enumerate() {
            let angle = p * freq;
            cos_data[pos * half_dim + i] = angle.cos();
            sin_data[pos * half_dim + i] = angle.sin();
        }
    }

    (cos_data, sin_data)
}

/// Absolute sinusoidal positions `(positions, d_model)`, row `p` encoding
/// position `p + shift`.
///
/// `d_model` must be even; feature pair `i` uses the rotary frequency of
/// pair `i` over the full width.
#[must_use]
pub fn sinusoid_table(
    positions: usize,
    d_model: usize,
    shift: usize,
    layout: SinusoidLayout,
) -> Vec<f32> {
    let half = d_model / 2;
    let (cos, sin) = precompute_rotary_data(positions, d_model, ROTARY_BASE, shift);
    let mut table = Vec::with_capacity(positions * d_model);
    for (sin_row, cos_row) in sin.chunks_exact(half).zip(cos.chunks_exact(half)) {
        match layout {
            SinusoidLayout::Interleaved => {
                for (s, c) in sin_row.iter().zip(cos_row) {
                    table.push(*s);
                    table.push(*c);
                }
            }
            SinusoidLayout::Concatenated => {
                table.extend_from_slice(sin_row);
                table.extend_from_slice(cos_row);
            }
        }
    }
    table
}
