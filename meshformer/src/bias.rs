//! Additive attention bias: masks plus one positional bias.
//!
//! A bias has shape `(heads, q_len, k_len)` with `heads == 1` meaning "same
//! for every head". Queries are aligned to the end of the keys: query `i`
//! sits at key position `k_len - q_len + i`. A full-sequence pass has
//! `q_len == k_len`; a decode step has one query at the newest cache slot.
//!
//! Masked entries get [`MASK_SENTINEL`] added, not negative infinity. A row
//! with every key masked therefore softmaxes to a uniform distribution
//! instead of NaN or zeros; decoding relies on that for padded rows.

#![allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]

use crate::position::relative_position_bucket;
use crate::{Error, Result};

/// Value added to masked attention logits.
pub const MASK_SENTINEL: f32 = -1e10;

#[derive(Debug, Clone, PartialEq)]
pub struct AttentionBias {
    heads: usize,
    q_len: usize,
    k_len: usize,
    data: Vec<f32>,
}

impl AttentionBias {
    #[must_use]
    pub fn zeros(heads: usize, q_len: usize, k_len: usize) -> Self {
        Self {
            heads,
            q_len,
            k_len,
            data: vec![0.0; heads * q_len * k_len],
        }
    }

    /// Causal mask, optionally restricted to the last `window` keys
    /// (the query itself included).
    #[must_use]
    pub fn causal(q_len: usize, k_len: usize, window: Option<usize>) -> Self {
        let mut bias = Self::zeros(1, q_len, k_len);
        for i in 0..q_len {
            let q_pos = bias.query_position(i);
            for j in 0..k_len {
                let visible = j <= q_pos && window.map_or(true, |w| q_pos - j < w);
                if !visible {
                    bias.data[i * k_len + j] += MASK_SENTINEL;
                }
            }
        }
        bias
    }

    /// ALiBi bias `-slope_h * (q_pos - j)` for each local head slope.
    #[must_use]
    pub fn alibi(slopes: &[f32], q_len: usize, k_len: usize) -> Self {
        let mut bias = Self::zeros(slopes.len(), q_len, k_len);
        for (h, slope) in slopes.iter().enumerate() {
            for i in 0..q_len {
                let q_pos = bias.query_position(i) as f32;
                for j in 0..k_len {
                    bias.data[(h * q_len + i) * k_len + j] = -slope * (q_pos - j as f32);
                }
            }
        }
        bias
    }

    /// Relative-position bias from a learned `(heads, num_buckets)` table.
    ///
    /// Builds the one-hot bucket tensor `(num_buckets, q_len, k_len)` and
    /// contracts it against the table, so no data-dependent indexing touches
    /// the table.
    ///
    /// # Errors
    /// Returns an error if the table length is not `heads * num_buckets`.
    pub fn relative(
        table: &[f32],
        num_buckets: usize,
        max_distance: usize,
        q_len: usize,
        k_len: usize,
    ) -> Result<Self> {
        if num_buckets == 0 || table.len() % num_buckets != 0 {
            return Err(Error::InvalidShape(format!(
                "relative bias table of {} values is not a multiple of {num_buckets} buckets",
                table.len()
            )));
        }
        let heads = table.len() / num_buckets;
        let mut one_hot = vec![0.0_f32; num_buckets * q_len * k_len];
        let frame = Self::zeros(1, q_len, k_len);
        for i in 0..q_len {
            let q_pos = frame.query_position(i) as i64;
            for j in 0..k_len {
                let bucket = relative_position_bucket(q_pos - j as i64, num_buckets, max_distance);
                one_hot[(bucket * q_len + i) * k_len + j] = 1.0;
            }
        }

        let plane = q_len * k_len;
        let mut bias = Self::zeros(heads, q_len, k_len);
        for h in 0..heads {
            let out = &mut bias.data[h * plane..(h + 1) * plane];
            for b in 0..num_buckets {
                let weight = table[h * num_buckets + b];
                let hot = &one_hot[b * plane..(b + 1) * plane];
                for (o, x) in out.iter_mut().zip(hot) {
                    *o += weight * x;
                }
            }
        }
        Ok(bias)
    }

    /// Add the sentinel to every key column for which `masked(j)` holds.
    pub fn mask_keys(&mut self, masked: impl Fn(usize) -> bool) {
        let k_len = self.k_len;
        for (idx, value) in self.data.iter_mut().enumerate() {
            if masked(idx % k_len) {
                *value += MASK_SENTINEL;
            }
        }
    }

    /// Elementwise sum, broadcasting a single-head operand over heads.
    ///
    /// # Errors
    /// Returns an error if the query/key lengths or head counts disagree.
    pub fn add(&self, other: &Self) -> Result<Self> {
        if self.q_len != other.q_len || self.k_len != other.k_len {
            return Err(Error::InvalidShape(format!(
                "bias ({}, {}) + ({}, {})",
                self.q_len, self.k_len, other.q_len, other.k_len
            )));
        }
        let heads = match (self.heads, other.heads) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            (a, b) => {
                return Err(Error::InvalidShape(format!(
                    "cannot broadcast {a} bias heads with {b}"
                )))
            }
        };
        let plane = self.q_len * self.k_len;
        let mut data = Vec::with_capacity(heads * plane);
        for h in 0..heads {
            let a = self.head_plane(h);
            let b = other.head_plane(h);
            data.extend(a.iter().zip(b).map(|(x, y)| x + y));
        }
        Ok(Self {
            heads,
            q_len: self.q_len,
            k_len: self.k_len,
            data,
        })
    }

    /// Repeat a single-head bias over `heads` heads.
    ///
    /// # Errors
    /// Returns an error if the bias already has a different head count.
    pub fn expand_heads(self, heads: usize) -> Result<Self> {
        if self.heads == heads {
            return Ok(self);
        }
        self.add(&Self::zeros(heads, self.q_len, self.k_len))
    }

    #[must_use]
    pub const fn shape(&self) -> [usize; 3] {
        [self.heads, self.q_len, self.k_len]
    }

    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Key position of query row `i`.
    const fn query_position(&self, i: usize) -> usize {
        self.k_len - self.q_len + i
    }

    fn head_plane(&self, h: usize) -> &[f32] {
        let plane = self.q_len * self.k_len;
        let h = if self.heads == 1 { 0 } else { h };
        &self.data[h * plane..(h + 1) * plane]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visible(bias: &AttentionBias, i: usize, j: usize) -> bool {
        let [_, _, k] = bias.shape();
        bias.data()[i * k + j] > MASK_SENTINEL / 2.0
    }

    #[test]
    fn test_causal_full_sequence() {
        let bias = AttentionBias::causal(3, 3, None);
        assert!(visible(&bias, 0, 0));
        assert!(!visible(&bias, 0, 1));
        assert!(visible(&bias, 2, 0));
        assert_eq!(bias.data()[1], MASK_SENTINEL);
    }

    #[test]
    fn test_causal_window() {
        let bias = AttentionBias::causal(5, 5, Some(2));
        assert!(visible(&bias, 4, 4));
        assert!(visible(&bias, 4, 3));
        assert!(!visible(&bias, 4, 2));
        assert!(!visible(&bias, 4, 0));
    }

    #[test]
    fn test_single_query_sits_at_last_key() {
        let bias = AttentionBias::causal(1, 4, Some(3));
        assert!(!visible(&bias, 0, 0));
        assert!(visible(&bias, 0, 1));
        assert!(visible(&bias, 0, 3));
    }

    #[test]
    fn test_alibi_penalises_distance() {
        let bias = AttentionBias::alibi(&[0.5, 0.25], 2, 2);
        assert_eq!(bias.shape(), [2, 2, 2]);
        // head 0, query 1: keys at distance 1 and 0
        assert_eq!(&bias.data()[2..4], &[-0.5, 0.0]);
        // head 1, query 1
        assert_eq!(&bias.data()[6..8], &[-0.25, 0.0]);
    }

    #[test]
    fn test_relative_contraction_matches_lookup() {
        let num_buckets = 4;
        let table = [0.1, 0.2, 0.3, 0.4, 1.0, 2.0, 3.0, 4.0];
        let bias = AttentionBias::relative(&table, num_buckets, 8, 3, 3).unwrap();
        assert_eq!(bias.shape(), [2, 3, 3]);
        for h in 0..2 {
            for i in 0..3 {
                for j in 0..3 {
                    let bucket = relative_position_bucket(
                        i64::try_from(i).unwrap() - i64::try_from(j).unwrap(),
                        num_buckets,
                        8,
                    );
                    let got = bias.data()[(h * 3 + i) * 3 + j];
                    assert_eq!(got, table[h * num_buckets + bucket]);
                }
            }
        }
    }

    #[test]
    fn test_relative_rejects_ragged_table() {
        assert!(AttentionBias::relative(&[0.0; 5], 4, 8, 2, 2).is_err());
    }

    #[test]
    fn test_add_broadcasts_heads_and_masks_stack() {
        let mut mask = AttentionBias::causal(2, 2, None);
        mask.mask_keys(|j| j == 0);
        let total = mask
            .add(&AttentionBias::alibi(&[1.0, 2.0], 2, 2))
            .unwrap();
        assert_eq!(total.shape(), [2, 2, 2]);
        // query 0 / key 0: padding only; query 0 / key 1: causal only
        assert_eq!(total.data()[0], MASK_SENTINEL);
        assert_eq!(total.data()[1], MASK_SENTINEL + 1.0);
        assert!(AttentionBias::zeros(2, 2, 2)
            .add(&AttentionBias::zeros(3, 2, 2))
            .is_err());
    }

    #[test]
    fn test_expand_heads() {
        let bias = AttentionBias::causal(2, 2, None).expand_heads(3).unwrap();
        assert_eq!(bias.shape(), [3, 2, 2]);
        assert_eq!(&bias.data()[..4], &bias.data()[8..]);
    }
}
