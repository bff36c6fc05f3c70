//! Positional-bias math shared by every backend: ALiBi slopes and T5-style
//! relative-position buckets.

#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]

use crate::shard::ShardPosition;

/// ALiBi slopes for the heads held by one shard.
///
/// Head `h` (global index) gets `base^(h + 1)` with `base = 2^(-8 / n_heads)`.
/// Slopes depend only on the global head index, so concatenating every
/// shard's slopes gives the single-shard sequence.
#[must_use]
pub fn alibi_slopes(n_heads: usize, position: ShardPosition) -> Vec<f32> {
    let base = 2.0_f64.powf(-8.0 / n_heads as f64);
    let (first, count) = position.shard_range(n_heads);
    (first..first + count)
        .map(|h| base.powi(h as i32 + 1) as f32)
        .collect()
}

/// Bucket for a query `distance = query_pos - key_pos` keys back.
///
/// Keys ahead of the query (`distance < 0`) share bucket 0 with the query
/// itself. Below `num_buckets / 2` every distance has its own bucket; past
/// that, buckets grow logarithmically up to `max_distance`, and everything
/// further lands in `num_buckets - 1`.
#[must_use]
pub fn relative_position_bucket(distance: i64, num_buckets: usize, max_distance: usize) -> usize {
    let n = distance.max(0) as usize;
    let max_exact = num_buckets / 2;
    if n < max_exact {
        return n;
    }
    let ratio = (n as f32 / max_exact as f32 + f32::EPSILON).ln()
        / (max_distance as f32 / max_exact as f32).ln();
    let large = max_exact as f32 + ratio * (num_buckets - max_exact) as f32;
    (large as usize).min(num_buckets - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn shard(rank: usize, world_size: usize) -> ShardPosition {
        ShardPosition { rank, world_size }
    }

    #[test]
    fn test_alibi_eight_heads() {
        let slopes = alibi_slopes(8, shard(0, 1));
        let expected: Vec<f32> = (1..=8).map(|i| 0.5_f32.powi(i)).collect();
        for (a, b) in slopes.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-7, "{slopes:?}");
        }
    }

    #[test]
    fn test_alibi_shard_count_invariant() {
        for n_heads in [4, 8, 16, 32] {
            let single = alibi_slopes(n_heads, shard(0, 1));
            for shards in [2, 4] {
                let joined: Vec<f32> = (0..shards)
                    .flat_map(|rank| alibi_slopes(n_heads, shard(rank, shards)))
                    .collect();
                assert_eq!(joined, single, "{n_heads} heads over {shards} shards");
            }
        }
    }

    #[test]
    fn test_bucket_known_values() {
        // 32 buckets, max_distance 128: exact region is 0..16
        assert_eq!(relative_position_bucket(-5, 32, 128), 0);
        assert_eq!(relative_position_bucket(0, 32, 128), 0);
        assert_eq!(relative_position_bucket(15, 32, 128), 15);
        assert_eq!(relative_position_bucket(16, 32, 128), 16);
        // ln(64/16)/ln(8) * 16 = 10.67 -> 26
        assert_eq!(relative_position_bucket(64, 32, 128), 26);
        assert_eq!(relative_position_bucket(128, 32, 128), 31);
        assert_eq!(relative_position_bucket(10_000, 32, 128), 31);
    }

    proptest! {
        #[test]
        fn prop_bucket_in_range(d in -500_i64..5000, nb in 2_usize..64, extra in 1_usize..300) {
            let max_distance = nb / 2 + extra;
            let b = relative_position_bucket(d, nb, max_distance);
            prop_assert!(b < nb);
        }

        #[test]
        fn prop_bucket_monotone(d in 0_i64..5000, nb in 2_usize..64, extra in 1_usize..300) {
            let max_distance = nb / 2 + extra;
            let here = relative_position_bucket(d, nb, max_distance);
            let next = relative_position_bucket(d + 1, nb, max_distance);
            prop_assert!(next >= here, "bucket({}) = {} > bucket({}) = {}", d, here, d + 1, next);
        }
    }
}
