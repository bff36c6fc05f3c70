//! Worker topology and the weight partition plan.
//!
//! Describes how the model is laid out over a `shard_count × replica_count`
//! grid of workers, and for every parameter which axis (if any) is split
//! across the shard axis. Each layer matmul then needs at most one
//! collective:
//!
//! - Output-axis splits (q/k/v, feedforward up) give shard-local columns
//!   that feed the next shard-local op directly.
//! - Input-axis splits (o, feedforward down) give partial sums that need one
//!   all-reduce.
//! - Vocabulary splits (embedding, head) give vocab slices: the embedding
//!   all-reduces its partial rows, the head gathers logits.
//!
//! Replicated norm parameters are stored once per shard, and the norm kind
//! decides which of those copies a rank applies ([`CopyUse`]). Resharding
//! keeps that choice intact.

use crate::config::{ModelConfig, NormKind, PositionalEncoding};
use crate::params::HostTensor;
use crate::{Error, Result};

/// Size of the worker grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardTopology {
    /// Workers sharing one model replica (model-parallel axis).
    pub shard_count: usize,
    /// Independent replicas working on disjoint batches (data-parallel axis).
    pub replica_count: usize,
}

impl ShardTopology {
    #[must_use]
    pub const fn new(shard_count: usize, replica_count: usize) -> Self {
        Self {
            shard_count,
            replica_count,
        }
    }

    #[must_use]
    pub const fn single() -> Self {
        Self::new(1, 1)
    }

    /// Total number of workers.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.shard_count * self.replica_count
    }
}

/// One worker's position on the shard axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPosition {
    /// This worker's rank (`0..world_size`)
    pub rank: usize,
    /// Number of shards in the model-parallel group
    pub world_size: usize,
}

impl ShardPosition {
    /// Compute the shard range for a dimension of size `dim`.
    ///
    /// Returns `(start, shard_size)` where the shard covers
    /// `[start .. start + shard_size)`.
    ///
    /// # Panics
    /// Panics if `dim` is not evenly divisible by `world_size`. Validated
    /// configs never trigger this.
    #[must_use]
    pub fn shard_range(&self, dim: usize) -> (usize, usize) {
        assert_eq!(
            dim % self.world_size,
            0,
            "Dimension {dim} is not evenly divisible by world_size {}",
            self.world_size
        );
        let shard_size = dim / self.world_size;
        (self.rank * shard_size, shard_size)
    }
}

/// How a parameter is stored across the shard axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStrategy {
    /// Every shard holds a full copy.
    Replicate,
    /// `axis` is cut into `groups` equal blocks and every block is split
    /// evenly across shards; a shard holds its part of each block,
    /// concatenated. `groups > 1` keeps fused weights (the value/gate halves
    /// of a gated up-projection) meaningful under any shard count.
    Split { axis: usize, groups: usize },
}

impl ShardStrategy {
    /// Shape of one shard's slice of a tensor with `logical` shape.
    ///
    /// # Errors
    /// Returns an error if the split axis is not divisible.
    pub fn shard_shape(&self, logical: &[usize], shard_count: usize) -> Result<Vec<usize>> {
        match *self {
            Self::Replicate => Ok(logical.to_vec()),
            Self::Split { axis, groups } => {
                let dim = *logical.get(axis).ok_or_else(|| {
                    Error::InvalidShape(format!("axis {axis} missing from {logical:?}"))
                })?;
                if dim % (groups * shard_count) != 0 {
                    return Err(Error::config(format!(
                        "axis {axis} of {logical:?} does not split into {groups} groups \
                         over {shard_count} shards"
                    )));
                }
                let mut shape = logical.to_vec();
                shape[axis] = dim / shard_count;
                Ok(shape)
            }
        }
    }

    /// Take shard `position.rank`'s part of a logical tensor.
    ///
    /// # Errors
    /// Returns an error if the tensor does not split evenly.
    pub fn slice(&self, full: &HostTensor, position: ShardPosition) -> Result<HostTensor> {
        match *self {
            Self::Replicate => Ok(full.clone()),
            Self::Split { axis, groups } => {
                self.shard_shape(full.shape(), position.world_size)?;
                let group = full.shape()[axis] / groups;
                let per_shard = group / position.world_size;
                let parts = (0..groups)
                    .map(|g| full.narrow(axis, g * group + position.rank * per_shard, per_shard))
                    .collect::<Result<Vec<_>>>()?;
                HostTensor::concat(&parts, axis)
            }
        }
    }

    /// Rebuild the logical tensor from every shard's part, in rank order.
    ///
    /// Replicated tensors take shard 0's copy.
    ///
    /// # Errors
    /// Returns an error for an empty input or inconsistent shapes.
    pub fn merge(&self, shards: &[HostTensor]) -> Result<HostTensor> {
        let first = shards
            .first()
            .ok_or_else(|| Error::InvalidShape("merge of zero shards".into()))?;
        match *self {
            Self::Replicate => Ok(first.clone()),
            Self::Split { axis, groups } => {
                let dim = *first.shape().get(axis).ok_or_else(|| {
                    Error::InvalidShape(format!("axis {axis} missing from {:?}", first.shape()))
                })?;
                if dim % groups != 0 {
                    return Err(Error::InvalidShape(format!(
                        "shard axis {dim} does not hold {groups} groups"
                    )));
                }
                let per_shard = dim / groups;
                let mut blocks = Vec::with_capacity(groups * shards.len());
                for g in 0..groups {
                    for shard in shards {
                        blocks.push(shard.narrow(axis, g * per_shard, per_shard)?);
                    }
                }
                HostTensor::concat(&blocks, axis)
            }
        }
    }
}

/// Which per-shard copy of a replicated parameter a rank applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyUse {
    /// Every rank applies rank 0's copy.
    Leader,
    /// Every rank applies its own copy.
    Own,
    /// Each half of the group applies the copy of its first rank.
    HalfLeader,
    /// Ranks apply the elementwise mean of every copy.
    Mean,
}

impl CopyUse {
    #[must_use]
    pub const fn for_norm(kind: NormKind) -> Self {
        match kind {
            NormKind::LayerNorm => Self::Leader,
            NormKind::LocalLayerNorm => Self::Own,
            NormKind::DoubleLayerNorm => Self::HalfLeader,
            NormKind::RmsNorm | NormKind::ScaleNorm => Self::Mean,
        }
    }

    /// The copy rank `rank` of a `world`-shard group applies. `Mean` reads
    /// every copy and reports 0.
    #[must_use]
    pub const fn source(self, rank: usize, world: usize) -> usize {
        match self {
            Self::Leader | Self::Mean => 0,
            Self::Own => rank,
            Self::HalfLeader => {
                let per_copy = if world < 2 { 1 } else { world / 2 };
                (rank / per_copy) * per_copy
            }
        }
    }
}

/// What a parameter does, as far as partitioning is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRole {
    /// `(vocab, d_embed)` input embedding.
    VocabTable,
    /// `(d_embed, vocab)` untied output projection.
    VocabProjection,
    /// `(vocab)` output projection bias.
    VocabBias,
    /// q/k/v/qkv/up weight `(d_model, out)`.
    ColumnWeight { groups: usize },
    /// Bias of a column weight.
    ColumnBias { groups: usize },
    /// o/down weight `(in, d_model)`.
    RowWeight,
    /// Bias applied once after a reduction (o, down, embedding).
    RowBias,
    /// Normalization scale or offset.
    Norm,
    /// `(n_heads, num_buckets)` relative-position bias table.
    RelativeTable,
    /// `(seq, d_model)` learned absolute positions.
    PositionTable,
    /// `(d_embed, d_model)` projection from the embedding width.
    EmbedProjection,
    /// `(d_model, d_embed)` projection back to the embedding width.
    HeadProjection,
}

/// Partition rules for one configuration.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    shard_count: usize,
    d_model: usize,
    d_embed: usize,
    seq: usize,
    padded_vocab: usize,
    n_heads: usize,
    num_buckets: Option<usize>,
    up_groups: usize,
    norm: NormKind,
}

impl PartitionPlan {
    /// # Errors
    /// Returns [`Error::Configuration`] if the config is invalid.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        let num_buckets = match config.positional {
            PositionalEncoding::RelativeBuckets { num_buckets, .. } => Some(num_buckets),
            _ => None,
        };
        Ok(Self {
            shard_count: config.topology.shard_count,
            d_model: config.d_model,
            d_embed: config.embed_width(),
            seq: config.seq,
            padded_vocab: config.padded_vocab(),
            n_heads: config.n_heads,
            num_buckets,
            up_groups: if config.glu { 2 } else { 1 },
            norm: config.norm.kind,
        })
    }

    #[must_use]
    pub const fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Resolve a parameter path to its role.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] for paths no role claims.
    pub fn role(&self, path: &str) -> Result<TensorRole> {
        let column = [".q", ".k", ".v", ".qkv"];
        let role = if path == "embedding.table" {
            TensorRole::VocabTable
        } else if path == "head.weight" {
            TensorRole::VocabProjection
        } else if path == "head.bias" {
            TensorRole::VocabBias
        } else if path == "relative_position.table" {
            TensorRole::RelativeTable
        } else if path == "embedding.positions" {
            TensorRole::PositionTable
        } else if path == "embedding.project_in" {
            TensorRole::EmbedProjection
        } else if path == "head.project_out" {
            TensorRole::HeadProjection
        } else if path.ends_with(".scale") || path.ends_with(".offset") {
            TensorRole::Norm
        } else if path == "embedding.bias" || path.ends_with(".o.bias") || path.ends_with(".down.bias")
        {
            TensorRole::RowBias
        } else if path.ends_with(".o.weight") || path.ends_with(".down.weight") {
            TensorRole::RowWeight
        } else if path.ends_with(".up.weight") {
            TensorRole::ColumnWeight {
                groups: self.up_groups,
            }
        } else if path.ends_with(".up.bias") {
            TensorRole::ColumnBias {
                groups: self.up_groups,
            }
        } else if let Some(stem) = path.strip_suffix(".weight") {
            if column.iter().any(|c| stem.ends_with(c)) {
                TensorRole::ColumnWeight { groups: 1 }
            } else {
                return Err(unknown_role(path));
            }
        } else if let Some(stem) = path.strip_suffix(".bias") {
            if column.iter().any(|c| stem.ends_with(c)) {
                TensorRole::ColumnBias { groups: 1 }
            } else {
                return Err(unknown_role(path));
            }
        } else {
            return Err(unknown_role(path));
        };
        Ok(role)
    }

    /// Storage strategy for a role.
    #[must_use]
    pub const fn strategy(role: TensorRole) -> ShardStrategy {
        match role {
            TensorRole::VocabTable | TensorRole::VocabBias | TensorRole::RowWeight => {
                ShardStrategy::Split { axis: 0, groups: 1 }
            }
            TensorRole::RelativeTable => ShardStrategy::Split { axis: 0, groups: 1 },
            TensorRole::VocabProjection
            | TensorRole::PositionTable
            | TensorRole::EmbedProjection
            | TensorRole::HeadProjection => ShardStrategy::Split { axis: 1, groups: 1 },
            TensorRole::ColumnWeight { groups } => ShardStrategy::Split { axis: 1, groups },
            TensorRole::ColumnBias { groups } => ShardStrategy::Split { axis: 0, groups },
            TensorRole::RowBias | TensorRole::Norm => ShardStrategy::Replicate,
        }
    }

    /// Which copy of a replicated role each rank applies. Split roles have
    /// a single copy per element and report [`CopyUse::Leader`].
    #[must_use]
    pub const fn copies(&self, role: TensorRole) -> CopyUse {
        match role {
            TensorRole::Norm => CopyUse::for_norm(self.norm),
            _ => CopyUse::Leader,
        }
    }

    /// Classify a parameter by path and logical shape.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when the path has no role or the
    /// shape does not fit the role.
    pub fn classify(&self, path: &str, shape: &[usize]) -> Result<ShardStrategy> {
        let role = self.role(path)?;
        let d = self.d_model;
        let e = self.d_embed;
        let s = self.shard_count;
        let fits = match (role, shape) {
            (TensorRole::VocabTable, &[v, w]) => v == self.padded_vocab && w == e,
            (TensorRole::VocabProjection, &[w, v]) => v == self.padded_vocab && w == e,
            (TensorRole::VocabBias, &[v]) => v == self.padded_vocab,
            (TensorRole::ColumnWeight { groups }, &[w, out]) => {
                w == d && out > 0 && out % (groups * s) == 0
            }
            (TensorRole::ColumnBias { groups }, &[out]) => out > 0 && out % (groups * s) == 0,
            (TensorRole::RowWeight, &[input, w]) => w == d && input > 0 && input % s == 0,
            (TensorRole::RowBias, &[w]) => w == if path == "embedding.bias" { e } else { d },
            (TensorRole::Norm, &[w]) => w == d || w == 1,
            (TensorRole::RelativeTable, &[h, b]) => h == self.n_heads && Some(b) == self.num_buckets,
            (TensorRole::PositionTable, &[p, w]) => p == self.seq && w == d,
            (TensorRole::EmbedProjection, &[i, w]) => i == e && w == d,
            (TensorRole::HeadProjection, &[w, o]) => w == d && o == e && e % s == 0,
            _ => false,
        };
        if !fits {
            return Err(Error::config(format!(
                "shape {shape:?} of '{path}' does not match its role {role:?}"
            )));
        }
        Ok(Self::strategy(role))
    }
}

fn unknown_role(path: &str) -> Error {
    Error::config(format!("parameter '{path}' does not match any known role"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Architecture;

    fn plan(shards: usize, glu: bool) -> PartitionPlan {
        let mut config = ModelConfig::new(Architecture::GptJ, 64, 16, 4, 2, 32);
        config.topology = ShardTopology::new(shards, 1);
        config.glu = glu;
        PartitionPlan::new(&config).unwrap()
    }

    #[test]
    fn test_shard_range() {
        let shard = ShardPosition {
            rank: 3,
            world_size: 4,
        };
        assert_eq!(shard.shard_range(128), (96, 32));
    }

    #[test]
    #[should_panic(expected = "not evenly divisible")]
    fn test_shard_range_indivisible() {
        let shard = ShardPosition {
            rank: 0,
            world_size: 3,
        };
        let _ = shard.shard_range(128);
    }

    #[test]
    fn test_column_parallel_roles() {
        let plan = plan(2, false);
        for name in [
            "layers.0.attention.q.weight",
            "layers.1.attention.k.weight",
            "layers.1.attention.qkv.weight",
            "layers.0.feedforward.up.weight",
        ] {
            assert!(
                matches!(
                    PartitionPlan::strategy(plan.role(name).unwrap()),
                    ShardStrategy::Split { axis: 1, .. }
                ),
                "{name} should split its output axis"
            );
        }
    }

    #[test]
    fn test_row_parallel_and_replicated_roles() {
        let plan = plan(2, false);
        for name in ["layers.0.attention.o.weight", "layers.1.feedforward.down.weight"] {
            assert_eq!(
                PartitionPlan::strategy(plan.role(name).unwrap()),
                ShardStrategy::Split { axis: 0, groups: 1 },
                "{name} should split its input axis"
            );
        }
        for name in [
            "layers.0.norm_1.scale",
            "layers.0.norm_2.offset",
            "head.norm.scale",
            "embedding.norm.offset",
            "layers.0.attention.o.bias",
            "layers.0.feedforward.down.bias",
            "embedding.bias",
        ] {
            assert_eq!(
                PartitionPlan::strategy(plan.role(name).unwrap()),
                ShardStrategy::Replicate,
                "{name} should be replicated"
            );
        }
    }

    #[test]
    fn test_classify_checks_shapes() {
        let plan = plan(2, false);
        assert_eq!(
            plan.classify("embedding.table", &[64, 16]).unwrap(),
            ShardStrategy::Split { axis: 0, groups: 1 }
        );
        assert_eq!(
            plan.classify("head.weight", &[16, 64]).unwrap(),
            ShardStrategy::Split { axis: 1, groups: 1 }
        );
        assert!(plan.classify("head.weight", &[64, 16]).is_err());
        assert!(plan.classify("layers.0.attention.q.weight", &[16, 15]).is_err());
        assert!(matches!(
            plan.classify("layers.0.attention.rotary.freq", &[8]),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_gated_split_is_shard_count_invariant() {
        // value half = 0..4, gate half = 4..8 along the output axis
        #[allow(clippy::cast_precision_loss)]
        let full = HostTensor::new(&[1, 8], (0..8).map(|i| i as f32).collect()).unwrap();
        let strategy = plan(2, true)
            .classify("layers.0.feedforward.up.weight", &[16, 128])
            .unwrap();
        assert_eq!(strategy, ShardStrategy::Split { axis: 1, groups: 2 });

        let shard1 = strategy
            .slice(
                &full,
                ShardPosition {
                    rank: 1,
                    world_size: 2,
                },
            )
            .unwrap();
        // shard 1 holds the second quarter of each half: value [2,3], gate [6,7]
        assert_eq!(shard1.data(), &[2.0, 3.0, 6.0, 7.0]);

        let parts: Vec<_> = (0..2)
            .map(|rank| {
                strategy
                    .slice(
                        &full,
                        ShardPosition {
                            rank,
                            world_size: 2,
                        },
                    )
                    .unwrap()
            })
            .collect();
        assert_eq!(strategy.merge(&parts).unwrap(), full);
    }

    #[test]
    fn test_embedding_width_roles() {
        let mut config = ModelConfig::new(Architecture::GptJ, 64, 16, 4, 2, 32);
        config.topology = ShardTopology::new(2, 1);
        config.d_embed = Some(8);
        let plan = PartitionPlan::new(&config).unwrap();
        assert_eq!(
            plan.classify("embedding.project_in", &[8, 16]).unwrap(),
            ShardStrategy::Split { axis: 1, groups: 1 }
        );
        assert_eq!(
            plan.classify("head.project_out", &[16, 8]).unwrap(),
            ShardStrategy::Split { axis: 1, groups: 1 }
        );
        assert!(plan.classify("embedding.table", &[64, 8]).is_ok());
        assert!(plan.classify("embedding.table", &[64, 16]).is_err());
        assert!(plan.classify("embedding.bias", &[8]).is_ok());
        assert!(plan.classify("head.weight", &[8, 64]).is_ok());
        assert!(plan.classify("head.project_out", &[8, 16]).is_err());
        assert_eq!(
            plan.classify("embedding.positions", &[32, 16]).unwrap(),
            ShardStrategy::Split { axis: 1, groups: 1 }
        );
        assert!(plan.classify("embedding.positions", &[16, 16]).is_err());
    }

    #[test]
    fn test_copy_sources() {
        let ranks = |copies: CopyUse, world: usize| -> Vec<usize> {
            (0..world).map(|r| copies.source(r, world)).collect()
        };
        assert_eq!(ranks(CopyUse::Leader, 4), vec![0, 0, 0, 0]);
        assert_eq!(ranks(CopyUse::Own, 4), vec![0, 1, 2, 3]);
        assert_eq!(ranks(CopyUse::HalfLeader, 4), vec![0, 0, 2, 2]);
        assert_eq!(ranks(CopyUse::HalfLeader, 2), vec![0, 1]);
        assert_eq!(ranks(CopyUse::HalfLeader, 1), vec![0]);

        let mut config = ModelConfig::new(Architecture::GptJ, 64, 16, 4, 2, 32);
        config.topology = ShardTopology::new(2, 1);
        config.norm.kind = NormKind::DoubleLayerNorm;
        let plan = PartitionPlan::new(&config).unwrap();
        let role = plan.role("layers.0.norm_1.scale").unwrap();
        assert_eq!(plan.copies(role), CopyUse::HalfLeader);
        let role = plan.role("layers.0.attention.o.bias").unwrap();
        assert_eq!(plan.copies(role), CopyUse::Leader);
    }

    #[test]
    fn test_shard_shape() {
        let split = ShardStrategy::Split { axis: 1, groups: 1 };
        assert_eq!(split.shard_shape(&[16, 48], 4).unwrap(), vec![16, 12]);
        assert!(split.shard_shape(&[16, 6], 4).is_err());
        assert_eq!(
            ShardStrategy::Replicate.shard_shape(&[16], 4).unwrap(),
            vec![16]
        );
    }
}
