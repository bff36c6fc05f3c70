//! Checkpoint shape map, resharding and the checkpoint store contract.
//!
//! The shape map is computed from the configuration alone: for every
//! parameter path it records the logical shape, the per-shard shape, the
//! storage dtype and the partition strategy. It never holds buffers, so a
//! loader can check a checkpoint against it before reading any data.
//!
//! Resharding goes through logical tensors: shards written under one shard
//! count are merged per strategy and sliced again for the target count.
//! Split strategies do not depend on the shard count, so the target map's
//! strategies merge the source shards too. Replicated norm copies are then
//! placed per rank: each target rank takes the copy the source rank
//! covering its columns applied, and averaged copies take the mean.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::{HeadKind, ModelConfig, NormKind, PositionalEncoding, QkvLayout, Residual};
use crate::dtype::DType;
use crate::params::{HostTensor, ParamSet};
use crate::shard::{CopyUse, PartitionPlan, ShardPosition, ShardStrategy, ShardTopology};
use crate::{Error, Result};

/// Shape and placement of one parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub logical_shape: Vec<usize>,
    pub shard_shape: Vec<usize>,
    pub dtype: DType,
    pub strategy: ShardStrategy,
    /// Which copy each rank applies when the strategy replicates.
    pub copies: CopyUse,
}

/// Every parameter of one configuration, keyed by path.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointShapeMap {
    topology: ShardTopology,
    specs: BTreeMap<String, ParamSpec>,
}

impl CheckpointShapeMap {
    /// Build the map for `config`, storing f32.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if the config is invalid or a
    /// parameter does not fit its partition role.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let plan = PartitionPlan::new(config)?;
        let shards = plan.shard_count();
        let specs = logical_shapes(config)
            .into_iter()
            .map(|(path, logical_shape)| {
                let strategy = plan.classify(&path, &logical_shape)?;
                let shard_shape = strategy.shard_shape(&logical_shape, shards)?;
                let copies = plan.copies(plan.role(&path)?);
                Ok((
                    path,
                    ParamSpec {
                        logical_shape,
                        shard_shape,
                        dtype: DType::F32,
                        strategy,
                        copies,
                    },
                ))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            topology: config.topology,
            specs,
        })
    }

    /// Same map with every parameter stored as `dtype`.
    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        for spec in self.specs.values_mut() {
            spec.dtype = dtype;
        }
        self
    }

    #[must_use]
    pub const fn topology(&self) -> ShardTopology {
        self.topology
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&ParamSpec> {
        self.specs.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamSpec)> {
        self.specs.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Check a set of found shapes against the map.
    ///
    /// `shard_level` selects whether `found` holds per-shard or logical
    /// shapes. Every path must be present, no extra paths are allowed.
    ///
    /// # Errors
    /// [`Error::MissingParameter`] for an absent path,
    /// [`Error::ShapeMismatch`] for a wrong shape or an unknown path.
    pub fn validate<'a>(
        &self,
        found: impl IntoIterator<Item = (&'a str, &'a [usize])>,
        shard_level: bool,
    ) -> Result<()> {
        let found: BTreeMap<&str, &[usize]> = found.into_iter().collect();
        for (path, spec) in &self.specs {
            let expected = if shard_level {
                &spec.shard_shape
            } else {
                &spec.logical_shape
            };
            let got = found
                .get(path.as_str())
                .ok_or_else(|| Error::MissingParameter(path.clone()))?;
            if *got != expected.as_slice() {
                return Err(Error::ShapeMismatch {
                    path: path.clone(),
                    expected: expected.clone(),
                    got: got.to_vec(),
                });
            }
        }
        if let Some((path, got)) = found.iter().find(|(p, _)| !self.specs.contains_key(**p)) {
            return Err(Error::ShapeMismatch {
                path: (*path).to_string(),
                expected: Vec::new(),
                got: got.to_vec(),
            });
        }
        Ok(())
    }

    /// Check one shard's parameters against the per-shard shapes.
    ///
    /// # Errors
    /// See [`CheckpointShapeMap::validate`].
    pub fn validate_shard(&self, shard: &ParamSet) -> Result<()> {
        self.validate(
            shard.iter().map(|(p, t)| (p.as_str(), t.shape())),
            true,
        )
    }

    /// Slice logical parameters into one set per shard, in rank order.
    ///
    /// # Errors
    /// Returns an error if a parameter is missing or mis-shaped.
    pub fn shard(&self, logical: &ParamSet) -> Result<Vec<ParamSet>> {
        self.validate(
            logical.iter().map(|(p, t)| (p.as_str(), t.shape())),
            false,
        )?;
        let world_size = self.topology.shard_count;
        (0..world_size)
            .map(|rank| {
                let position = ShardPosition { rank, world_size };
                self.specs
                    .iter()
                    .map(|(path, spec)| {
                        let full = logical
                            .get(path)
                            .ok_or_else(|| Error::MissingParameter(path.clone()))?;
                        Ok((path.clone(), spec.strategy.slice(full, position)?))
                    })
                    .collect()
            })
            .collect()
    }

    /// Merge per-shard parameters (any shard count) back into logical
    /// tensors and check them against the logical shapes.
    ///
    /// A replicated parameter becomes the copy rank 0 applies, or the mean
    /// of every copy for averaged norms.
    ///
    /// # Errors
    /// Returns an error if any shard lacks a parameter or the merged shape
    /// disagrees with the map.
    pub fn unshard(&self, shards: &[ParamSet]) -> Result<ParamSet> {
        if shards.is_empty() {
            return Err(Error::InvalidInput("no shards to merge".into()));
        }
        let mut logical = ParamSet::new();
        for (path, spec) in &self.specs {
            let parts = shards
                .iter()
                .map(|shard| {
                    shard
                        .get(path)
                        .cloned()
                        .ok_or_else(|| Error::MissingParameter(path.clone()))
                })
                .collect::<Result<Vec<_>>>()?;
            let merged = match (spec.strategy, spec.copies) {
                (ShardStrategy::Replicate, CopyUse::Mean) => mean_copy(&parts),
                (strategy, _) => strategy.merge(&parts),
            }
            .map_err(|_| Error::ShapeMismatch {
                path: path.clone(),
                expected: spec.logical_shape.clone(),
                got: parts[0].shape().to_vec(),
            })?;
            logical.insert(path.clone(), merged);
        }
        if let Some((path, t)) = shards[0].iter().find(|(p, _)| !self.specs.contains_key(*p)) {
            return Err(Error::ShapeMismatch {
                path: path.clone(),
                expected: Vec::new(),
                got: t.shape().to_vec(),
            });
        }
        self.validate(
            logical.iter().map(|(p, t)| (p.as_str(), t.shape())),
            false,
        )?;
        Ok(logical)
    }
}

/// Re-partition shards written under any shard count for `target`.
///
/// # Errors
/// Returns an error if the shards do not match the target's logical shapes.
pub fn reshard(shards: &[ParamSet], target: &CheckpointShapeMap) -> Result<Vec<ParamSet>> {
    debug!(
        from = shards.len(),
        to = target.topology().shard_count,
        "Resharding parameters"
    );
    let logical = target.unshard(shards)?;
    let mut out = target.shard(&logical)?;
    let (from, to) = (shards.len(), out.len());
    for (path, spec) in target.iter() {
        if spec.strategy != ShardStrategy::Replicate
            || matches!(spec.copies, CopyUse::Leader | CopyUse::Mean)
        {
            continue;
        }
        for (rank, shard) in out.iter_mut().enumerate() {
            // the source rank whose columns this rank's columns fall in
            let covering = rank * from / to;
            let copy = spec.copies.source(covering, from);
            let tensor = shards[copy]
                .get(path)
                .ok_or_else(|| Error::MissingParameter(path.clone()))?;
            shard.insert(path.clone(), tensor.clone());
        }
    }
    Ok(out)
}

/// Elementwise mean of equally shaped copies.
fn mean_copy(copies: &[HostTensor]) -> Result<HostTensor> {
    let first = copies
        .first()
        .ok_or_else(|| Error::InvalidShape("mean of zero copies".into()))?;
    let mut sum = vec![0.0_f32; first.numel()];
    for copy in copies {
        if copy.shape() != first.shape() {
            return Err(Error::InvalidShape(format!(
                "copy shape {:?} differs from {:?}",
                copy.shape(),
                first.shape()
            )));
        }
        for (acc, v) in sum.iter_mut().zip(copy.data()) {
            *acc += v;
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let n = copies.len() as f32;
    HostTensor::new(first.shape(), sum.into_iter().map(|v| v / n).collect())
}

/// Storage for per-shard parameters.
///
/// Implementations are all-or-nothing: a failed read returns an error and
/// no parameters.
pub trait CheckpointStore {
    /// Persist one parameter set per shard, in rank order.
    ///
    /// # Errors
    /// Returns an error if the shards do not match `shape_map` or the
    /// storage fails.
    fn write(&mut self, shards: &[ParamSet], shape_map: &CheckpointShapeMap) -> Result<()>;

    /// Load parameters for the topology of `shape_map`, resharding when the
    /// stored shard count differs.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if a stored tensor disagrees with the map.
    fn read(&self, shape_map: &CheckpointShapeMap) -> Result<Vec<ParamSet>>;
}

/// Checkpoint kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpoint {
    shards: Vec<ParamSet>,
}

impl MemoryCheckpoint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored shards (0 before the first write).
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl CheckpointStore for MemoryCheckpoint {
    fn write(&mut self, shards: &[ParamSet], shape_map: &CheckpointShapeMap) -> Result<()> {
        if shards.len() != shape_map.topology().shard_count {
            return Err(Error::InvalidInput(format!(
                "{} shards for shard_count {}",
                shards.len(),
                shape_map.topology().shard_count
            )));
        }
        for shard in shards {
            shape_map.validate_shard(shard)?;
        }
        self.shards = shards.to_vec();
        Ok(())
    }

    fn read(&self, shape_map: &CheckpointShapeMap) -> Result<Vec<ParamSet>> {
        if self.shards.is_empty() {
            return Err(Error::InvalidInput("checkpoint is empty".into()));
        }
        if self.shards.len() == shape_map.topology().shard_count {
            for shard in &self.shards {
                shape_map.validate_shard(shard)?;
            }
            return Ok(self.shards.clone());
        }
        reshard(&self.shards, shape_map)
    }
}

/// Path and logical shape of every parameter `config` implies.
fn logical_shapes(config: &ModelConfig) -> Vec<(String, Vec<usize>)> {
    let spec = config.spec();
    let d = config.d_model;
    let e = config.embed_width();
    let vocab = config.padded_vocab();
    let mut out = Vec::new();

    let norm = |out: &mut Vec<(String, Vec<usize>)>, prefix: &str| {
        let scale = if config.norm.kind == NormKind::ScaleNorm {
            vec![1]
        } else {
            vec![d]
        };
        out.push((format!("{prefix}.scale"), scale));
        if config.norm.offset {
            out.push((format!("{prefix}.offset"), vec![d]));
        }
    };

    out.push(("embedding.table".to_string(), vec![vocab, e]));
    if spec.embedding_bias {
        out.push(("embedding.bias".to_string(), vec![e]));
    }
    if e != d {
        out.push(("embedding.project_in".to_string(), vec![e, d]));
    }
    if matches!(config.positional, PositionalEncoding::Learned { .. }) {
        out.push(("embedding.positions".to_string(), vec![config.seq, d]));
    }
    if spec.embedding_norm {
        norm(&mut out, "embedding.norm");
    }
    if let PositionalEncoding::RelativeBuckets { num_buckets, .. } = config.positional {
        out.push((
            "relative_position.table".to_string(),
            vec![config.n_heads, num_buckets],
        ));
    }

    let up_width = if config.glu { 2 * config.d_ff } else { config.d_ff };
    let second_norm = !matches!(spec.residual, Residual::Parallel { shared_norm: true });
    for layer in 0..config.layers {
        let p = format!("layers.{layer}");
        norm(&mut out, &format!("{p}.norm_1"));
        if second_norm {
            norm(&mut out, &format!("{p}.norm_2"));
        }
        let projections: &[(&str, usize)] = match spec.qkv_layout {
            QkvLayout::Separate => &[("q", 1), ("k", 1), ("v", 1)],
            QkvLayout::Combined => &[("qkv", 3)],
        };
        for &(name, width) in projections {
            out.push((format!("{p}.attention.{name}.weight"), vec![d, width * d]));
            if spec.qkv_bias {
                out.push((format!("{p}.attention.{name}.bias"), vec![width * d]));
            }
        }
        out.push((format!("{p}.attention.o.weight"), vec![d, d]));
        if spec.out_bias {
            out.push((format!("{p}.attention.o.bias"), vec![d]));
        }
        out.push((format!("{p}.feedforward.up.weight"), vec![d, up_width]));
        out.push((format!("{p}.feedforward.up.bias"), vec![up_width]));
        out.push((format!("{p}.feedforward.down.weight"), vec![config.d_ff, d]));
        out.push((format!("{p}.feedforward.down.bias"), vec![d]));
    }

    if spec.final_norm {
        norm(&mut out, "head.norm");
    }
    if e != d {
        out.push(("head.project_out".to_string(), vec![d, e]));
    }
    if let HeadKind::Untied { bias } = spec.head {
        out.push(("head.weight".to_string(), vec![e, vocab]));
        if bias {
            out.push(("head.bias".to_string(), vec![vocab]));
        }
    }
    out
}
