//! Normalization variants and how each keeps its parameters in sync.
//!
//! Every shard stores a full copy of the scale (and offset). The variants
//! differ in which copy they apply:
//!
//! - `LayerNorm` gathers every copy and applies shard 0's,
//! - `LocalLayerNorm` applies its own copy with no collective,
//! - `DoubleLayerNorm` gathers and applies the first copy of its half of
//!   the group,
//! - `RmsNorm` / `ScaleNorm` average the copies.

use meshformer::{Comm, CopyUse, Error, NormConfig, NormKind, Replicated, Result, ShardLocal};

use crate::weights::WeightSource;
use crate::TransformerOps;

/// Epsilon of every normalization variant.
pub const NORM_EPS: f32 = 1e-5;

pub struct Norm<B: TransformerOps> {
    kind: NormKind,
    scale: B::Tensor,
    offset: Option<B::Tensor>,
}

impl<B: TransformerOps> Norm<B> {
    pub(crate) fn load(source: &WeightSource<'_>, prefix: &str, config: NormConfig) -> Result<Self> {
        let offset = if config.offset {
            Some(source.load_tensor::<B>(&format!("{prefix}.offset"))?)
        } else {
            None
        };
        Ok(Self {
            kind: config.kind,
            scale: source.load_tensor::<B>(&format!("{prefix}.scale"))?,
            offset,
        })
    }

    #[must_use]
    pub const fn kind(&self) -> NormKind {
        self.kind
    }

    /// Normalize the residual stream as input to a sublayer.
    pub fn forward(
        &self,
        input: &Replicated<B::Tensor>,
        comm: &B::Comm,
    ) -> Result<ShardLocal<B::Tensor>> {
        let (out, _) = self.apply(input, comm)?;
        Ok(out)
    }

    /// Normalize the residual stream itself (post-norm layers, embedding
    /// norm). Variants whose output may differ between shards are averaged
    /// back into one stream.
    pub fn forward_synced(
        &self,
        input: &Replicated<B::Tensor>,
        comm: &B::Comm,
    ) -> Result<Replicated<B::Tensor>> {
        let (out, synced) = self.apply(input, comm)?;
        if synced {
            Ok(Replicated::new(out.into_inner()))
        } else {
            comm.average(out)
        }
    }

    /// Returns the output and whether every rank computed the same value.
    fn apply(
        &self,
        input: &Replicated<B::Tensor>,
        comm: &B::Comm,
    ) -> Result<(ShardLocal<B::Tensor>, bool)> {
        let x = input.get();
        match self.kind {
            NormKind::LayerNorm => {
                let (scale, offset) = self.gathered_copy(comm, 0)?;
                let out = B::layer_norm(x, &scale, offset.as_ref(), NORM_EPS)?;
                Ok((ShardLocal::new(out), true))
            }
            NormKind::LocalLayerNorm => {
                let out = B::layer_norm(x, &self.scale, self.offset.as_ref(), NORM_EPS)?;
                Ok((ShardLocal::new(out), false))
            }
            NormKind::DoubleLayerNorm => {
                let source = CopyUse::HalfLeader.source(comm.rank(), comm.world_size());
                let (scale, offset) = self.gathered_copy(comm, source)?;
                let out = B::layer_norm(x, &scale, offset.as_ref(), NORM_EPS)?;
                Ok((ShardLocal::new(out), comm.world_size() == 1))
            }
            NormKind::RmsNorm | NormKind::ScaleNorm => {
                let scale = comm.average(ShardLocal::new(self.scale.clone()))?;
                let offset = match &self.offset {
                    Some(offset) => Some(comm.average(ShardLocal::new(offset.clone()))?),
                    None => None,
                };
                let out = B::l2_norm(
                    x,
                    scale.get(),
                    offset.as_ref().map(Replicated::get),
                    NORM_EPS,
                )?;
                Ok((ShardLocal::new(out), true))
            }
        }
    }

    /// Gather every rank's copy and pick the one held by `source`.
    fn gathered_copy(
        &self,
        comm: &B::Comm,
        source: usize,
    ) -> Result<(B::Tensor, Option<B::Tensor>)> {
        let pick = |copies: Replicated<Vec<B::Tensor>>| {
            copies
                .into_inner()
                .into_iter()
                .nth(source)
                .ok_or_else(|| Error::Collective(format!("no norm copy from rank {source}")))
        };
        let scale = pick(comm.all_gather(ShardLocal::new(self.scale.clone()))?)?;
        let offset = match &self.offset {
            Some(offset) => Some(pick(comm.all_gather(ShardLocal::new(offset.clone()))?)?),
            None => None,
        };
        Ok((scale, offset))
    }
}
