//! Attention over one shard's heads, full-sequence and incremental.
//!
//! Queries are aligned to the end of the keys everywhere: a full pass has
//! as many queries as keys, a decode step has one query sitting at the
//! newest cache slot. Keys are cached un-rotated and rotated again on every
//! call, so a slot's rotary position is always its index in the cache.

use meshformer::{
    AttentionBias, CollectivePoint, Error, LogitScaling, ModelConfig, QkvLayout, Result,
    RotaryLayout, ShardLocal, Tensor,
};

use crate::weights::{Linear, RowLinear, SublayerOutput, WeightSource};
use crate::TransformerOps;

/// Rotary cos/sin tables, `(positions, rotary_dims / 2)` each.
pub(crate) struct RotaryTables<B: TransformerOps> {
    pub(crate) cos: B::Tensor,
    pub(crate) sin: B::Tensor,
    pub(crate) dims: usize,
    pub(crate) layout: RotaryLayout,
}

impl<B: TransformerOps> Clone for RotaryTables<B> {
    fn clone(&self) -> Self {
        Self {
            cos: self.cos.clone(),
            sin: self.sin.clone(),
            dims: self.dims,
            layout: self.layout,
        }
    }
}

/// q/k/v projection storage.
enum QkvProjection<B: TransformerOps> {
    /// Three `(d_model, heads * d_head)` projections.
    Separate {
        q: Linear<B>,
        k: Linear<B>,
        v: Linear<B>,
    },
    /// One `(d_model, heads * 3 * d_head)` projection, head-major with
    /// `[q | k | v]` inside each head.
    Combined(Linear<B>),
}

/// Per-layer decode state: the last `length` keys and values of this
/// shard's heads and how many real tokens have been seen.
///
/// Only [`AttentionCore::get_init_decode_state`] creates one.
pub struct DecodeState<B: TransformerOps> {
    key_cache: B::Tensor,
    value_cache: B::Tensor,
    tokens_decoded: usize,
}

impl<B: TransformerOps> DecodeState<B> {
    /// Number of cache slots.
    pub fn length(&self) -> usize {
        self.key_cache.shape()[0]
    }

    /// Real tokens seen so far; only the newest `min(tokens_decoded,
    /// length)` slots hold them.
    pub const fn tokens_decoded(&self) -> usize {
        self.tokens_decoded
    }
}

impl<B: TransformerOps> Clone for DecodeState<B> {
    fn clone(&self) -> Self {
        Self {
            key_cache: self.key_cache.clone(),
            value_cache: self.value_cache.clone(),
            tokens_decoded: self.tokens_decoded,
        }
    }
}

pub struct AttentionCore<B: TransformerOps> {
    projection: QkvProjection<B>,
    output: RowLinear<B>,
    rotary: Option<RotaryTables<B>>,
    heads: usize,
    head_dim: usize,
    scaling: LogitScaling,
    window: Option<usize>,
    collective: CollectivePoint,
}

impl<B: TransformerOps> AttentionCore<B> {
    pub(crate) fn load(
        source: &WeightSource<'_>,
        prefix: &str,
        config: &ModelConfig,
        layer: usize,
        rotary: Option<RotaryTables<B>>,
    ) -> Result<Self> {
        let spec = config.spec();
        let projection = match spec.qkv_layout {
            QkvLayout::Separate => QkvProjection::Separate {
                q: Linear::load(source, &format!("{prefix}.q"))?,
                k: Linear::load(source, &format!("{prefix}.k"))?,
                v: Linear::load(source, &format!("{prefix}.v"))?,
            },
            QkvLayout::Combined => QkvProjection::Combined(Linear::load(
                source,
                &format!("{prefix}.qkv"),
            )?),
        };
        let head_dim = config.head_dim();
        let heads = config.heads_per_shard();
        let width = match &projection {
            QkvProjection::Separate { q, .. } => q.out_features(),
            QkvProjection::Combined(qkv) => qkv.out_features() / 3,
        };
        if width != heads * head_dim {
            return Err(Error::ShapeMismatch {
                path: format!("{prefix}.q"),
                expected: vec![config.d_model, heads * head_dim],
                got: vec![config.d_model, width],
            });
        }
        Ok(Self {
            projection,
            output: RowLinear::load(source, &format!("{prefix}.o"))?,
            rotary,
            heads,
            head_dim,
            scaling: spec.logit_scaling,
            window: config.attention_window(layer),
            collective: config.collective,
        })
    }

    /// Sliding window of a local layer, `None` for global layers.
    pub const fn window(&self) -> Option<usize> {
        self.window
    }

    /// Full causal attention over `input` (seq, d_model).
    ///
    /// `positional` holds the positional bias plus any key padding mask,
    /// shaped `(heads | 1, seq, seq)`.
    pub fn forward(
        &self,
        input: &ShardLocal<B::Tensor>,
        positional: &AttentionBias,
        comm: &B::Comm,
    ) -> Result<SublayerOutput<B::Tensor>> {
        let (q, k, v) = self.project(input.get())?;
        let seq = q.shape()[0];
        let bias = positional.add(&AttentionBias::causal(seq, seq, self.window))?;
        self.attend(&q, &k, &v, &bias, 0, comm)
    }

    /// Prime the decode state from a right-aligned context.
    ///
    /// `input` covers the whole cache length; only its last `given_length`
    /// rows are real tokens, the slots before them are masked out as keys.
    /// Returns the output for every position (the last row belongs to the
    /// newest token) and a state with `tokens_decoded = given_length`.
    pub fn get_init_decode_state(
        &self,
        input: &ShardLocal<B::Tensor>,
        given_length: usize,
        positional: &AttentionBias,
        comm: &B::Comm,
    ) -> Result<(SublayerOutput<B::Tensor>, DecodeState<B>)> {
        let (q, k, v) = self.project(input.get())?;
        let length = q.shape()[0];
        if given_length > length {
            return Err(Error::InvalidInput(format!(
                "given length {given_length} exceeds context of {length}"
            )));
        }
        let padding = length - given_length;
        let mut mask = AttentionBias::causal(length, length, self.window);
        mask.mask_keys(|j| j < padding);
        let bias = positional.add(&mask)?;

        let out = self.attend(&q, &k, &v, &bias, 0, comm)?;
        let state = DecodeState {
            key_cache: k,
            value_cache: v,
            tokens_decoded: given_length,
        };
        Ok((out, state))
    }

    /// Attend from one new token, evicting the oldest cache slot.
    ///
    /// `positional` is shaped `(heads | 1, 1, length)`.
    pub fn decode_once(
        &self,
        state: DecodeState<B>,
        input: &ShardLocal<B::Tensor>,
        positional: &AttentionBias,
        comm: &B::Comm,
    ) -> Result<(SublayerOutput<B::Tensor>, DecodeState<B>)> {
        let (q, k, v) = self.project(input.get())?;
        if q.shape()[0] != 1 {
            return Err(Error::InvalidInput(format!(
                "decode_once takes one token, got {}",
                q.shape()[0]
            )));
        }
        let length = state.length();
        let keys = B::narrow(&B::concat(&[state.key_cache, k], 0)?, 0, 1, length)?;
        let values = B::narrow(&B::concat(&[state.value_cache, v], 0)?, 0, 1, length)?;
        let tokens_decoded = state.tokens_decoded + 1;

        let visible = tokens_decoded.min(self.window.unwrap_or(length));
        let masked = length.saturating_sub(visible);
        let mut mask = AttentionBias::zeros(1, 1, length);
        mask.mask_keys(|j| j < masked);
        let bias = positional.add(&mask)?;

        let out = self.attend(&q, &keys, &values, &bias, length - 1, comm)?;
        let state = DecodeState {
            key_cache: keys,
            value_cache: values,
            tokens_decoded,
        };
        Ok((out, state))
    }

    /// Project to q, k, v, each `(seq, heads, d_head)`. Queries are
    /// pre-scaled for [`LogitScaling::PrescaledQuery`].
    fn project(&self, input: &B::Tensor) -> Result<(B::Tensor, B::Tensor, B::Tensor)> {
        let seq = input.shape()[0];
        let heads_shape = [seq, self.heads, self.head_dim];
        let (mut q, k, v) = match &self.projection {
            QkvProjection::Separate { q, k, v } => (
                q.forward(input)?.reshape(&heads_shape),
                k.forward(input)?.reshape(&heads_shape),
                v.forward(input)?.reshape(&heads_shape),
            ),
            QkvProjection::Combined(qkv) => {
                let fused = qkv
                    .forward(input)?
                    .reshape(&[seq, self.heads, 3 * self.head_dim]);
                (
                    B::narrow(&fused, 2, 0, self.head_dim)?,
                    B::narrow(&fused, 2, self.head_dim, self.head_dim)?,
                    B::narrow(&fused, 2, 2 * self.head_dim, self.head_dim)?,
                )
            }
        };
        if self.scaling == LogitScaling::PrescaledQuery {
            B::scale_inplace(&mut q, self.inv_sqrt_head_dim())?;
        }
        Ok((q, k, v))
    }

    /// Rotate, attend and project back to `d_model` (a partial sum unless
    /// the collective is early). Queries sit at `query_offset..`, keys at
    /// `0..`.
    fn attend(
        &self,
        q: &B::Tensor,
        k: &B::Tensor,
        v: &B::Tensor,
        bias: &AttentionBias,
        query_offset: usize,
        comm: &B::Comm,
    ) -> Result<SublayerOutput<B::Tensor>> {
        let (q, k) = match &self.rotary {
            Some(rope) => (
                B::apply_rotary(q, &rope.cos, &rope.sin, rope.dims, rope.layout, query_offset)?,
                B::apply_rotary(k, &rope.cos, &rope.sin, rope.dims, rope.layout, 0)?,
            ),
            None => (q.clone(), k.clone()),
        };
        let scale = match self.scaling {
            LogitScaling::Scaled => self.inv_sqrt_head_dim(),
            LogitScaling::PrescaledQuery | LogitScaling::Unscaled => 1.0,
        };
        let bias = B::from_f32(&bias.shape(), bias.data())?;
        let attended = B::attention(&q, &k, v, &bias, scale)?;
        let seq = attended.shape()[0];
        let flat = attended.reshape(&[seq, self.heads * self.head_dim]);
        self.output.forward(&flat, self.collective, comm)
    }

    #[allow(clippy::cast_precision_loss)]
    fn inv_sqrt_head_dim(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }
}
