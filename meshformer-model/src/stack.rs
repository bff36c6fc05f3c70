//! The full per-worker model: embedding, layers, projection head and the
//! positional bias shared by every layer.

use meshformer::position::alibi_slopes;
use meshformer::rope::{precompute_rotary_data, sinusoid_table, ROTARY_BASE};
use meshformer::{
    AttentionBias, Comm, Error, ModelConfig, ParamSet, PositionalEncoding, Replicated,
    Result, ShardLocal, ShardPosition, Tensor,
};

use crate::attention::{DecodeState, RotaryTables};
use crate::layer::LayerShard;
use crate::norm::Norm;
use crate::projection::{ProjectionHead, TokenLoss};
use crate::weights::WeightSource;
use crate::TransformerOps;

/// Vocabulary-sharded token embedding.
///
/// Each shard gathers rows for the ids inside its vocabulary slice and
/// zeros elsewhere; one all-reduce assembles the full embedding. A narrower
/// `d_embed` table is projected up to `d_model` before the reduction.
pub struct Embedding<B: TransformerOps> {
    /// `(vocab_slice, d_embed)`
    table: B::Tensor,
    bias: Option<B::Tensor>,
    /// This shard's `(d_embed, d_model / shards)` columns of the projection.
    project_in: Option<B::Tensor>,
    positions: Option<AbsolutePositions<B>>,
    norm: Option<Norm<B>>,
    scale: Option<f32>,
    vocab_start: usize,
    n_vocab: usize,
    seq: usize,
}

/// Absolute position rows added to the token embedding.
enum AbsolutePositions<B: TransformerOps> {
    /// `(seq, d_model)` learned rows, zero outside this shard's columns,
    /// summed by the embedding all-reduce.
    Learned { table: B::Tensor, shift: usize },
    /// `(seq, d_model)` sinusoids with the shift applied, added after the
    /// all-reduce.
    Fixed { table: B::Tensor },
}

impl<B: TransformerOps> Embedding<B> {
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn load(
        source: &WeightSource<'_>,
        config: &ModelConfig,
        position: ShardPosition,
    ) -> Result<Self> {
        let spec = config.spec();
        let table = source.load_tensor::<B>("embedding.table")?;
        let (vocab_start, vocab_slice) = position.shard_range(config.padded_vocab());
        if table.shape() != [vocab_slice, config.embed_width()] {
            return Err(Error::ShapeMismatch {
                path: "embedding.table".into(),
                expected: vec![vocab_slice, config.embed_width()],
                got: table.shape().to_vec(),
            });
        }
        let norm = if spec.embedding_norm {
            Some(Norm::load(source, "embedding.norm", config.norm)?)
        } else {
            None
        };
        Ok(Self {
            table,
            bias: source.load_optional::<B>("embedding.bias")?,
            project_in: source.load_optional::<B>("embedding.project_in")?,
            positions: Self::load_positions(source, config, position)?,
            norm,
            scale: spec.embedding_scale.then(|| (config.d_model as f32).sqrt()),
            vocab_start,
            n_vocab: config.n_vocab,
            seq: config.seq,
        })
    }

    fn load_positions(
        source: &WeightSource<'_>,
        config: &ModelConfig,
        position: ShardPosition,
    ) -> Result<Option<AbsolutePositions<B>>> {
        let d = config.d_model;
        match config.positional {
            PositionalEncoding::Learned { shift } => {
                let local = source.host("embedding.positions")?;
                let (start, width) = position.shard_range(d);
                if local.shape() != [config.seq, width] {
                    return Err(Error::ShapeMismatch {
                        path: "embedding.positions".into(),
                        expected: vec![config.seq, width],
                        got: local.shape().to_vec(),
                    });
                }
                let mut full = vec![0.0_f32; config.seq * d];
                for (row, chunk) in local.data().chunks_exact(width).enumerate() {
                    full[row * d + start..row * d + start + width].copy_from_slice(chunk);
                }
                Ok(Some(AbsolutePositions::Learned {
                    table: B::from_f32(&[config.seq, d], &full)?,
                    shift,
                }))
            }
            PositionalEncoding::Sinusoidal { shift, layout } => {
                let table = sinusoid_table(config.seq, d, shift, layout);
                Ok(Some(AbsolutePositions::Fixed {
                    table: B::from_f32(&[config.seq, d], &table)?,
                }))
            }
            _ => Ok(None),
        }
    }

    /// This shard's `(vocab_slice, d_embed)` rows.
    pub const fn table(&self) -> &B::Tensor {
        &self.table
    }

    /// Embed `tokens` at absolute `positions` into `(seq, d_model)` on
    /// every rank. Positions wrap at the configured sequence length.
    ///
    /// Ids at or past `n_vocab` embed to the bias alone.
    pub fn forward(
        &self,
        tokens: &[u32],
        positions: &[usize],
        comm: &B::Comm,
    ) -> Result<Replicated<B::Tensor>> {
        if positions.len() != tokens.len() {
            return Err(Error::InvalidInput(format!(
                "{} positions for {} tokens",
                positions.len(),
                tokens.len()
            )));
        }
        let ids: Vec<u32> = tokens
            .iter()
            .map(|&t| if (t as usize) < self.n_vocab { t } else { u32::MAX })
            .collect();
        let mut rows = B::embedding_gather(&self.table, &ids, self.vocab_start)?;
        if let Some(bias) = &self.bias {
            if comm.rank() == 0 {
                rows = B::add_bias(&rows, bias)?;
            }
        }
        if let Some(scale) = self.scale {
            B::scale_inplace(&mut rows, scale)?;
        }
        if let Some(project_in) = &self.project_in {
            let full = comm
                .all_gather(ShardLocal::new(project_in.clone()))?
                .map(|columns| B::concat(&columns, 1))?;
            rows = B::matmul(&rows, full.get())?;
        }
        if let Some(AbsolutePositions::Learned { table, shift }) = &self.positions {
            let learned = B::embedding_gather(table, &self.position_rows(positions, *shift), 0)?;
            B::add_inplace(&mut rows, &learned)?;
        }
        let mut embedded = comm.all_reduce_sum(ShardLocal::new(rows))?;
        if let Some(AbsolutePositions::Fixed { table }) = &self.positions {
            let fixed = B::embedding_gather(table, &self.position_rows(positions, 0), 0)?;
            embedded = embedded.map(|x| B::add(&x, &fixed))?;
        }
        match &self.norm {
            Some(norm) => norm.forward_synced(&embedded, comm),
            None => Ok(embedded),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn position_rows(&self, positions: &[usize], shift: usize) -> Vec<u32> {
        positions
            .iter()
            .map(|&p| ((p + shift) % self.seq) as u32)
            .collect()
    }
}

/// Per-layer decode states of one sequence.
pub struct DecodeCache<B: TransformerOps> {
    states: Vec<DecodeState<B>>,
}

impl<B: TransformerOps> DecodeCache<B> {
    /// Number of layers.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Cache slots per layer.
    pub fn length(&self) -> usize {
        self.states.first().map_or(0, DecodeState::length)
    }

    pub fn tokens_decoded(&self) -> usize {
        self.states.first().map_or(0, DecodeState::tokens_decoded)
    }

    pub fn states(&self) -> &[DecodeState<B>] {
        &self.states
    }
}

impl<B: TransformerOps> Clone for DecodeCache<B> {
    fn clone(&self) -> Self {
        Self {
            states: self.states.clone(),
        }
    }
}

/// Positional terms that enter attention as an additive bias.
enum PositionalBias {
    /// Rotary (applied inside attention), absolute positions (added to
    /// the embedding) or no positional encoding.
    Zero,
    Alibi {
        slopes: Vec<f32>,
    },
    Relative {
        /// Local `(heads, num_buckets)` table.
        table: Vec<f32>,
        num_buckets: usize,
        max_distance: usize,
    },
}

/// One worker's slice of the whole model.
pub struct TransformerStack<B: TransformerOps> {
    embedding: Embedding<B>,
    layers: Vec<LayerShard<B>>,
    head: ProjectionHead<B>,
    positional: PositionalBias,
    seq: usize,
}

impl<B: TransformerOps> TransformerStack<B> {
    /// Upload one worker's parameter slice.
    ///
    /// # Errors
    /// Returns [`Error::MissingParameter`] or [`Error::ShapeMismatch`] when
    /// `params` does not match `config` at `position`.
    pub fn load(config: &ModelConfig, position: ShardPosition, params: &ParamSet) -> Result<Self> {
        let source = WeightSource::new(params);
        let positional = match config.positional {
            PositionalEncoding::Alibi => PositionalBias::Alibi {
                slopes: alibi_slopes(config.n_heads, position),
            },
            PositionalEncoding::RelativeBuckets {
                num_buckets,
                max_distance,
            } => PositionalBias::Relative {
                table: source.host("relative_position.table")?.data().to_vec(),
                num_buckets,
                max_distance,
            },
            PositionalEncoding::Rotary { .. }
            | PositionalEncoding::Learned { .. }
            | PositionalEncoding::Sinusoidal { .. }
            | PositionalEncoding::None => PositionalBias::Zero,
        };
        let rotary = match config.positional {
            PositionalEncoding::Rotary { offset, layout, .. } => {
                let dims = config.rotary_dims();
                let (cos, sin) = precompute_rotary_data(config.seq, dims, ROTARY_BASE, offset);
                Some(RotaryTables {
                    cos: B::from_f32(&[config.seq, dims / 2], &cos)?,
                    sin: B::from_f32(&[config.seq, dims / 2], &sin)?,
                    dims,
                    layout,
                })
            }
            _ => None,
        };

        let embedding = Embedding::load(&source, config, position)?;
        let layers = (0..config.layers)
            .map(|layer| LayerShard::load(&source, config, layer, rotary.clone()))
            .collect::<Result<Vec<_>>>()?;
        let head = ProjectionHead::load(&source, config, position, embedding.table())?;
        Ok(Self {
            embedding,
            layers,
            head,
            positional,
            seq: config.seq,
        })
    }

    pub fn layers(&self) -> &[LayerShard<B>] {
        &self.layers
    }

    pub const fn embedding(&self) -> &Embedding<B> {
        &self.embedding
    }

    pub const fn head(&self) -> &ProjectionHead<B> {
        &self.head
    }

    /// Final hidden states `(seq, d_model)` before the head.
    ///
    /// With `ctx_length`, keys at or past it are masked out of every
    /// layer's attention.
    pub fn hidden(
        &self,
        tokens: &[u32],
        ctx_length: Option<usize>,
        comm: &B::Comm,
    ) -> Result<Replicated<B::Tensor>> {
        self.check_length(tokens.len())?;
        let mut positional = self.positional_bias(tokens.len(), tokens.len())?;
        if let Some(ctx_length) = ctx_length {
            positional.mask_keys(|j| j >= ctx_length);
        }
        let positions: Vec<usize> = (0..tokens.len()).collect();
        let mut x = self.embedding.forward(tokens, &positions, comm)?;
        for layer in &self.layers {
            x = layer.forward(&x, &positional, comm)?;
        }
        Ok(x)
    }

    /// Logits `(seq, n_vocab)` for every position.
    pub fn logits(&self, tokens: &[u32], comm: &B::Comm) -> Result<Replicated<B::Tensor>> {
        let hidden = self.hidden(tokens, None, comm)?;
        self.head.logits(&hidden, comm)
    }

    /// Next-token loss of `tokens` against `targets`.
    pub fn loss(
        &self,
        tokens: &[u32],
        targets: &[u32],
        ctx_length: Option<usize>,
        z_loss: f32,
        comm: &B::Comm,
    ) -> Result<TokenLoss> {
        let hidden = self.hidden(tokens, ctx_length, comm)?;
        self.head.loss(&hidden, targets, z_loss, comm)
    }

    /// Run a right-aligned context and build a cache of `context.len()`
    /// slots, the last `given_length` of which hold real tokens. The first
    /// real token sits at position 0.
    ///
    /// Returns logits `(1, n_vocab)` of the final position.
    pub fn get_init_decode_state(
        &self,
        context: &[u32],
        given_length: usize,
        comm: &B::Comm,
    ) -> Result<(Replicated<B::Tensor>, DecodeCache<B>)> {
        let length = context.len();
        if length == 0 {
            return Err(Error::InvalidInput("decode cache needs at least one slot".into()));
        }
        self.check_length(length)?;
        let positional = self.positional_bias(length, length)?;
        // padding slots wrap to the end of the position range
        let padding = length.saturating_sub(given_length);
        let positions: Vec<usize> = (0..length)
            .map(|j| (j + self.seq - padding) % self.seq)
            .collect();
        let mut x = self.embedding.forward(context, &positions, comm)?;
        let mut states = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (out, state) = layer.get_init_decode_state(&x, given_length, &positional, comm)?;
            x = out;
            states.push(state);
        }
        let last = x.map(|h| B::narrow(&h, 0, length - 1, 1))?;
        Ok((self.head.logits(&last, comm)?, DecodeCache { states }))
    }

    /// Feed one token through every layer, returning logits `(1, n_vocab)`
    /// and the advanced cache.
    pub fn decode_once(
        &self,
        token: u32,
        cache: DecodeCache<B>,
        comm: &B::Comm,
    ) -> Result<(Replicated<B::Tensor>, DecodeCache<B>)> {
        if cache.len() != self.layers.len() {
            return Err(Error::InvalidInput(format!(
                "decode cache has {} layers, model has {}",
                cache.len(),
                self.layers.len()
            )));
        }
        let positional = self.positional_bias(1, cache.length())?;
        let position = cache.tokens_decoded() % self.seq;
        let mut x = self.embedding.forward(&[token], &[position], comm)?;
        let mut states = Vec::with_capacity(self.layers.len());
        for (layer, state) in self.layers.iter().zip(cache.states) {
            let (out, state) = layer.decode_once(state, &x, &positional, comm)?;
            x = out;
            states.push(state);
        }
        Ok((self.head.logits(&x, comm)?, DecodeCache { states }))
    }

    fn positional_bias(&self, q_len: usize, k_len: usize) -> Result<AttentionBias> {
        match &self.positional {
            PositionalBias::Zero => Ok(AttentionBias::zeros(1, q_len, k_len)),
            PositionalBias::Alibi { slopes } => Ok(AttentionBias::alibi(slopes, q_len, k_len)),
            PositionalBias::Relative {
                table,
                num_buckets,
                max_distance,
            } => AttentionBias::relative(table, *num_buckets, *max_distance, q_len, k_len),
        }
    }

    fn check_length(&self, len: usize) -> Result<()> {
        if len > self.seq {
            return Err(Error::InvalidInput(format!(
                "sequence of {len} tokens exceeds the configured {}",
                self.seq
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshformer::{Architecture, CheckpointShapeMap, HostTensor, ShardTopology, WorkerGrid};
    use meshformer_cpu::{CpuBackend, CpuTensor, ThreadComm};

    use crate::init::init_params;

    fn stacks(
        config: &ModelConfig,
        seed: u64,
    ) -> WorkerGrid<(ThreadComm, TransformerStack<CpuBackend>)> {
        let shards = CheckpointShapeMap::new(config)
            .unwrap()
            .shard(&init_params(config, seed).unwrap())
            .unwrap();
        WorkerGrid::new::<CpuBackend, _>(config.topology, |ctx| {
            let stack = TransformerStack::load(config, ctx.position, &shards[ctx.position.rank])?;
            Ok((ctx.shard_comm, stack))
        })
        .unwrap()
    }

    fn values(t: &Replicated<CpuTensor>) -> Vec<f32> {
        t.get().to_f32_vec()
    }

    #[test]
    fn test_embedding_scale_and_bias() {
        let mut config = ModelConfig::new(Architecture::FairseqLm, 8, 4, 2, 1, 4);
        config.topology = ShardTopology::new(2, 1);
        let grid = WorkerGrid::new::<CpuBackend, _>(config.topology, |ctx| {
            // row r of the table is filled with r
            let (start, len) = ctx.position.shard_range(8);
            let table: Vec<f32> = (start..start + len)
                .flat_map(|row| std::iter::repeat(row as f32).take(4))
                .collect();
            let mut params = ParamSet::new();
            params.insert("embedding.table".into(), HostTensor::new(&[len, 4], table)?);
            params.insert("embedding.bias".into(), HostTensor::full(&[4], 0.5));
            let embedding =
                Embedding::<CpuBackend>::load(&WeightSource::new(&params), &config, ctx.position)?;
            Ok((ctx.shard_comm, embedding))
        })
        .unwrap();
        let outs = grid
            .run(|(comm, embedding)| {
                Ok(embedding.forward(&[1, 6, 9], &[0, 1, 2], comm)?.into_inner().to_f32_vec())
            })
            .unwrap();
        // (row + bias) * sqrt(4); id 9 is out of vocabulary
        let expected: Vec<f32> = [3.0, 13.0, 1.0]
            .iter()
            .flat_map(|&v| std::iter::repeat(v).take(4))
            .collect();
        assert_eq!(outs[0], expected);
        assert_eq!(outs[1], expected);
    }

    #[test]
    fn test_absolute_positions_separate_repeated_tokens() {
        for positional in [
            PositionalEncoding::Learned { shift: 0 },
            PositionalEncoding::Sinusoidal {
                shift: 0,
                layout: meshformer::SinusoidLayout::Interleaved,
            },
        ] {
            let mut config = ModelConfig::new(Architecture::Opt, 16, 8, 2, 1, 4);
            config.topology = ShardTopology::new(2, 1);
            config.positional = positional;
            let grid = stacks(&config, 4);
            let outs = grid
                .run(|(comm, stack)| {
                    let at = |p: usize| -> Result<Vec<f32>> {
                        let row = stack.embedding().forward(&[5], &[p], comm)?;
                        Ok(row.into_inner().to_f32_vec())
                    };
                    Ok((at(1)?, at(1)?, at(2)?, at(5)?))
                })
                .unwrap();
            let (first, again, other, wrapped) = &outs[0];
            assert_eq!(first, again);
            assert_ne!(first, other);
            // positions wrap at seq
            assert_eq!(first, wrapped);
        }
    }

    #[test]
    fn test_logits_shape_and_rank_agreement() {
        let mut config = ModelConfig::new(Architecture::NeoX, 30, 16, 4, 2, 8);
        config.n_vocab_padding = 2;
        config.topology = ShardTopology::new(2, 1);
        let grid = stacks(&config, 5);
        let outs = grid
            .run(|(comm, stack)| stack.logits(&[1, 2, 3, 4, 5], comm))
            .unwrap();
        assert_eq!(outs[0].get().shape(), &[5, 30]);
        assert_eq!(values(&outs[0]), values(&outs[1]));
    }

    #[test]
    fn test_sequence_longer_than_configured_rejected() {
        let config = ModelConfig::new(Architecture::GptJ, 16, 8, 2, 1, 4);
        let grid = stacks(&config, 0);
        let result = grid.run(|(comm, stack)| stack.logits(&[1, 2, 3, 4, 5], comm));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_context_mask_hides_later_tokens() {
        let mut config = ModelConfig::new(Architecture::GptJ, 16, 8, 2, 1, 6);
        config.positional = PositionalEncoding::None;
        let grid = stacks(&config, 2);
        let outs = grid
            .run(|(comm, stack)| Ok(values(&stack.hidden(&[1, 2, 3, 7, 8, 7], Some(3), comm)?)))
            .unwrap();
        // without positions, rows 3 and 5 hold the same token and see the
        // same three keys
        let rows: Vec<&[f32]> = outs[0].chunks(8).collect();
        for (x, y) in rows[3].iter().zip(rows[5]) {
            assert!((x - y).abs() < 1e-5);
        }
        assert_ne!(rows[3], rows[4]);
    }

    #[test]
    fn test_decode_cache_bookkeeping() {
        let config = ModelConfig::new(Architecture::NeoX, 16, 8, 2, 3, 8);
        let grid = stacks(&config, 1);
        let outs = grid
            .run(|(comm, stack)| {
                let (logits, cache) = stack.get_init_decode_state(&[0, 0, 4, 5], 2, comm)?;
                assert_eq!(logits.get().shape(), &[1, 16]);
                assert_eq!((cache.len(), cache.length(), cache.tokens_decoded()), (3, 4, 2));
                let (_, cache) = stack.decode_once(7, cache, comm)?;
                Ok((cache.length(), cache.tokens_decoded()))
            })
            .unwrap();
        assert_eq!(outs[0], (4, 3));
    }
}
