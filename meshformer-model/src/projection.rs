//! Output projection over the vocabulary axis, and the sharded
//! cross-entropy that never materialises full-vocabulary logits.

#![allow(clippy::cast_precision_loss)]

use meshformer::{
    Comm, Error, HeadKind, ModelConfig, Replicated, Result, ShardLocal, ShardPosition, Tensor,
};

use crate::norm::Norm;
use crate::weights::WeightSource;
use crate::TransformerOps;

/// Value written into logits of padded vocabulary entries.
pub const PADDED_LOGIT: f32 = -1e9;

/// Weight of the squared log-partition penalty.
const Z_LOSS_WEIGHT: f32 = 1e-4;

/// Per-token loss of one sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenLoss {
    /// Cross-entropy per position; 0 where the target is masked.
    pub loss: Vec<f32>,
    /// Whether the target held the top logit; false where masked.
    pub correct: Vec<bool>,
    /// Whether the target is a real vocabulary entry.
    pub valid: Vec<bool>,
}

impl TokenLoss {
    /// Number of unmasked targets.
    pub fn count(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Mean loss over the unmasked targets (0 when every target is masked).
    pub fn mean(&self) -> f32 {
        self.loss.iter().sum::<f32>() / self.count().max(1) as f32
    }

    /// Loss of the final position.
    pub fn last(&self) -> f32 {
        self.loss.last().copied().unwrap_or(0.0)
    }

    /// Fraction of unmasked targets predicted correctly.
    pub fn accuracy(&self) -> f32 {
        let correct = self.correct.iter().filter(|&&c| c).count();
        correct as f32 / self.count().max(1) as f32
    }
}

pub struct ProjectionHead<B: TransformerOps> {
    norm: Option<Norm<B>>,
    /// This shard's `(d_model, d_embed / shards)` columns of the projection
    /// down to the embedding width.
    project_out: Option<B::Tensor>,
    /// `(d_embed, vocab_slice)`, the transposed embedding slice when tied.
    weight: B::Tensor,
    bias: Option<B::Tensor>,
    vocab_start: usize,
    vocab_slice: usize,
    n_vocab: usize,
}

impl<B: TransformerOps> ProjectionHead<B> {
    pub(crate) fn load(
        source: &WeightSource<'_>,
        config: &ModelConfig,
        position: ShardPosition,
        embedding_table: &B::Tensor,
    ) -> Result<Self> {
        let spec = config.spec();
        let norm = if spec.final_norm {
            Some(Norm::load(source, "head.norm", config.norm)?)
        } else {
            None
        };
        let (weight, bias) = match spec.head {
            HeadKind::Untied { .. } => (
                source.load_tensor::<B>("head.weight")?,
                source.load_optional::<B>("head.bias")?,
            ),
            HeadKind::Tied => (B::transpose_2d(embedding_table)?, None),
        };
        let (vocab_start, vocab_slice) = position.shard_range(config.padded_vocab());
        if weight.shape() != [config.embed_width(), vocab_slice] {
            return Err(Error::ShapeMismatch {
                path: "head.weight".into(),
                expected: vec![config.embed_width(), vocab_slice],
                got: weight.shape().to_vec(),
            });
        }
        Ok(Self {
            norm,
            project_out: source.load_optional::<B>("head.project_out")?,
            weight,
            bias,
            vocab_start,
            vocab_slice,
            n_vocab: config.n_vocab,
        })
    }

    /// Full logits `(seq, n_vocab)`: gather every vocabulary slice and drop
    /// the padding.
    pub fn logits(
        &self,
        x: &Replicated<B::Tensor>,
        comm: &B::Comm,
    ) -> Result<Replicated<B::Tensor>> {
        let local = self.local_logits(x, comm)?;
        let n_vocab = self.n_vocab;
        comm.all_gather(local)?
            .map(|slices| B::narrow(&B::concat(&slices, 1)?, 1, 0, n_vocab))
    }

    /// Cross-entropy of `targets` (one per row of `x`).
    ///
    /// The max, the target logit and the partition function are combined
    /// across shards; each shard only ever holds its vocabulary slice.
    /// `z_loss` scales a `1e-4 * mean(ln(Z)^2)` penalty added to every
    /// position.
    pub fn loss(
        &self,
        x: &Replicated<B::Tensor>,
        targets: &[u32],
        z_loss: f32,
        comm: &B::Comm,
    ) -> Result<TokenLoss> {
        let local = self.local_logits(x, comm)?;
        let seq = local.get().shape()[0];
        if targets.len() != seq {
            return Err(Error::InvalidInput(format!(
                "{} targets for {seq} positions",
                targets.len()
            )));
        }
        let mut logits = B::to_f32_vec(local.get())?;
        let width = self.vocab_slice;
        for row in logits.chunks_exact_mut(width) {
            for (j, logit) in row.iter_mut().enumerate() {
                if self.vocab_start + j >= self.n_vocab {
                    *logit = PADDED_LOGIT;
                }
            }
        }

        let local_max: Vec<f32> = logits
            .chunks_exact(width)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .filter(|(j, _)| self.vocab_start + j < self.n_vocab)
                    .map(|(_, &l)| l)
                    .fold(f32::NEG_INFINITY, f32::max)
            })
            .collect();
        let maxima = comm.all_gather(ShardLocal::new(B::from_f32(&[seq], &local_max)?))?;
        let mut global_max = vec![f32::NEG_INFINITY; seq];
        for shard in maxima.get() {
            for (g, m) in global_max.iter_mut().zip(B::to_f32_vec(shard)?) {
                *g = g.max(m);
            }
        }

        // rows: [target logit | sum of exponentials]
        let mut partial = vec![0.0_f32; 2 * seq];
        for (i, row) in logits.chunks_exact(width).enumerate() {
            let shifted = row.iter().map(|l| l - global_max[i]);
            partial[seq + i] = shifted.clone().map(f32::exp).sum();
            let target = targets[i] as usize;
            if (self.vocab_start..self.vocab_start + width).contains(&target) {
                partial[i] = row[target - self.vocab_start] - global_max[i];
            }
        }
        let reduced = comm.all_reduce_sum(ShardLocal::new(B::from_f32(&[2, seq], &partial)?))?;
        let reduced = B::to_f32_vec(reduced.get())?;
        let (target_logit, sum_exp) = reduced.split_at(seq);

        let valid: Vec<bool> = targets.iter().map(|&t| (t as usize) < self.n_vocab).collect();
        let count = valid.iter().filter(|&&v| v).count();
        let log_z: Vec<f32> = sum_exp.iter().map(|s| s.ln()).collect();
        let penalty = if count == 0 {
            0.0
        } else {
            Z_LOSS_WEIGHT * log_z.iter().map(|z| z * z).sum::<f32>() * z_loss / count as f32
        };

        let mut loss = Vec::with_capacity(seq);
        let mut correct = Vec::with_capacity(seq);
        for i in 0..seq {
            if valid[i] {
                loss.push(log_z[i] - target_logit[i] + penalty);
                correct.push(target_logit[i] == 0.0);
            } else {
                loss.push(0.0);
                correct.push(false);
            }
        }
        Ok(TokenLoss {
            loss,
            correct,
            valid,
        })
    }

    /// This shard's `(seq, vocab_slice)` logits.
    fn local_logits(
        &self,
        x: &Replicated<B::Tensor>,
        comm: &B::Comm,
    ) -> Result<ShardLocal<B::Tensor>> {
        let input = match &self.norm {
            Some(norm) => norm.forward(x, comm)?,
            None => x.clone().localize(),
        };
        let project_out = match &self.project_out {
            Some(columns) => Some(
                comm.all_gather(ShardLocal::new(columns.clone()))?
                    .map(|columns| B::concat(&columns, 1))?,
            ),
            None => None,
        };
        input.map(|h| {
            let h = match &project_out {
                Some(project_out) => B::matmul(&h, project_out.get())?,
                None => h,
            };
            let out = B::matmul(&h, &self.weight)?;
            match &self.bias {
                Some(bias) => B::add_bias(&out, bias),
                None => Ok(out),
            }
        })
    }
}
