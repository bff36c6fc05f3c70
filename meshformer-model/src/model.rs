//! The training/inference engine: one [`TransformerStack`] per worker of a
//! [`WorkerGrid`], with batches split across replicas.

#![allow(clippy::cast_precision_loss)]

use std::ops::Range;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use meshformer::{
    apply_updates, CheckpointShapeMap, CheckpointStore, Comm, Error, HostTensor, ModelConfig,
    MultiDeviceOps, Optimizer, ParamSet, Result, Sampler, SamplingOptions, ShardLocal,
    ShardStrategy, StepInput, WorkerContext, WorkerGrid,
};

use crate::init::{init_params, path_hash};
use crate::projection::TokenLoss;
use crate::stack::TransformerStack;
use crate::weights::reduce_scalar;
use crate::TransformerOps;

/// Default half-width of the parameter perturbation used to estimate
/// gradients.
pub const DEFAULT_PERTURBATION: f32 = 1e-2;

/// Rows of token ids with their next-token targets.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub tokens: Vec<Vec<u32>>,
    pub targets: Vec<Vec<u32>>,
    /// Per-row count of real tokens; later keys are masked.
    pub ctx_lengths: Option<Vec<usize>>,
}

impl Batch {
    fn validate(&self) -> Result<()> {
        if self.tokens.len() != self.targets.len() {
            return Err(Error::InvalidInput(format!(
                "{} token rows for {} target rows",
                self.tokens.len(),
                self.targets.len()
            )));
        }
        if let Some(ctx) = &self.ctx_lengths {
            if ctx.len() != self.tokens.len() {
                return Err(Error::InvalidInput(format!(
                    "{} context lengths for {} rows",
                    ctx.len(),
                    self.tokens.len()
                )));
            }
        }
        Ok(())
    }

    fn ctx_length(&self, row: usize) -> Option<usize> {
        self.ctx_lengths.as_ref().map(|ctx| ctx[row])
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainMetrics {
    /// Mean loss of the batch before the update.
    pub loss: f32,
    pub last_loss: f32,
    /// Norm of the gradient estimate.
    pub grad_norm: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalMetrics {
    pub loss: f32,
    /// Mean loss of each row's final position.
    pub last_loss: f32,
    pub accuracy: f32,
    /// Per-row, per-position loss.
    pub token_loss: Vec<Vec<f32>>,
}

struct Worker<B: TransformerOps + MultiDeviceOps> {
    context: WorkerContext<B::Comm>,
    params: ParamSet,
    stack: TransformerStack<B>,
}

/// A sharded transformer running on `shard_count × replica_count` workers.
///
/// Every method drives all workers in lock-step; replicas split the batch
/// rows between them and shards split every layer.
pub struct Transformer<B: TransformerOps + MultiDeviceOps, O: Optimizer> {
    config: ModelConfig,
    shape_map: CheckpointShapeMap,
    optimizer: O,
    grid: WorkerGrid<Worker<B>>,
    opt_states: Vec<Option<O::State>>,
    step: u64,
    seed: u64,
    perturbation: f32,
    z_loss: f32,
}

impl<B: TransformerOps + MultiDeviceOps, O: Optimizer> Transformer<B, O> {
    /// Build a freshly initialised model.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] for an invalid config.
    pub fn new(config: ModelConfig, optimizer: O, seed: u64) -> Result<Self> {
        config.validate()?;
        let shape_map = CheckpointShapeMap::new(&config)?;
        let shards = shape_map.shard(&init_params(&config, seed)?)?;
        Self::from_shards(config, shape_map, optimizer, shards, seed)
    }

    /// Build a model from a checkpoint written under any shard count.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] or [`Error::MissingParameter`] when
    /// the checkpoint does not match `config`; nothing is loaded.
    pub fn from_checkpoint(
        config: ModelConfig,
        optimizer: O,
        store: &impl CheckpointStore,
    ) -> Result<Self> {
        config.validate()?;
        let shape_map = CheckpointShapeMap::new(&config)?;
        let shards = store.read(&shape_map)?;
        Self::from_shards(config, shape_map, optimizer, shards, 0)
    }

    fn from_shards(
        config: ModelConfig,
        shape_map: CheckpointShapeMap,
        optimizer: O,
        shards: Vec<ParamSet>,
        seed: u64,
    ) -> Result<Self> {
        for shard in &shards {
            shape_map.validate_shard(shard)?;
        }
        let grid = WorkerGrid::new::<B, _>(config.topology, |context| {
            let params = shards
                .get(context.position.rank)
                .cloned()
                .ok_or_else(|| missing_shard(context.position.rank))?;
            let stack = TransformerStack::load(&config, context.position, &params)?;
            Ok(Worker {
                context,
                params,
                stack,
            })
        })?;
        let opt_states = grid
            .workers()
            .iter()
            .map(|worker| optimizer.init(&worker.params).map(Some))
            .collect::<Result<Vec<_>>>()?;
        info!(
            architecture = config.architecture.name(),
            layers = config.layers,
            d_model = config.d_model,
            shard_count = config.topology.shard_count,
            replica_count = config.topology.replica_count,
            "Built transformer"
        );
        Ok(Self {
            config,
            shape_map,
            optimizer,
            grid,
            opt_states,
            step: 0,
            seed,
            perturbation: DEFAULT_PERTURBATION,
            z_loss: 0.0,
        })
    }

    /// Half-width of the gradient-estimate perturbation.
    #[must_use]
    pub fn with_perturbation(mut self, perturbation: f32) -> Self {
        self.perturbation = perturbation;
        self
    }

    /// Weight of the log-partition penalty in the training loss.
    #[must_use]
    pub fn with_z_loss(mut self, z_loss: f32) -> Self {
        self.z_loss = z_loss;
        self
    }

    pub const fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub const fn shape_map(&self) -> &CheckpointShapeMap {
        &self.shape_map
    }

    /// Training steps taken so far.
    pub const fn step(&self) -> u64 {
        self.step
    }

    /// One optimizer step on `batch`.
    ///
    /// The gradient estimate comes from two extra passes at `params ± c·Δ`
    /// with a seeded Rademacher `Δ`: `g = (L+ - L-) / 2c · Δ`. `Δ` is drawn
    /// over logical tensors, so it is equal on every replica and under every
    /// shard count; averaging the scalar factor over the batch axis averages
    /// the estimate.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] if the rows do not split evenly
    /// across replicas.
    pub fn train(&mut self, batch: &Batch) -> Result<TrainMetrics> {
        batch.validate()?;
        let replicas = self.config.topology.replica_count;
        if batch.tokens.is_empty() || batch.tokens.len() % replicas != 0 {
            return Err(Error::InvalidInput(format!(
                "{} rows do not split across {replicas} replicas",
                batch.tokens.len()
            )));
        }
        let per_replica = batch.tokens.len() / replicas;
        let config = &self.config;
        let shape_map = &self.shape_map;
        let optimizer = &self.optimizer;
        let (seed, step, c, z_loss) = (self.seed, self.step, self.perturbation, self.z_loss);

        let results = self.grid.run_mut(&mut self.opt_states, |worker, state| {
            let first = worker.context.replica * per_replica;
            let rows = first..first + per_replica;
            let comm = &worker.context.shard_comm;
            let (loss, last_loss) = batch_loss(&worker.stack, batch, rows.clone(), z_loss, comm)?;

            let position = worker.context.position;
            let mut delta = ParamSet::new();
            for path in worker.params.keys() {
                let spec = shape_map
                    .get(path)
                    .ok_or_else(|| Error::MissingParameter(path.clone()))?;
                let full = rademacher(&spec.logical_shape, seed, step, path)?;
                delta.insert(path.clone(), spec.strategy.slice(&full, position)?);
            }

            let plus = perturbed(&worker.params, &delta, c)?;
            let plus = TransformerStack::<B>::load(config, worker.context.position, &plus)?;
            let (loss_plus, _) = batch_loss(&plus, batch, rows.clone(), z_loss, comm)?;
            drop(plus);
            let minus = perturbed(&worker.params, &delta, -c)?;
            let minus = TransformerStack::<B>::load(config, worker.context.position, &minus)?;
            let (loss_minus, _) = batch_loss(&minus, batch, rows, z_loss, comm)?;
            drop(minus);

            let local = [(loss_plus - loss_minus) / (2.0 * c), loss, last_loss];
            let averaged = worker
                .context
                .batch_comm
                .average(ShardLocal::new(B::from_f32(&[3], &local)?))?;
            let [factor, loss, last_loss] = <[f32; 3]>::try_from(B::to_f32_vec(averaged.get())?)
                .map_err(|_| Error::Collective("batch average lost values".into()))?;

            let mut grads = delta;
            let mut split_sq = 0.0_f32;
            let mut replicated_sq = 0.0_f32;
            for (path, grad) in &mut grads {
                for g in grad.data_mut() {
                    *g *= factor;
                }
                let sq: f32 = grad.data().iter().map(|g| g * g).sum();
                match shape_map.get(path).map(|spec| spec.strategy) {
                    Some(ShardStrategy::Split { .. }) => split_sq += sq,
                    _ => replicated_sq += sq,
                }
            }
            let own = split_sq + if position.rank == 0 { replicated_sq } else { 0.0 };
            let grad_norm = reduce_scalar::<B>(comm, own)?.sqrt();

            let current = state
                .take()
                .ok_or_else(|| Error::InvalidInput("optimizer state lost".into()))?;
            let (updates, next) = optimizer.update(&grads, current, &worker.params)?;
            *state = Some(next);
            apply_updates(&mut worker.params, &updates)?;
            worker.stack = TransformerStack::load(config, worker.context.position, &worker.params)?;
            Ok(TrainMetrics {
                loss,
                last_loss,
                grad_norm,
            })
        })?;
        self.step += 1;

        let metrics = results
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidInput("no workers".into()))?;
        debug!(
            step = self.step,
            loss = metrics.loss,
            grad_norm = metrics.grad_norm,
            "Train step"
        );
        Ok(metrics)
    }

    /// Loss and accuracy of `batch` without updating.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] for malformed batches.
    pub fn eval(&self, batch: &Batch) -> Result<EvalMetrics> {
        batch.validate()?;
        if batch.tokens.is_empty() {
            return Err(Error::InvalidInput("empty batch".into()));
        }
        let replicas = self.config.topology.replica_count;
        let results = self.grid.run(|worker| {
            let rows = replica_rows(batch.tokens.len(), replicas, worker.context.replica);
            rows.map(|row| {
                worker.stack.loss(
                    &batch.tokens[row],
                    &batch.targets[row],
                    batch.ctx_length(row),
                    0.0,
                    &worker.context.shard_comm,
                )
            })
            .collect::<Result<Vec<TokenLoss>>>()
        })?;
        let losses: Vec<TokenLoss> = self.grid.leaders(results).into_iter().flatten().collect();

        let rows = losses.len() as f32;
        let valid: usize = losses.iter().map(TokenLoss::count).sum();
        let correct: usize = losses
            .iter()
            .map(|l| l.correct.iter().filter(|&&c| c).count())
            .sum();
        let metrics = EvalMetrics {
            loss: losses.iter().map(TokenLoss::mean).sum::<f32>() / rows,
            last_loss: losses.iter().map(TokenLoss::last).sum::<f32>() / rows,
            accuracy: correct as f32 / valid.max(1) as f32,
            token_loss: losses.into_iter().map(|l| l.loss).collect(),
        };
        debug!(loss = metrics.loss, accuracy = metrics.accuracy, "Eval");
        Ok(metrics)
    }

    /// Logits `(seq, n_vocab)` of one sequence, row-major.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] if `tokens` exceeds `seq`.
    pub fn logits(&self, tokens: &[u32]) -> Result<Vec<f32>> {
        let results = self.grid.run(|worker| {
            let logits = worker.stack.logits(tokens, &worker.context.shard_comm)?;
            B::to_f32_vec(logits.get())
        })?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidInput("no workers".into()))
    }

    /// Continue each right-aligned context by `length` tokens.
    ///
    /// Row `i` has `ctx_lengths[i]` real tokens at the end of
    /// `contexts[i]`. The context minus its last token primes the decode
    /// cache; the last token feeds the first decode step. Step `t` samples
    /// with seed `options.seed + t`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] for contexts shorter than two
    /// tokens, longer than `seq`, or with an out-of-range context length.
    pub fn generate<S: Sampler>(
        &self,
        contexts: &[Vec<u32>],
        ctx_lengths: &[usize],
        length: usize,
        sampler: &S,
        options: &SamplingOptions,
    ) -> Result<Vec<Vec<u32>>> {
        if contexts.len() != ctx_lengths.len() {
            return Err(Error::InvalidInput(format!(
                "{} contexts with {} context lengths",
                contexts.len(),
                ctx_lengths.len()
            )));
        }
        for (context, &ctx_length) in contexts.iter().zip(ctx_lengths) {
            if context.len() < 2 || context.len() > self.config.seq {
                return Err(Error::InvalidInput(format!(
                    "context of {} tokens, need 2..={}",
                    context.len(),
                    self.config.seq
                )));
            }
            if ctx_length == 0 || ctx_length > context.len() {
                return Err(Error::InvalidInput(format!(
                    "context length {ctx_length} for a context of {} tokens",
                    context.len()
                )));
            }
        }
        info!(rows = contexts.len(), length, "Generating");

        let replicas = self.config.topology.replica_count;
        let results = self.grid.run(|worker| {
            let comm = &worker.context.shard_comm;
            replica_rows(contexts.len(), replicas, worker.context.replica)
                .map(|row| {
                    let context = &contexts[row];
                    let (prefix, last) = context.split_at(context.len() - 1);
                    let (_, mut cache) =
                        worker
                            .stack
                            .get_init_decode_state(prefix, ctx_lengths[row] - 1, comm)?;
                    let mut token = last[0];
                    let mut generated = Vec::with_capacity(length);
                    for step in 0..length {
                        let (logits, next_cache) = worker.stack.decode_once(token, cache, comm)?;
                        cache = next_cache;
                        let logits = B::to_f32_vec(logits.get())?;
                        let input = StepInput {
                            step,
                            token,
                            generated: &generated,
                        };
                        let (next, _) = sampler.sample(
                            options.seed.wrapping_add(step as u64),
                            &logits,
                            input,
                            options,
                        )?;
                        generated.push(next);
                        token = next;
                    }
                    Ok(generated)
                })
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(self.grid.leaders(results).into_iter().flatten().collect())
    }

    /// Write every shard's parameters.
    ///
    /// # Errors
    /// Propagates store errors.
    pub fn save(&self, store: &mut impl CheckpointStore) -> Result<()> {
        let shards: Vec<ParamSet> = self
            .grid
            .workers()
            .iter()
            .take(self.config.topology.shard_count)
            .map(|worker| worker.params.clone())
            .collect();
        store.write(&shards, &self.shape_map)?;
        info!(step = self.step, "Saved transformer");
        Ok(())
    }

    /// Replace every worker's parameters from `store` and reset the
    /// optimizer state.
    ///
    /// # Errors
    /// Returns an error if the checkpoint does not match the config; the
    /// model is left unchanged in that case.
    pub fn load(&mut self, store: &impl CheckpointStore) -> Result<()> {
        let shards = store.read(&self.shape_map)?;
        for shard in &shards {
            self.shape_map.validate_shard(shard)?;
        }
        let config = &self.config;
        let optimizer = &self.optimizer;
        let stacks = self.grid.run(|worker| {
            let params = shards
                .get(worker.context.position.rank)
                .cloned()
                .ok_or_else(|| missing_shard(worker.context.position.rank))?;
            let stack = TransformerStack::load(config, worker.context.position, &params)?;
            Ok((params, stack))
        })?;
        let mut stacks: Vec<Option<(ParamSet, TransformerStack<B>)>> =
            stacks.into_iter().map(Some).collect();
        self.grid.run_mut(&mut stacks, |worker, loaded| {
            let (params, stack) = loaded
                .take()
                .ok_or_else(|| Error::InvalidInput("worker loaded twice".into()))?;
            worker.params = params;
            worker.stack = stack;
            Ok(())
        })?;
        self.opt_states = self
            .grid
            .workers()
            .iter()
            .map(|worker| optimizer.init(&worker.params).map(Some))
            .collect::<Result<Vec<_>>>()?;
        info!(step = self.step, "Loaded transformer");
        Ok(())
    }
}

fn missing_shard(rank: usize) -> Error {
    Error::MissingParameter(format!("parameters of shard {rank}"))
}

/// Rows handled by `replica` when `rows` are chunked across `replicas`.
fn replica_rows(rows: usize, replicas: usize, replica: usize) -> Range<usize> {
    let chunk = rows.div_ceil(replicas);
    let start = (replica * chunk).min(rows);
    start..(start + chunk).min(rows)
}

/// Mean per-row loss and mean final-position loss over `rows`.
fn batch_loss<B: TransformerOps>(
    stack: &TransformerStack<B>,
    batch: &Batch,
    rows: Range<usize>,
    z_loss: f32,
    comm: &B::Comm,
) -> Result<(f32, f32)> {
    let count = rows.len().max(1) as f32;
    let mut loss = 0.0;
    let mut last = 0.0;
    for row in rows {
        let token_loss = stack.loss(
            &batch.tokens[row],
            &batch.targets[row],
            batch.ctx_length(row),
            z_loss,
            comm,
        )?;
        loss += token_loss.mean();
        last += token_loss.last();
    }
    Ok((loss / count, last / count))
}

/// `params + scale * delta`.
fn perturbed(params: &ParamSet, delta: &ParamSet, scale: f32) -> Result<ParamSet> {
    params
        .iter()
        .map(|(path, param)| {
            let d = delta
                .get(path)
                .ok_or_else(|| Error::MissingParameter(format!("perturbation for {path}")))?;
            let data = param
                .data()
                .iter()
                .zip(d.data())
                .map(|(p, d)| p + scale * d)
                .collect();
            Ok((path.clone(), HostTensor::new(param.shape(), data)?))
        })
        .collect()
}

/// Seeded ±1 entries over a logical tensor, so every shard count slices
/// the same perturbation.
fn rademacher(shape: &[usize], seed: u64, step: u64, path: &str) -> Result<HostTensor> {
    let stream = seed ^ path_hash(path) ^ step.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    let mut rng = StdRng::seed_from_u64(stream);
    let n: usize = shape.iter().product();
    let data = (0..n)
        .map(|_| if rng.gen::<bool>() { 1.0 } else { -1.0 })
        .collect();
    HostTensor::new(shape, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_rows_cover_every_row_once() {
        let ranges: Vec<_> = (0..3).map(|r| replica_rows(7, 3, r)).collect();
        assert_eq!(ranges, vec![0..3, 3..6, 6..7]);
        // more replicas than rows leaves the tail empty
        assert_eq!(replica_rows(1, 2, 1), 1..1);
    }

    #[test]
    fn test_rademacher_is_seeded() {
        let a = rademacher(&[64], 1, 0, "w").unwrap();
        assert_eq!(a, rademacher(&[64], 1, 0, "w").unwrap());
        assert_ne!(a, rademacher(&[64], 1, 0, "v").unwrap());
        assert_ne!(a, rademacher(&[64], 1, 1, "w").unwrap());
        assert!(a.data().iter().all(|v| v.abs() == 1.0));
    }

    #[test]
    fn test_perturbed_moves_every_entry() {
        let mut params = ParamSet::new();
        params.insert("w".into(), HostTensor::new(&[2], vec![1.0, 2.0]).unwrap());
        let mut delta = ParamSet::new();
        delta.insert("w".into(), HostTensor::new(&[2], vec![1.0, -1.0]).unwrap());
        let out = perturbed(&params, &delta, 0.5).unwrap();
        assert_eq!(out["w"].data(), &[1.5, 1.5]);
    }

    #[test]
    fn test_batch_validation() {
        let batch = Batch {
            tokens: vec![vec![1, 2]],
            targets: vec![],
            ctx_lengths: None,
        };
        assert!(matches!(batch.validate(), Err(Error::InvalidInput(_))));
    }
}
