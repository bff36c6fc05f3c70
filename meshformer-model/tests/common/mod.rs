//! Helpers shared by the integration tests.

#![allow(dead_code)]

use meshformer::{CheckpointShapeMap, ModelConfig, ParamSet, Result, ShardTopology, WorkerGrid};
use meshformer_cpu::{CpuBackend, ThreadComm};
use meshformer_model::{init_params, TransformerStack};

pub type Stacks = WorkerGrid<(ThreadComm, TransformerStack<CpuBackend>)>;

/// Install a test-writer subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small config with a vocabulary of 32 and width 16.
pub fn tiny(architecture: meshformer::Architecture, n_heads: usize) -> ModelConfig {
    ModelConfig::new(architecture, 32, 16, n_heads, 2, 8)
}

pub fn with_shards(mut config: ModelConfig, shards: usize) -> ModelConfig {
    config.topology = ShardTopology::new(shards, 1);
    config
}

/// One stack per shard, loaded from the sharded logical `params`.
pub fn stacks_from(config: &ModelConfig, params: &ParamSet) -> Stacks {
    config.validate().unwrap();
    let shards = CheckpointShapeMap::new(config).unwrap().shard(params).unwrap();
    WorkerGrid::new::<CpuBackend, _>(config.topology, |ctx| {
        let stack = TransformerStack::load(config, ctx.position, &shards[ctx.position.rank])?;
        Ok((ctx.shard_comm, stack))
    })
    .unwrap()
}

pub fn stacks(config: &ModelConfig, seed: u64) -> Stacks {
    stacks_from(config, &init_params(config, seed).unwrap())
}

/// Run `f` on every shard and return rank 0's result.
pub fn on_rank0<R: Send>(
    grid: &Stacks,
    f: impl Fn(&ThreadComm, &TransformerStack<CpuBackend>) -> Result<R> + Sync,
) -> R {
    grid.run(|(comm, stack)| f(comm, stack))
        .unwrap()
        .into_iter()
        .next()
        .unwrap()
}

pub fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "index {i}: {x} vs {y}");
    }
}
