//! Results must not depend on how the model is split.

mod common;

use common::{assert_close, on_rank0, stacks_from, tiny, with_shards};
use meshformer::{
    Architecture, CheckpointShapeMap, CheckpointStore, CollectivePoint, MemoryCheckpoint,
    ModelConfig, NormConfig, NormKind, PositionalEncoding, Sgd, ShardTopology, SinusoidLayout,
};
use meshformer_cpu::{CpuBackend, SafeTensorsCheckpoint};
use meshformer_model::{init_params, Transformer};

const TOKENS: [u32; 6] = [5, 9, 2, 30, 7, 1];

fn logits(config: &ModelConfig, seed: u64) -> Vec<f32> {
    let params = init_params(config, seed).unwrap();
    let grid = stacks_from(config, &params);
    let per_rank = grid
        .run(|(comm, stack)| Ok(stack.logits(&TOKENS, comm)?.into_inner().to_f32_vec()))
        .unwrap();
    // every rank holds the same replicated logits
    for other in &per_rank[1..] {
        assert_eq!(other, &per_rank[0]);
    }
    per_rank.into_iter().next().unwrap()
}

#[test]
fn test_shard_count_equivalence_every_architecture() {
    common::init_tracing();
    for architecture in Architecture::ALL {
        let mut config = tiny(architecture, 4);
        config.n_vocab = 30;
        config.n_vocab_padding = 2;
        if architecture == Architecture::Bloom {
            config.positional = PositionalEncoding::Alibi;
        }
        let single = logits(&config, 21);
        for shards in [2, 4] {
            let split = logits(&with_shards(config.clone(), shards), 21);
            assert_close(&split, &single, 1e-4);
        }
    }
}

#[test]
fn test_early_and_late_collectives_agree() {
    for architecture in [Architecture::NeoX, Architecture::GptJ, Architecture::Opt] {
        let mut late = with_shards(tiny(architecture, 2), 2);
        late.collective = CollectivePoint::Late;
        let mut early = late.clone();
        early.collective = CollectivePoint::Early;
        assert_close(&logits(&early, 4), &logits(&late, 4), 1e-4);
    }
}

#[test]
fn test_gated_feedforward_shard_equivalence() {
    let mut config = tiny(Architecture::NeoX, 4);
    config.glu = true;
    config.activation = meshformer::Activation::Silu;
    let single = logits(&config, 8);
    assert_close(&logits(&with_shards(config, 4), 8), &single, 1e-4);
}

#[test]
fn test_rms_norm_shard_equivalence() {
    let mut config = tiny(Architecture::Opt, 2);
    config.norm = NormConfig {
        kind: NormKind::RmsNorm,
        offset: false,
    };
    let single = logits(&config, 2);
    assert_close(&logits(&with_shards(config, 2), 2), &single, 1e-4);
}

#[test]
fn test_reshard_through_memory_checkpoint() {
    let config = tiny(Architecture::NeoX, 4);
    let model = Transformer::<CpuBackend, _>::new(config.clone(), Sgd::new(0.1), 13).unwrap();
    let mut store = MemoryCheckpoint::new();
    model.save(&mut store).unwrap();
    assert_eq!(store.shard_count(), 1);

    let wide = with_shards(config, 2);
    let resharded = Transformer::<CpuBackend, _>::from_checkpoint(wide, Sgd::new(0.1), &store).unwrap();
    assert_close(
        &resharded.logits(&TOKENS).unwrap(),
        &model.logits(&TOKENS).unwrap(),
        1e-4,
    );
}

#[test]
fn test_reshard_through_safetensors() {
    let dir = tempfile::tempdir().unwrap();
    let config = with_shards(tiny(Architecture::GptJ, 2), 2);
    let model = Transformer::<CpuBackend, _>::new(config.clone(), Sgd::new(0.1), 3).unwrap();
    let mut store = SafeTensorsCheckpoint::new(dir.path());
    model.save(&mut store).unwrap();
    assert_eq!(store.stored_shard_count(), 2);

    let mut narrow = config;
    narrow.topology = ShardTopology::single();
    let reloaded =
        Transformer::<CpuBackend, _>::from_checkpoint(narrow, Sgd::new(0.1), &store).unwrap();
    assert_close(
        &reloaded.logits(&TOKENS).unwrap(),
        &model.logits(&TOKENS).unwrap(),
        1e-4,
    );
}

#[test]
fn test_checkpoint_for_other_config_is_rejected() {
    let config = tiny(Architecture::Opt, 2);
    let model = Transformer::<CpuBackend, _>::new(config.clone(), Sgd::new(0.1), 0).unwrap();
    let mut store = MemoryCheckpoint::new();
    model.save(&mut store).unwrap();

    let mut wider = config;
    wider.d_model = 32;
    wider.d_ff = 128;
    let result = Transformer::<CpuBackend, _>::from_checkpoint(wider, Sgd::new(0.1), &store);
    assert!(matches!(
        result,
        Err(meshformer::Error::ShapeMismatch { .. } | meshformer::Error::MissingParameter(_))
    ));
}

#[test]
fn test_rank_zero_only_result_matches_stack() {
    let config = with_shards(tiny(Architecture::Bloom, 2), 2);
    let params = init_params(&config, 1).unwrap();
    let grid = stacks_from(&config, &params);
    let from_stack = on_rank0(&grid, |comm, stack| {
        Ok(stack.logits(&TOKENS, comm)?.into_inner().to_f32_vec())
    });
    assert_eq!(from_stack, logits(&config, 1));
}

#[test]
fn test_absolute_positions_shard_equivalence() {
    for positional in [
        PositionalEncoding::Learned { shift: 1 },
        PositionalEncoding::Sinusoidal {
            shift: 2,
            layout: SinusoidLayout::Concatenated,
        },
    ] {
        let mut config = tiny(Architecture::Opt, 4);
        config.positional = positional;
        let single = logits(&config, 12);
        for shards in [2, 4] {
            assert_close(&logits(&with_shards(config.clone(), shards), 12), &single, 1e-4);
        }
    }
}

#[test]
fn test_embedding_width_projection_shard_equivalence() {
    // untied head with embedding bias, tied head, scaled embedding
    for architecture in [Architecture::GptJ, Architecture::Opt, Architecture::FairseqLm] {
        let mut config = tiny(architecture, 4);
        config.d_embed = Some(8);
        let single = logits(&config, 17);
        for shards in [2, 4] {
            assert_close(&logits(&with_shards(config.clone(), shards), 17), &single, 1e-4);
        }
    }
}

/// Checkpoint of `config` whose norm scales drift apart per shard: shard
/// `r` stores its copies multiplied by `1 + r / 2`.
#[allow(clippy::cast_precision_loss)]
fn drifted_checkpoint(config: &ModelConfig, seed: u64) -> MemoryCheckpoint {
    let map = CheckpointShapeMap::new(config).unwrap();
    let mut shards = map.shard(&init_params(config, seed).unwrap()).unwrap();
    for (rank, shard) in shards.iter_mut().enumerate() {
        for (path, tensor) in shard.iter_mut() {
            if path.ends_with(".scale") {
                for v in tensor.data_mut() {
                    *v *= 1.0 + rank as f32 / 2.0;
                }
            }
        }
    }
    let mut store = MemoryCheckpoint::new();
    store.write(&shards, &map).unwrap();
    store
}

fn loaded_logits(config: ModelConfig, store: &MemoryCheckpoint) -> Vec<f32> {
    Transformer::<CpuBackend, _>::from_checkpoint(config, Sgd::new(0.1), store)
        .unwrap()
        .logits(&TOKENS)
        .unwrap()
}

fn assert_reshard_keeps_logits(kind: NormKind, from: usize, to: usize) {
    let mut config = tiny(Architecture::GptJ, 4);
    config.norm = NormConfig { kind, offset: true };
    let store = drifted_checkpoint(&with_shards(config.clone(), from), 6);
    let written = loaded_logits(with_shards(config.clone(), from), &store);
    let resharded = loaded_logits(with_shards(config, to), &store);
    assert_close(&resharded, &written, 1e-4);
}

#[test]
fn test_reshard_keeps_double_layernorm_copies() {
    assert_reshard_keeps_logits(NormKind::DoubleLayerNorm, 2, 4);
    assert_reshard_keeps_logits(NormKind::DoubleLayerNorm, 4, 2);
}

#[test]
fn test_reshard_keeps_local_layernorm_copies() {
    assert_reshard_keeps_logits(NormKind::LocalLayerNorm, 1, 2);
    assert_reshard_keeps_logits(NormKind::LocalLayerNorm, 2, 4);
}

#[test]
fn test_reshard_keeps_averaged_and_leader_copies() {
    assert_reshard_keeps_logits(NormKind::RmsNorm, 4, 2);
    assert_reshard_keeps_logits(NormKind::RmsNorm, 2, 1);
    assert_reshard_keeps_logits(NormKind::LayerNorm, 4, 2);
    assert_reshard_keeps_logits(NormKind::LayerNorm, 1, 4);
}
