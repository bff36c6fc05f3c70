//! Parameter initialisation.
//!
//! Parameters are initialised as logical (unsharded) tensors and sliced per
//! shard afterwards, so the same seed gives the same model under every
//! shard count. Each tensor draws from its own `StdRng`, seeded from the
//! model seed and the parameter path.

#![allow(clippy::cast_precision_loss)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use meshformer::{
    CheckpointShapeMap, HostTensor, ModelConfig, NormKind, ParamSet, PartitionPlan, Result,
    TensorRole,
};

/// Std-dev of the relative-position bias table and learned positions.
const POSITION_TABLE_STDDEV: f32 = 0.02;

/// Initialise every parameter `config` implies.
///
/// Weights are uniform with the variance of a `1 / sqrt(fan_in)` normal;
/// output projections of each layer are scaled by `2 / layers`. Biases and
/// offsets start at zero, layer-norm scales at one and RMS/scale-norm
/// scales at `sqrt(d_model)`.
///
/// # Errors
/// Returns [`meshformer::Error::Configuration`] for an invalid config.
pub fn init_params(config: &ModelConfig, seed: u64) -> Result<ParamSet> {
    let map = CheckpointShapeMap::new(config)?;
    let plan = PartitionPlan::new(config)?;
    let layer_scale = 2.0 / config.layers as f32;
    let d_model = config.d_model as f32;

    let mut params = ParamSet::new();
    for (path, spec) in map.iter() {
        let shape = spec.logical_shape.as_slice();
        let tensor = match plan.role(path)? {
            TensorRole::Norm if path.ends_with(".offset") => HostTensor::zeros(shape),
            TensorRole::Norm => match config.norm.kind {
                NormKind::RmsNorm | NormKind::ScaleNorm => HostTensor::full(shape, d_model.sqrt()),
                _ => HostTensor::full(shape, 1.0),
            },
            TensorRole::RowBias | TensorRole::ColumnBias { .. } | TensorRole::VocabBias => {
                HostTensor::zeros(shape)
            }
            TensorRole::RelativeTable | TensorRole::PositionTable => {
                uniform(shape, POSITION_TABLE_STDDEV, seed, path)?
            }
            TensorRole::VocabTable => {
                uniform(shape, 1.0 / (shape[0] as f32).sqrt(), seed, path)?
            }
            TensorRole::RowWeight => uniform(shape, layer_scale / d_model.sqrt(), seed, path)?,
            TensorRole::ColumnWeight { .. }
            | TensorRole::VocabProjection
            | TensorRole::EmbedProjection
            | TensorRole::HeadProjection => {
                uniform(shape, 1.0 / (shape[0] as f32).sqrt(), seed, path)?
            }
        };
        params.insert(path.clone(), tensor);
    }
    debug!(params = params.len(), seed, "Initialised parameters");
    Ok(params)
}

/// Uniform values with standard deviation `stddev`.
fn uniform(shape: &[usize], stddev: f32, seed: u64, path: &str) -> Result<HostTensor> {
    let bound = stddev * 3.0_f32.sqrt();
    let mut rng = StdRng::seed_from_u64(seed ^ path_hash(path));
    let n: usize = shape.iter().product();
    let data = (0..n).map(|_| rng.gen_range(-bound..=bound)).collect();
    HostTensor::new(shape, data)
}

/// FNV-1a over the path bytes.
pub(crate) fn path_hash(path: &str) -> u64 {
    path.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}
