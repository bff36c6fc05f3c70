//! Meshformer: a sharded transformer layer engine.
//!
//! This crate provides the core types and traits: configuration and the
//! architecture variants, the partition plan, shard-local vs replicated
//! values and their collectives, attention-bias construction, checkpoint
//! shape maps, and the optimizer/sampler contracts. Backend-specific
//! implementations (CPU, etc.) and the model itself live in separate crates.

#[allow(clippy::missing_errors_doc, clippy::doc_markdown)]
pub mod backend;
pub mod bias;
pub mod checkpoint;
pub mod collective;
pub mod config;
pub mod dtype;
pub mod error;
pub mod optimizer;
pub mod params;
pub mod position;
pub mod rope;
pub mod sampling;
pub mod shard;
pub mod sharded;
pub mod tensor;

pub use backend::{
    ActivationOps, ArithOps, AttentionOps, Backend, EmbedOps, MatmulOps, MultiDeviceOps, NormOps,
    RopeOps, TensorFactory, TensorOps,
};
pub use bias::{AttentionBias, MASK_SENTINEL};
pub use checkpoint::{reshard, CheckpointShapeMap, CheckpointStore, MemoryCheckpoint, ParamSpec};
pub use collective::{Comm, Replicated, ShardLocal};
pub use config::{
    Activation, Architecture, ArchitectureSpec, AttentionKind, CollectivePoint, HeadKind,
    LogitScaling, ModelConfig, NormConfig, NormKind, NormPlacement, PositionalEncoding, QkvLayout,
    Residual, RotaryLayout, SinusoidLayout,
};
pub use dtype::DType;
pub use error::{Error, Result};
pub use optimizer::{apply_updates, Optimizer, Sgd};
pub use params::{HostTensor, ParamSet};
pub use sampling::{GreedySampler, NucleusSampler, SampleInfo, Sampler, SamplingOptions, StepInput};
pub use shard::{CopyUse, PartitionPlan, ShardPosition, ShardStrategy, ShardTopology, TensorRole};
pub use sharded::{WorkerContext, WorkerGrid};
pub use tensor::Tensor;
