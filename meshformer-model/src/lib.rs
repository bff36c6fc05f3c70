//! Sharded causal transformer for Meshformer.
//!
//! Every component is generic over `B: TransformerOps` and holds one
//! worker's slice of the weights. Collectives go through the worker's
//! shard communicator; the [`Transformer`] engine runs one
//! [`TransformerStack`] per worker on a [`meshformer::WorkerGrid`].

#![allow(
    clippy::struct_field_names,
    clippy::missing_errors_doc,
    clippy::doc_markdown // tensor shape docs trigger false positives
)]

mod attention;
mod feedforward;
mod init;
mod layer;
mod model;
mod norm;
mod projection;
mod stack;
mod weights;

use meshformer::backend::{
    ActivationOps, ArithOps, AttentionOps, Backend, EmbedOps, MatmulOps, NormOps, RopeOps,
    TensorFactory, TensorOps,
};

pub use attention::{AttentionCore, DecodeState};
pub use feedforward::FeedForward;
pub use init::init_params;
pub use layer::LayerShard;
pub use model::{Batch, EvalMetrics, TrainMetrics, Transformer};
pub use norm::Norm;
pub use projection::{ProjectionHead, TokenLoss};
pub use stack::{DecodeCache, Embedding, TransformerStack};
pub use weights::SublayerOutput;

/// Combined ops trait for the sharded transformer.
///
/// Bundles every backend bound the model components need.
pub trait TransformerOps:
    Backend
    + TensorFactory
    + ArithOps
    + MatmulOps
    + NormOps
    + ActivationOps
    + RopeOps
    + AttentionOps
    + EmbedOps
    + TensorOps
{
}

impl<B> TransformerOps for B where
    B: Backend
        + TensorFactory
        + ArithOps
        + MatmulOps
        + NormOps
        + ActivationOps
        + RopeOps
        + AttentionOps
        + EmbedOps
        + TensorOps
{
}
