//! Backend trait and op trait definitions.
//!
//! Models are generic over `B: Backend` and use op traits like `ArithOps`,
//! `MatmulOps`, etc. to express their compute requirements. Each backend
//! implements these traits with its own tensor type.
//!
//! # Design notes
//!
//! - **Op traits extend `Backend`** and use `Self::Tensor` from the
//!   supertrait.
//! - **Compute is f32.** Storage dtypes are a checkpoint concern.
//! - **Collectives are not ops.** They live on `Backend::Comm` and take
//!   [`ShardLocal`](crate::ShardLocal) values, so they cannot be called on a
//!   tensor that is already replicated by accident.
//! - **Attention bias is a tensor.** Masks and positional biases are built
//!   on the host ([`AttentionBias`](crate::AttentionBias)) and uploaded; the
//!   attention kernel only adds it.

use crate::collective::Comm;
use crate::config::{Activation, RotaryLayout};
use crate::tensor::Tensor;
use crate::Result;

// ---- Core backend trait ----

/// A compute backend.
pub trait Backend: 'static + Send + Sync {
    /// The tensor type for this backend (e.g., `CpuTensor`).
    type Tensor: Tensor + Clone + Send + Sync;

    /// Communicator used by one shard group or batch group.
    type Comm: Comm<Self::Tensor>;
}

// ---- Op traits ----

/// Host <-> backend transfer.
pub trait TensorFactory: Backend {
    fn from_f32(shape: &[usize], data: &[f32]) -> Result<Self::Tensor>;

    fn to_f32_vec(tensor: &Self::Tensor) -> Result<Vec<f32>>;
}

/// Core tensor arithmetic.
pub trait ArithOps: Backend {
    /// Element-wise addition, returning a new tensor.
    fn add(a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;

    /// Element-wise in-place addition: `a += b`.
    fn add_inplace(a: &mut Self::Tensor, b: &Self::Tensor) -> Result<()>;

    /// Element-wise multiplication, returning a new tensor.
    fn mul(a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;

    /// In-place scalar scaling: `a *= scale`.
    fn scale_inplace(a: &mut Self::Tensor, scale: f32) -> Result<()>;

    /// Add a `(n)` bias to every row of an `(.., n)` tensor.
    fn add_bias(input: &Self::Tensor, bias: &Self::Tensor) -> Result<Self::Tensor>;
}

/// Matrix multiplication.
pub trait MatmulOps: Backend {
    /// `(m, k) @ (k, n) -> (m, n)`.
    fn matmul(a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;
}

/// Normalization over the last axis.
pub trait NormOps: Backend {
    /// `scale * (x - mean) / sqrt(var + eps) + offset`, population variance.
    fn layer_norm(
        input: &Self::Tensor,
        scale: &Self::Tensor,
        offset: Option<&Self::Tensor>,
        eps: f32,
    ) -> Result<Self::Tensor>;

    /// `scale * x / (||x||_2 + eps) + offset`. `scale` is either per-feature
    /// or a single element broadcast over the row.
    fn l2_norm(
        input: &Self::Tensor,
        scale: &Self::Tensor,
        offset: Option<&Self::Tensor>,
        eps: f32,
    ) -> Result<Self::Tensor>;
}

/// Elementwise activations.
pub trait ActivationOps: Backend {
    fn activation(input: &Self::Tensor, kind: Activation) -> Result<Self::Tensor>;
}

/// Rotary position embedding.
pub trait RopeOps: Backend {
    /// Rotate the first `rotary_dims` features of every head.
    ///
    /// `input` is `(seq, heads, d_head)`; `cos`/`sin` are
    /// `(positions, rotary_dims / 2)` and row `position_offset + s` is used
    /// for sequence index `s`.
    fn apply_rotary(
        input: &Self::Tensor,
        cos: &Self::Tensor,
        sin: &Self::Tensor,
        rotary_dims: usize,
        layout: RotaryLayout,
        position_offset: usize,
    ) -> Result<Self::Tensor>;
}

/// Scaled dot-product attention with an additive bias.
pub trait AttentionOps: Backend {
    /// `q`: `(q_len, heads, d_head)`, `k`/`v`: `(k_len, heads, d_head)`,
    /// `bias`: `(heads, q_len, k_len)`. Returns `(q_len, heads, d_head)`.
    ///
    /// Logits are `scale * q·k + bias`; softmax subtracts the row maximum
    /// and never skips masked entries.
    fn attention(
        q: &Self::Tensor,
        k: &Self::Tensor,
        v: &Self::Tensor,
        bias: &Self::Tensor,
        scale: f32,
    ) -> Result<Self::Tensor>;
}

/// Vocab-sharded embedding lookup.
pub trait EmbedOps: Backend {
    /// Rows of `table` (`(vocab_slice, d)`) for ids inside
    /// `[vocab_start, vocab_start + vocab_slice)`; zero rows for ids
    /// outside the slice.
    fn embedding_gather(
        table: &Self::Tensor,
        ids: &[u32],
        vocab_start: usize,
    ) -> Result<Self::Tensor>;
}

/// Tensor reshaping and manipulation.
pub trait TensorOps: Backend {
    /// Transpose a 2D tensor.
    fn transpose_2d(input: &Self::Tensor) -> Result<Self::Tensor>;

    /// Concatenate along `axis`.
    fn concat(parts: &[Self::Tensor], axis: usize) -> Result<Self::Tensor>;

    /// Copy `len` entries of `axis` starting at `start`.
    fn narrow(input: &Self::Tensor, axis: usize, start: usize, len: usize)
        -> Result<Self::Tensor>;
}

/// Creation of communicator groups.
pub trait MultiDeviceOps: Backend {
    /// One communicator per rank of a new group, in rank order.
    fn create_comm_group(world_size: usize) -> Result<Vec<Self::Comm>>;
}
