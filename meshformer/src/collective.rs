//! Shard-local vs replicated values and the collectives between them.
//!
//! Every value a model-parallel worker touches is one of two kinds:
//!
//! - [`ShardLocal`]: differs between the workers of a shard group. A vocab
//!   or head slice, a partial sum waiting for reduction, or a full-size copy
//!   that may have drifted.
//! - [`Replicated`]: bitwise identical on every worker of the group.
//!
//! Local compute maps a kind to itself. The only ways from `ShardLocal` to
//! `Replicated` are the three collectives on [`Comm`]. A layer that forgets
//! its all-reduce therefore hands a `ShardLocal` to a function expecting a
//! `Replicated` and fails to compile instead of hanging the group.

use crate::Result;

/// A value that may differ between the workers of a shard group.
#[derive(Debug, Clone)]
pub struct ShardLocal<T>(T);

/// A value that is identical on every worker of a shard group.
#[derive(Debug, Clone)]
pub struct Replicated<T>(T);

impl<T> ShardLocal<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn get(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    /// Apply a worker-local function; the result stays shard-local.
    pub fn map<U>(self, f: impl FnOnce(T) -> Result<U>) -> Result<ShardLocal<U>> {
        f(self.0).map(ShardLocal)
    }

    /// Combine two shard-local values with a worker-local function.
    pub fn zip<U, V>(
        &self,
        other: &ShardLocal<U>,
        f: impl FnOnce(&T, &U) -> Result<V>,
    ) -> Result<ShardLocal<V>> {
        f(&self.0, &other.0).map(ShardLocal)
    }
}

impl<T> Replicated<T> {
    /// Wrap a value the caller guarantees is identical on every worker.
    ///
    /// Legitimate sources are collective results, host inputs broadcast to
    /// every worker (token ids, targets), and deterministic functions of
    /// other replicated values.
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn get(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    /// Apply a deterministic local function; the result stays replicated.
    pub fn map<U>(self, f: impl FnOnce(T) -> Result<U>) -> Result<Replicated<U>> {
        f(self.0).map(Replicated)
    }

    /// Combine two replicated values with a deterministic local function.
    pub fn zip<U, V>(
        &self,
        other: &Replicated<U>,
        f: impl FnOnce(&T, &U) -> Result<V>,
    ) -> Result<Replicated<V>> {
        f(&self.0, &other.0).map(Replicated)
    }

    /// A replicated value is trivially valid as a shard-local one.
    pub fn localize(self) -> ShardLocal<T> {
        ShardLocal(self.0)
    }
}

/// Communicator for one group of workers (a shard axis or a batch axis).
///
/// Every worker of the group must issue the same calls in the same order.
pub trait Comm<T>: Send + Sync {
    /// This worker's rank within the group.
    fn rank(&self) -> usize;

    /// Number of workers in the group.
    fn world_size(&self) -> usize;

    /// Sum each worker's partial tensor elementwise.
    fn all_reduce_sum(&self, partial: ShardLocal<T>) -> Result<Replicated<T>>;

    /// Collect every worker's tensor, in rank order.
    ///
    /// Concatenation along the split axis is left to the caller, which
    /// knows the axis.
    fn all_gather(&self, slice: ShardLocal<T>) -> Result<Replicated<Vec<T>>>;

    /// Average each worker's full-size copy of a value.
    fn average(&self, copy: ShardLocal<T>) -> Result<Replicated<T>>;
}
