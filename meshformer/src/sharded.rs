//! Backend-agnostic 2D worker grid.
//!
//! [`WorkerGrid`] holds one worker per `(replica, rank)` cell of a
//! [`ShardTopology`] and runs them in lock-step via scoped threads. Each
//! worker gets two communicators:
//!
//! - a shard communicator over the workers of its own replica, used by the
//!   model's collectives,
//! - a batch communicator over the workers with the same rank in every
//!   replica, used to average gradients.
//!
//! The grid itself only dispatches threads; every collective happens inside
//! the worker closures.

use std::thread;

use crate::backend::MultiDeviceOps;
use crate::shard::{ShardPosition, ShardTopology};
use crate::{Error, Result};

/// What a worker knows about its place in the grid.
pub struct WorkerContext<C> {
    /// Position on the shard (model-parallel) axis.
    pub position: ShardPosition,
    /// Index on the batch (data-parallel) axis.
    pub replica: usize,
    pub shard_comm: C,
    pub batch_comm: C,
}

/// `shard_count × replica_count` workers, stored replica-major.
pub struct WorkerGrid<M> {
    topology: ShardTopology,
    workers: Vec<M>,
}

impl<M: Send> WorkerGrid<M> {
    /// Create every communicator group and build one worker per cell in
    /// parallel threads.
    ///
    /// # Errors
    /// Returns an error if communicator setup or any worker's `build` fails.
    ///
    /// # Panics
    /// Panics if a worker thread panics.
    pub fn new<B, F>(topology: ShardTopology, build: F) -> Result<Self>
    where
        B: MultiDeviceOps,
        F: Fn(WorkerContext<B::Comm>) -> Result<M> + Sync,
    {
        let shards = topology.shard_count;
        let replicas = topology.replica_count;
        if shards == 0 || replicas == 0 {
            return Err(Error::config("worker grid needs at least one worker"));
        }

        let mut shard_groups = (0..replicas)
            .map(|_| B::create_comm_group(shards).map(Vec::into_iter))
            .collect::<Result<Vec<_>>>()?;
        let mut batch_groups = (0..shards)
            .map(|_| B::create_comm_group(replicas).map(Vec::into_iter))
            .collect::<Result<Vec<_>>>()?;

        let mut contexts = Vec::with_capacity(topology.workers());
        for replica in 0..replicas {
            for rank in 0..shards {
                let missing = || Error::Collective("communicator group too small".into());
                contexts.push(WorkerContext {
                    position: ShardPosition {
                        rank,
                        world_size: shards,
                    },
                    replica,
                    shard_comm: shard_groups[replica].next().ok_or_else(missing)?,
                    batch_comm: batch_groups[rank].next().ok_or_else(missing)?,
                });
            }
        }

        let workers = thread::scope(|s| {
            let handles: Vec<_> = contexts
                .into_iter()
                .map(|ctx| {
                    let build = &build;
                    s.spawn(move || build(ctx))
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().expect("worker thread panicked"))
                .collect::<Result<Vec<_>>>()
        })?;

        Ok(Self { topology, workers })
    }

    #[must_use]
    pub const fn topology(&self) -> ShardTopology {
        self.topology
    }

    /// Workers in replica-major order.
    #[must_use]
    pub fn workers(&self) -> &[M] {
        &self.workers
    }

    /// Run `f` on every worker concurrently, returning results in
    /// replica-major order.
    ///
    /// # Errors
    /// Returns the first error any worker produced.
    ///
    /// # Panics
    /// Panics if a worker thread panics.
    pub fn run<R, F>(&self, f: F) -> Result<Vec<R>>
    where
        M: Sync,
        R: Send,
        F: Fn(&M) -> Result<R> + Sync,
    {
        thread::scope(|s| {
            let handles: Vec<_> = self
                .workers
                .iter()
                .map(|worker| {
                    let f = &f;
                    s.spawn(move || f(worker))
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().expect("worker thread panicked"))
                .collect()
        })
    }

    /// Like [`WorkerGrid::run`], with mutable access to each worker and
    /// one per-worker state.
    ///
    /// # Errors
    /// Returns an error if `states` does not hold one entry per worker, or
    /// the first error any worker produced.
    ///
    /// # Panics
    /// Panics if a worker thread panics.
    pub fn run_mut<S, R, F>(&mut self, states: &mut [S], f: F) -> Result<Vec<R>>
    where
        S: Send,
        R: Send,
        F: Fn(&mut M, &mut S) -> Result<R> + Sync,
    {
        if states.len() != self.workers.len() {
            return Err(Error::InvalidInput(format!(
                "{} states for {} workers",
                states.len(),
                self.workers.len()
            )));
        }
        thread::scope(|s| {
            let handles: Vec<_> = self
                .workers
                .iter_mut()
                .zip(states.iter_mut())
                .map(|(worker, state)| {
                    let f = &f;
                    s.spawn(move || f(worker, state))
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().expect("worker thread panicked"))
                .collect()
        })
    }

    /// Pick rank 0's result of every replica out of a replica-major result
    /// list.
    #[must_use]
    pub fn leaders<R>(&self, results: Vec<R>) -> Vec<R> {
        let shards = self.topology.shard_count;
        results
            .into_iter()
            .enumerate()
            .filter(|(i, _)| i % shards == 0)
            .map(|(_, r)| r)
            .collect()
    }
}
