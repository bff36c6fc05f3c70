//! In-process collectives over a group of worker threads.
//!
//! Every member writes its tensor into a shared slot, waits on a barrier,
//! reads all slots, then waits again so no member overwrites a slot another
//! member has not read yet. Reductions run over the slots in rank order on
//! every member, so all members get bitwise identical results.

use std::sync::{Arc, Barrier, Mutex};

use meshformer::backend::MultiDeviceOps;
use meshformer::collective::{Comm, Replicated, ShardLocal};
use meshformer::tensor::Tensor;
use meshformer::{Error, Result};

use crate::kernels;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

struct Group {
    slots: Mutex<Vec<Option<CpuTensor>>>,
    barrier: Barrier,
}

/// One member's handle on a thread group.
#[derive(Clone)]
pub struct ThreadComm {
    group: Arc<Group>,
    rank: usize,
    world_size: usize,
}

impl ThreadComm {
    /// Handles for a new group of `world_size` members, in rank order.
    ///
    /// # Errors
    /// Returns an error for an empty group.
    pub fn group(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(Error::Collective("group of zero members".into()));
        }
        let group = Arc::new(Group {
            slots: Mutex::new(vec![None; world_size]),
            barrier: Barrier::new(world_size),
        });
        Ok((0..world_size)
            .map(|rank| Self {
                group: Arc::clone(&group),
                rank,
                world_size,
            })
            .collect())
    }

    fn exchange(&self, tensor: CpuTensor) -> Result<Vec<CpuTensor>> {
        if self.world_size == 1 {
            return Ok(vec![tensor]);
        }
        {
            let mut slots = self.group.slots.lock().map_err(|_| poisoned())?;
            slots[self.rank] = Some(tensor);
        }
        self.group.barrier.wait();
        let all = self
            .group
            .slots
            .lock()
            .map_err(|_| poisoned())
            .and_then(|slots| {
                slots
                    .iter()
                    .map(|slot| {
                        slot.clone()
                            .ok_or_else(|| Error::Collective("missing peer contribution".into()))
                    })
                    .collect::<Result<Vec<_>>>()
            });
        self.group.barrier.wait();
        all
    }

    fn sum(&self, parts: &[CpuTensor]) -> Result<CpuTensor> {
        let (first, rest) = parts
            .split_first()
            .ok_or_else(|| Error::Collective("empty reduction".into()))?;
        let mut acc = first.to_f32_vec();
        for part in rest {
            if part.shape() != first.shape() {
                return Err(Error::Collective(format!(
                    "rank {} reduces {:?} with {:?}",
                    self.rank,
                    first.shape(),
                    part.shape()
                )));
            }
            kernels::vec_add_inplace(&mut acc, part.as_f32_slice());
        }
        CpuTensor::from_vec(first.shape(), acc)
    }
}

fn poisoned() -> Error {
    Error::Collective("peer thread panicked during a collective".into())
}

impl Comm<CpuTensor> for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, partial: ShardLocal<CpuTensor>) -> Result<Replicated<CpuTensor>> {
        let parts = self.exchange(partial.into_inner())?;
        self.sum(&parts).map(Replicated::new)
    }

    fn all_gather(&self, slice: ShardLocal<CpuTensor>) -> Result<Replicated<Vec<CpuTensor>>> {
        self.exchange(slice.into_inner()).map(Replicated::new)
    }

    #[allow(clippy::cast_precision_loss)]
    fn average(&self, copy: ShardLocal<CpuTensor>) -> Result<Replicated<CpuTensor>> {
        let parts = self.exchange(copy.into_inner())?;
        let mut mean = self.sum(&parts)?;
        kernels::vec_scale(mean.as_f32_slice_mut(), 1.0 / self.world_size as f32);
        Ok(Replicated::new(mean))
    }
}

impl MultiDeviceOps for CpuBackend {
    fn create_comm_group(world_size: usize) -> Result<Vec<ThreadComm>> {
        ThreadComm::group(world_size)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[allow(clippy::cast_precision_loss)]
    fn run_group<R: Send>(
        n: usize,
        f: impl Fn(&ThreadComm) -> Result<R> + Sync,
    ) -> Vec<R> {
        let comms = ThreadComm::group(n).unwrap();
        thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|c| {
                    let f = &f;
                    s.spawn(move || f(c).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn test_all_reduce_sum_is_identical_everywhere() {
        let results = run_group(4, |c| {
            let t = CpuTensor::from_f32(&[2], &[c.rank() as f32, 0.1])?;
            let sum = c.all_reduce_sum(ShardLocal::new(t))?;
            Ok(sum.into_inner().to_f32_vec())
        });
        for r in &results {
            assert_eq!(r, &results[0]);
        }
        assert_eq!(results[0][0], 6.0);
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn test_all_gather_rank_order_and_repeat() {
        let results = run_group(3, |c| {
            let mut seen = Vec::new();
            for round in 0..3 {
                let t = CpuTensor::from_f32(&[1], &[(round * 10 + c.rank()) as f32])?;
                let parts = c.all_gather(ShardLocal::new(t))?.into_inner();
                seen.push(parts.iter().map(|p| p.as_f32_slice()[0]).collect::<Vec<_>>());
            }
            Ok(seen)
        });
        assert_eq!(results[2][1], vec![10.0, 11.0, 12.0]);
        assert_eq!(results[0], results[1]);
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn test_average() {
        let results = run_group(2, |c| {
            let t = CpuTensor::from_f32(&[1], &[c.rank() as f32 * 4.0])?;
            Ok(c.average(ShardLocal::new(t))?.into_inner().as_f32_slice()[0])
        });
        assert_eq!(results, vec![2.0, 2.0]);
    }

    #[test]
    fn test_single_member_group() {
        let comm = ThreadComm::group(1).unwrap().remove(0);
        let t = CpuTensor::from_f32(&[1], &[5.0]).unwrap();
        let out = comm.all_reduce_sum(ShardLocal::new(t)).unwrap();
        assert_eq!(out.get().as_f32_slice(), &[5.0]);
        assert!(ThreadComm::group(0).is_err());
    }
}
