use std::{
    any::Any,
    sync::{Arc, Mutex},
    time::Duration,
};

use finetune_core::{Barrier, CancellableBarrier};
use tracing::{debug, warn};

use crate::DistributedError;

type Slot = Option<Box<dyn Any + Send>>;

struct GroupInner {
    world_size: usize,
    join_timeout: Duration,
    barrier: CancellableBarrier,
    slots: Mutex<Vec<Slot>>,
}

impl std::fmt::Debug for GroupInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupInner")
            .field("world_size", &self.world_size)
            .field("join_timeout", &self.join_timeout)
            .field("barrier", &self.barrier)
            .finish_non_exhaustive()
    }
}

/// Collective state shared by the workers of one run, one worker per thread.
///
/// Cloning is cheap; every clone refers to the same group. Once cancelled, every
/// pending and future collective fails with [`DistributedError::Cancelled`].
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    inner: Arc<GroupInner>,
}

impl ProcessGroup {
    pub fn new(world_size: usize, join_timeout: Duration) -> Self {
        let world_size = world_size.max(1);
        Self {
            inner: Arc::new(GroupInner {
                world_size,
                join_timeout,
                barrier: CancellableBarrier::new(world_size),
                slots: Mutex::new((0..world_size).map(|_| None).collect()),
            }),
        }
    }

    pub fn world_size(&self) -> usize {
        self.inner.world_size
    }

    /// Blocks until every rank has joined, bounded by the join timeout.
    pub fn join(&self, rank: usize) -> Result<(), DistributedError> {
        self.check_rank(rank)?;
        debug!(rank, world_size = self.world_size(), "Joining process group");
        if self.inner.barrier.wait_timeout(self.inner.join_timeout)? {
            Ok(())
        } else {
            warn!(rank, "Timed out waiting for workers to join");
            Err(DistributedError::JoinTimeout {
                timeout_secs: self.inner.join_timeout.as_secs(),
                world_size: self.world_size(),
            })
        }
    }

    pub fn barrier(&self) -> Result<(), DistributedError> {
        Ok(self.inner.barrier.wait()?)
    }

    /// Collects one value from every rank, returned in rank order on every rank.
    pub fn all_gather<T>(&self, rank: usize, value: T) -> Result<Vec<T>, DistributedError>
    where
        T: Clone + Send + 'static,
    {
        self.check_rank(rank)?;
        if self.world_size() == 1 {
            return Ok(vec![value]);
        }
        self.inner.slots.lock().unwrap()[rank] = Some(Box::new(value));
        // every slot is written
        self.barrier()?;
        let gathered = {
            let slots = self.inner.slots.lock().unwrap();
            slots
                .iter()
                .enumerate()
                .map(|(source, slot)| {
                    slot.as_ref()
                        .and_then(|v| v.downcast_ref::<T>())
                        .cloned()
                        .ok_or(DistributedError::TypeMismatch(source))
                })
                .collect::<Result<Vec<_>, _>>()
        };
        // every slot is read, so the next collective may overwrite them
        self.barrier()?;
        gathered
    }

    pub fn cancel(&self) {
        self.inner.barrier.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.barrier.is_cancelled()
    }

    fn check_rank(&self, rank: usize) -> Result<(), DistributedError> {
        if rank >= self.world_size() {
            return Err(DistributedError::InvalidRank {
                rank,
                world_size: self.world_size(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::thread;

    fn spawn_group<T, F>(world_size: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(ProcessGroup, usize) -> T + Send + Sync + 'static,
    {
        let group = ProcessGroup::new(world_size, Duration::from_secs(5));
        let f = Arc::new(f);
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let group = group.clone();
                let f = f.clone();
                thread::spawn(move || (*f)(group, rank))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn gather_returns_rank_order_everywhere() {
        let results = spawn_group(4, |group, rank| {
            group.join(rank).unwrap();
            let first = group.all_gather(rank, rank * 10).unwrap();
            let second = group.all_gather(rank, format!("r{rank}")).unwrap();
            (first, second)
        });
        for (first, second) in results {
            assert_eq!(first, vec![0, 10, 20, 30]);
            assert_eq!(second, vec!["r0", "r1", "r2", "r3"]);
        }
    }

    #[test]
    fn join_times_out_when_a_rank_never_arrives() {
        let group = ProcessGroup::new(2, Duration::from_millis(50));
        assert!(matches!(
            group.join(0),
            Err(DistributedError::JoinTimeout { world_size: 2, .. })
        ));
    }

    #[test]
    fn cancel_releases_blocked_collectives() {
        let group = ProcessGroup::new(3, Duration::from_secs(5));
        let waiter = {
            let group = group.clone();
            thread::spawn(move || group.all_gather(1, 1u8))
        };
        thread::sleep(Duration::from_millis(50));
        group.cancel();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(DistributedError::Cancelled)
        ));
        assert!(matches!(group.barrier(), Err(DistributedError::Cancelled)));
    }

    #[test]
    fn invalid_rank_is_rejected() {
        let group = ProcessGroup::new(2, Duration::from_secs(1));
        assert!(matches!(
            group.join(2),
            Err(DistributedError::InvalidRank { rank: 2, .. })
        ));
    }
}
