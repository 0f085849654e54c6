use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("barrier was cancelled")]
pub struct CancelledBarrier;

pub trait Barrier: Send + Sync + std::fmt::Debug {
    fn wait(&self) -> Result<(), CancelledBarrier>;

    fn cancel(&self);

    fn reset(&self);

    fn is_cancelled(&self) -> bool;
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    cancelled: bool,
}

/// A reusable rendezvous point for a fixed number of threads.
///
/// Unlike [`std::sync::Barrier`], a waiting thread can be released early by
/// [`Barrier::cancel`], in which case every current and future `wait` returns
/// [`CancelledBarrier`] until the barrier is [`Barrier::reset`].
#[derive(Debug)]
pub struct CancellableBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl CancellableBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Like [`Barrier::wait`], but gives up after `timeout`.
    /// Returns `Ok(false)` on timeout; the caller's arrival is withdrawn.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, CancelledBarrier> {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            return Err(CancelledBarrier);
        }
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(true);
        }
        let generation = state.generation;
        let (mut state, result) = self
            .cvar
            .wait_timeout_while(state, timeout, |s| {
                s.generation == generation && !s.cancelled
            })
            .unwrap();
        if state.generation != generation {
            Ok(true)
        } else if state.cancelled {
            Err(CancelledBarrier)
        } else {
            debug_assert!(result.timed_out());
            state.arrived -= 1;
            Ok(false)
        }
    }
}

impl Barrier for CancellableBarrier {
    fn wait(&self) -> Result<(), CancelledBarrier> {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            return Err(CancelledBarrier);
        }
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        let state = self
            .cvar
            .wait_while(state, |s| s.generation == generation && !s.cancelled)
            .unwrap();
        if state.generation != generation {
            Ok(())
        } else {
            Err(CancelledBarrier)
        }
    }

    fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.cancelled = true;
        self.cvar.notify_all();
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.cancelled = false;
        state.arrived = 0;
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn releases_all_parties() {
        let barrier = Arc::new(CancellableBarrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    for _ in 0..3 {
                        barrier.wait().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn single_party_never_blocks() {
        let barrier = CancellableBarrier::new(1);
        assert!(barrier.wait().is_ok());
        assert!(barrier.wait().is_ok());
    }

    #[test]
    fn cancel_unblocks_waiters() {
        let barrier = Arc::new(CancellableBarrier::new(3));
        let waiter = {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.wait())
        };
        thread::sleep(Duration::from_millis(50));
        barrier.cancel();
        assert_eq!(waiter.join().unwrap(), Err(CancelledBarrier));
        assert!(barrier.is_cancelled());
        assert_eq!(barrier.wait(), Err(CancelledBarrier));

        barrier.reset();
        assert!(!barrier.is_cancelled());
    }

    #[test]
    fn wait_timeout_withdraws_arrival() {
        let barrier = CancellableBarrier::new(2);
        assert_eq!(barrier.wait_timeout(Duration::from_millis(20)), Ok(false));
        // the timed-out arrival must not count towards the next rendezvous
        assert_eq!(barrier.wait_timeout(Duration::from_millis(20)), Ok(false));
    }
}
