/// Per-worker run counters.
///
/// Every worker advances its own copy by the same amounts, so the counters agree
/// across the group without communication.
#[derive(Debug, Clone)]
pub struct RunState {
    current_global_step: u64,
    iteration: u64,
    base_seed: u64,
    rank: usize,
    world_size: usize,
    loader_workers: usize,
}

impl RunState {
    pub fn new(base_seed: u64, rank: usize, world_size: usize, loader_workers: usize) -> Self {
        Self {
            current_global_step: 0,
            iteration: 0,
            base_seed,
            rank,
            world_size: world_size.max(1),
            loader_workers: loader_workers.max(1),
        }
    }

    /// Number of samples consumed so far across all workers.
    pub fn current_global_step(&self) -> u64 {
        self.current_global_step
    }

    /// Number of training iterations started in this run.
    pub fn iterations(&self) -> u64 {
        self.iteration
    }

    pub fn base_seed(&self) -> u64 {
        self.base_seed
    }

    /// Marks the start of a training iteration.
    ///
    /// The global step moves by `batch_size * world_size` before the step runs, so
    /// anything logged for the step carries the post-increment value. Returns the
    /// zero-based index of the iteration within the run.
    pub fn begin_iteration(&mut self, batch_size: usize) -> u64 {
        self.current_global_step += (batch_size * self.world_size) as u64;
        let index = self.iteration;
        self.iteration += 1;
        index
    }

    pub fn epoch_seed(&self, epoch: usize) -> u64 {
        self.base_seed
            + (epoch * self.world_size * self.loader_workers) as u64
            + (self.rank * self.loader_workers) as u64
    }
}
