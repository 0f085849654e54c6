use std::sync::Arc;

use finetune_core::Shuffle;
use finetune_modeling::Batch;
use rand::seq::SliceRandom;
use rand_chacha::{rand_core::SeedableRng, ChaCha8Rng};

use crate::{DataError, SupervisedDataset};

/// Batches one rank's shard of a dataset.
///
/// Every rank gets `ceil(len / world_size)` contiguous indices; the last shard wraps
/// around to the start of the dataset so all shards have the same length. Gathering
/// the shards in rank order and keeping the first `len` entries therefore restores
/// the dataset order.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<dyn SupervisedDataset>,
    batch_size: usize,
    rank: usize,
    world_size: usize,
    shuffle: Shuffle,
    drop_last: bool,
}

impl DataLoader {
    /// Shuffled once a seed is set, incomplete trailing batch dropped.
    pub fn train(
        dataset: Arc<dyn SupervisedDataset>,
        batch_size: usize,
        rank: usize,
        world_size: usize,
    ) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            rank,
            world_size: world_size.max(1),
            shuffle: Shuffle::DontShuffle,
            drop_last: true,
        }
    }

    /// In order, trailing batch kept.
    pub fn eval(
        dataset: Arc<dyn SupervisedDataset>,
        batch_size: usize,
        rank: usize,
        world_size: usize,
    ) -> Self {
        Self {
            drop_last: false,
            ..Self::train(dataset, batch_size, rank, world_size)
        }
    }

    pub fn set_epoch_seed(&mut self, seed: u64) {
        self.shuffle = Shuffle::from_seed(seed);
    }

    pub fn dataset(&self) -> &Arc<dyn SupervisedDataset> {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn shard_len(&self) -> usize {
        self.dataset.len().div_ceil(self.world_size)
    }

    /// Dataset indices this rank visits this epoch, in visiting order.
    pub fn shard_indices(&self) -> Vec<usize> {
        let total = self.dataset.len();
        if total == 0 {
            return Vec::new();
        }
        let per_rank = self.shard_len();
        let start = self.rank * per_rank;
        let mut indices: Vec<usize> = (start..start + per_rank).map(|i| i % total).collect();
        if let Shuffle::Seeded(seed) = self.shuffle {
            indices.shuffle(&mut ChaCha8Rng::from_seed(seed));
        }
        indices
    }

    /// Number of batches per epoch; the same on every rank.
    pub fn len(&self) -> usize {
        let per_rank = self.shard_len();
        if self.drop_last {
            per_rank / self.batch_size
        } else {
            per_rank.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Batch, DataError>> + '_ {
        let indices = self.shard_indices();
        let batches = self.len();
        (0..batches).map(move |batch| {
            let start = batch * self.batch_size;
            let end = (start + self.batch_size).min(indices.len());
            self.dataset.collate(&indices[start..end])
        })
    }
}
