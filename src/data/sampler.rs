// ============================================================
// Layer 4 — Distributed Shard Sampler
// ============================================================
// Decides which examples each replica sees in an epoch.
//
//   1. Shuffle all indices with StdRng seeded by (seed + epoch),
//      so every replica computes the same permutation without
//      talking to the others, and every epoch is different.
//   2. Replica r takes positions r, r + W, r + 2W, ... of the
//      permutation. Shards are disjoint, differ in size by at most
//      one, and their union is the whole dataset.
//   3. The shard is cut to a whole number of batches: every
//      replica runs exactly len / (W * batch_size) steps, so all
//      replicas reach the gradient all-reduce the same number of
//      times and every step has the same batch size everywhere.
//
// The indices feed a ShardDataset; Burn's DataLoader batches them
// in this order.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

#[derive(Debug, Clone)]
pub struct ShardSampler {
    len:        usize,
    world_size: usize,
    rank:       usize,
    seed:       u64,
}

impl ShardSampler {
    /// # Panics
    /// If `world_size` is zero or `rank >= world_size`.
    pub fn new(len: usize, world_size: usize, rank: usize, seed: u64) -> Self {
        assert!(world_size > 0, "world_size must be at least 1");
        assert!(rank < world_size, "rank {rank} out of range for world_size {world_size}");
        Self { len, world_size, rank, seed }
    }

    /// All dataset indices in this epoch's order
    pub fn permutation(&self, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.len).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        indices.shuffle(&mut rng);
        indices
    }

    /// This replica's indices for `epoch`
    pub fn shard(&self, epoch: usize) -> Vec<usize> {
        self.permutation(epoch)
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }

    /// Optimizer steps per epoch; identical on every rank
    pub fn steps_per_epoch(&self, batch_size: usize) -> usize {
        self.len / (self.world_size * batch_size.max(1))
    }

    /// This replica's training indices: the shard cut to
    /// `steps_per_epoch * batch_size`, so every batch is full
    pub fn epoch_indices(&self, epoch: usize, batch_size: usize) -> Vec<usize> {
        let mut shard = self.shard(epoch);
        shard.truncate(self.steps_per_epoch(batch_size) * batch_size.max(1));
        shard
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_shards_cover_dataset_exactly_once() {
        for world_size in [1, 2, 3, 8] {
            let len = 101;
            let mut seen = Vec::new();
            for rank in 0..world_size {
                seen.extend(ShardSampler::new(len, world_size, rank, 7).shard(3));
            }
            seen.sort_unstable();
            assert_eq!(seen, (0..len).collect::<Vec<_>>(), "world_size={world_size}");
        }
    }

    #[test]
    fn test_shard_sizes_are_balanced() {
        let sizes: Vec<usize> = (0..8)
            .map(|r| ShardSampler::new(100, 8, r, 0).shard(0).len())
            .collect();
        let min = *sizes.iter().min().unwrap();
        let max = *sizes.iter().max().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn test_drop_last_keeps_steps_uniform_and_disjoint() {
        let (len, world, batch) = (103, 4, 5);
        let mut all = HashSet::new();
        let mut steps = Vec::new();
        for rank in 0..world {
            let indices = ShardSampler::new(len, world, rank, 1).epoch_indices(0, batch);
            assert_eq!(indices.len() % batch, 0);
            steps.push(indices.len() / batch);
            for i in indices {
                assert!(all.insert(i), "index {i} visited twice");
            }
        }
        // 103 / (4 * 5) = 5 steps everywhere
        assert!(steps.iter().all(|&s| s == 5));
        assert_eq!(all.len(), 5 * world * batch);
    }

    #[test]
    fn test_same_seed_same_order_new_epoch_new_order() {
        let a = ShardSampler::new(50, 2, 0, 42);
        let b = ShardSampler::new(50, 2, 0, 42);
        assert_eq!(a.shard(1), b.shard(1));
        assert_ne!(a.permutation(1), a.permutation(2));
    }

    #[test]
    fn test_fewer_samples_than_one_batch_gives_no_steps() {
        let s = ShardSampler::new(7, 2, 0, 0);
        assert_eq!(s.steps_per_epoch(4), 0);
        assert!(s.epoch_indices(0, 4).is_empty());
    }

    #[test]
    #[should_panic]
    fn test_rank_out_of_range() {
        let _ = ShardSampler::new(10, 2, 2, 0);
    }
}
