use anyhow::{ensure, Result};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};

/// Decides the order in which subject indices are visited during one epoch.
///
/// `iter(epoch)` returns a sequential or shuffled sequence for that epoch. Shuffling
/// samplers combine `epoch` with their base seed, so each epoch gets a fresh order
/// that is still reproducible from the seed.
pub trait IndexSampler: Send + Sync {
    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = usize> + Send + '_>;
}

/// ============================================================================
/// Yields `0, 1, ..., num_subjects - 1` every epoch.
///
/// ```ignore
/// let sampler = SequentialSampler::new(5);
/// let indices: Vec<_> = sampler.iter(0).collect();
/// assert_eq!(indices, vec![0, 1, 2, 3, 4]);
/// ```
#[derive(Debug, Clone)]
pub struct SequentialSampler {
    num_subjects: usize,
}

impl SequentialSampler {
    pub fn new(num_subjects: usize) -> Self {
        Self { num_subjects }
    }
}

impl IndexSampler for SequentialSampler {
    fn iter(&self, _epoch: usize) -> Box<dyn Iterator<Item = usize> + Send + '_> {
        Box::new(0..self.num_subjects)
    }
}

/// ============================================================================
/// A random permutation of `0..num_subjects`, redrawn every epoch.
///
/// # Seed handling
/// The RNG for epoch `e` is seeded with `base_seed + e`:
/// - Fixed seed -> identical order every run.
/// - Different epoch -> different permutation.
///
/// Every index appears exactly once per epoch, which is what keeps the per-subject
/// quota accounting exact.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    num_subjects: usize,
    base_seed: u64,
}

impl RandomSampler {
    pub fn new(num_subjects: usize, base_seed: u64) -> Result<Self> {
        ensure!(
            num_subjects > 0,
            "num_subjects must be a positive integer value, but got num_subjects={}",
            num_subjects
        );
        Ok(Self {
            num_subjects,
            base_seed,
        })
    }

    #[inline]
    fn derive_rng_for_epoch(&self, epoch: usize) -> StdRng {
        StdRng::seed_from_u64(self.base_seed.wrapping_add(epoch as u64))
    }
}

impl IndexSampler for RandomSampler {
    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = usize> + Send + '_> {
        let mut rng = self.derive_rng_for_epoch(epoch);
        let mut indices: Vec<_> = (0..self.num_subjects).collect();
        indices.shuffle(&mut rng);
        Box::new(indices.into_iter())
    }
}
