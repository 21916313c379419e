use anyhow::{ensure, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::subject::{Patch, Subject};

/// A lazy, pull-based sequence of patches. May be infinite.
pub type PatchStream<'a> = Box<dyn Iterator<Item = Result<Patch>> + Send + 'a>;

/// Cuts patches out of one subject.
///
/// The queue relies on exactly two things:
/// - `patch_size()`: the spatial extent `(x, y, z)` of every patch, used for memory
///   estimation;
/// - `sample(subject)`: a lazy stream of patches from that subject. The queue pulls
///   only as many items as it needs, so infinite streams are fine.
///
/// Any sampling strategy plugs in by implementing this trait.
pub trait PatchSampler: Send + Sync {
    fn patch_size(&self) -> [usize; 3];

    fn sample(&self, subject: Arc<Subject>) -> PatchStream<'_>;

    /// Voxels in one patch (product of the spatial dimensions).
    fn patch_volume(&self) -> usize {
        self.patch_size().iter().product()
    }
}

impl<P: PatchSampler + ?Sized> PatchSampler for Arc<P> {
    fn patch_size(&self) -> [usize; 3] {
        (**self).patch_size()
    }

    fn sample(&self, subject: Arc<Subject>) -> PatchStream<'_> {
        (**self).sample(subject)
    }
}

/// Metadata key under which sampled patches record their crop origin.
pub const LOCATION_KEY: &str = "index_ini";

/// ============================================================================
/// Draws patches at uniformly random locations, forever.
///
/// Every call to `sample` starts a stream with its own RNG, seeded with
/// `base_seed + (stream_number << 32)`, so a run is reproducible for a given seed
/// while consecutive streams over the same subject still land in different places.
///
/// ```ignore
/// let sampler = UniformSampler::new([64, 64, 64], 42)?;
/// let patches: Vec<_> = sampler.sample(subject).take(4).collect::<Result<_>>()?;
/// ```
#[derive(Debug)]
pub struct UniformSampler {
    patch_size: [usize; 3],
    base_seed: u64,
    streams: AtomicU64,
}

impl UniformSampler {
    pub fn new(patch_size: [usize; 3], base_seed: u64) -> Result<Self> {
        ensure!(
            patch_size.iter().all(|&s| s > 0),
            "Patch size must be positive in every dimension, got {:?}",
            patch_size
        );
        Ok(Self {
            patch_size,
            base_seed,
            streams: AtomicU64::new(0),
        })
    }

    fn next_rng(&self) -> StdRng {
        let stream = self.streams.fetch_add(1, Ordering::Relaxed);
        StdRng::seed_from_u64(self.base_seed.wrapping_add(stream << 32))
    }

    fn valid_range(&self, subject: &Subject) -> Result<[usize; 3]> {
        let shape = subject.spatial_shape()?;
        for axis in 0..3 {
            ensure!(
                self.patch_size[axis] <= shape[axis],
                "Patch size {:?} is larger than subject shape {:?}",
                self.patch_size,
                shape
            );
        }
        Ok([
            shape[0] - self.patch_size[0],
            shape[1] - self.patch_size[1],
            shape[2] - self.patch_size[2],
        ])
    }
}

impl PatchSampler for UniformSampler {
    fn patch_size(&self) -> [usize; 3] {
        self.patch_size
    }

    fn sample(&self, subject: Arc<Subject>) -> PatchStream<'_> {
        let max_origin = match self.valid_range(&subject) {
            Ok(range) => range,
            Err(err) => return Box::new(std::iter::once(Err(err))),
        };
        let mut rng = self.next_rng();
        let patch_size = self.patch_size;

        Box::new(std::iter::repeat_with(move || {
            let origin = max_origin.map(|max| rng.random_range(0..=max));
            let patch = subject.crop(origin, patch_size)?;
            Ok(patch.with_metadata(LOCATION_KEY, format!("{:?}", origin)))
        }))
    }
}
