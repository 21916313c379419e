#![allow(dead_code)]

use patch_queue::{
    Image, ImageKind, Patch, PatchSampler, PatchStream, QueueConfig, SamplesPerVolume, Subject,
    SubjectSource, SubjectsDataset, Transform,
};

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Yields patches tagged with the subject's `id` and a running `seq`, forever.
pub struct TagSampler;

impl PatchSampler for TagSampler {
    fn patch_size(&self) -> [usize; 3] {
        [1, 1, 1]
    }

    fn sample(&self, subject: Arc<Subject>) -> PatchStream<'_> {
        let id = subject.metadata("id").unwrap_or("?").to_string();
        Box::new((0..).map(move |seq: usize| {
            Ok(Patch::default()
                .with_metadata("id", id.clone())
                .with_metadata("seq", seq.to_string()))
        }))
    }
}

/// `(subject id, seq)` of a patch produced by [`TagSampler`].
pub fn tag(patch: &Patch) -> (usize, usize) {
    let field = |key| {
        patch
            .metadata(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(usize::MAX)
    };
    (field("id"), field("seq"))
}

/// `n` small subjects with a `t1` intensity image and a `seg` label, tagged `id = i`.
pub fn make_subjects(n: usize) -> Vec<Subject> {
    (0..n)
        .map(|i| {
            Subject::from_single("t1", Image::filled(i as f32, [1, 4, 4, 4], ImageKind::Intensity))
                .with_image("seg", Image::filled(1.0, [1, 4, 4, 4], ImageKind::Label))
                .with_metadata("id", i.to_string())
        })
        .collect()
}

pub fn make_dataset(n: usize) -> Arc<SubjectsDataset> {
    Arc::new(SubjectsDataset::new(make_subjects(n)))
}

/// Deterministic configuration: sequential subjects, no patch shuffling.
pub fn fifo_config(max_length: usize, quota: SamplesPerVolume) -> QueueConfig {
    QueueConfig::builder()
        .max_length(max_length)
        .samples_per_volume(quota)
        .shuffle_subjects(false)
        .shuffle_patches(false)
        .seed(0)
        .build()
}

/// Counts how often subjects are prepared, optionally sleeping to simulate heavy work.
#[derive(Clone)]
pub struct CountingTransform {
    pub counter: Arc<AtomicUsize>,
    pub delay: Duration,
}

impl CountingTransform {
    pub fn new(delay: Duration) -> Self {
        Self {
            counter: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }

    pub fn count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Transform<Subject, Subject> for CountingTransform {
    fn apply(&self, subject: Subject) -> Result<Subject> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(subject)
    }
}

/// Fails to prepare the subject at `bad_index`.
pub struct FailingSource {
    pub inner: SubjectsDataset,
    pub bad_index: usize,
}

impl SubjectSource for FailingSource {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, index: usize) -> Result<Subject> {
        if index == self.bad_index {
            return Err(anyhow!("corrupted volume {}", index));
        }
        self.inner.get(index)
    }
}
