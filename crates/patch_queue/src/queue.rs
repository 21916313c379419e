//! The patch queue: a bounded buffer of patches, refilled from prefetched subjects.
//!
//! # State machine
//!
//! ```text
//!            fill(): stream restarted, quotas reset, cursor = None
//!   ┌──────────────────┐ ─────────────────────────────────────> ┌───────────────┐
//!   │ EPOCH_EXHAUSTED  │                                        │ EPOCH_ACTIVE  │
//!   │ sum(quota) == 0  │ <───────────────────────────────────── │ sum(quota) > 0│
//!   └──────────────────┘     last portion of the epoch drawn    └───────────────┘
//! ```
//!
//! `fill()` appends patches until one of three things happens:
//! 1. the buffer holds `max_length` patches,
//! 2. every quota of the epoch is used up,
//! 3. the subject cursor runs past the last subject.
//!
//! A subject whose quota does not fit in the remaining headroom contributes only a
//! portion. The subject stays cached in `current_subject` and the next `fill()`
//! resumes from it without pulling it from the feeder again.
//!
//! The queue is single-threaded: `pop` and `fill` run to completion on the caller's
//! thread. The only concurrency is inside the feeder, which may prepare subjects on
//! worker threads. Counters are private to each queue; several queues over the same
//! source do not coordinate their epochs.

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::config::QueueConfig;
use crate::dataset::SubjectSource;
use crate::error::{QueueError, QueueWarning};
use crate::feeder::{SubjectFeeder, SubjectStream};
use crate::memory::{format_memory, max_memory_bytes};
use crate::sampler::patch::PatchSampler;
use crate::subject::{Patch, Subject};

/// Progress messages: `debug!` when the queue is verbose, `trace!` otherwise.
macro_rules! progress {
    ($queue:expr, $($arg:tt)+) => {
        if $queue.verbose {
            tracing::debug!($($arg)+)
        } else {
            tracing::trace!($($arg)+)
        }
    };
}

/// What one call to [`PatchQueue::fill`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FillReport {
    /// Patches appended to the buffer.
    pub patches_added: usize,
    /// Subjects pulled from the feeder.
    pub subjects_fetched: usize,
    /// Whether this fill reset the quotas and started a new epoch.
    pub epoch_started: bool,
    /// Non-fatal problems; they did not stop the fill.
    pub warnings: Vec<QueueWarning>,
}

/// Bounded buffer of patches for patch-based training.
///
/// Preparing a volume (loading, preprocessing, augmentation) costs far more than a
/// training step on one patch, so each prepared subject contributes several patches
/// (`samples_per_volume`) and those patches wait in this queue until the training
/// loop pops them. Subject preparation can run on feeder workers while the consumer
/// drains previously buffered patches.
///
/// An epoch ends once every subject contributed exactly its quota; `len()` is the
/// number of pops in one epoch.
///
/// # Example
/// ```ignore
/// let config = QueueConfig::builder()
///     .max_length(300)
///     .samples_per_volume(10)
///     .num_workers(4)
///     .build();
/// let mut queue = PatchQueue::new(Arc::new(dataset), UniformSampler::new([96; 3], 42)?, config)?;
///
/// for epoch in 0..num_epochs {
///     for patch in queue.epoch_iter() {
///         let patch = patch?;
///         // train on patch.get("t1")?, patch.get("brain")?
///     }
/// }
/// ```
pub struct PatchQueue<P> {
    source: Arc<dyn SubjectSource>,
    sampler: P,
    feeder: SubjectFeeder,
    stream: Option<SubjectStream>,

    max_length: usize,
    /// Quotas in source order. Never permuted.
    samples_per_volume: Vec<usize>,
    iterations_per_epoch: usize,
    shuffle_patches: bool,
    verbose: bool,
    rng: StdRng,

    buffer: Vec<Patch>,
    /// Quotas still to draw this epoch, in the order of the current stream.
    remaining_quota: Vec<usize>,
    /// Position (in stream order) of the subject being drawn from; `None` before the
    /// first subject of an epoch.
    subject_cursor: Option<usize>,
    /// Set while the subject at `subject_cursor` still has quota left.
    current_subject: Option<Arc<Subject>>,

    num_sampled_patches: usize,
    epochs_started: usize,
    streams_created: usize,
    last_fill: Option<FillReport>,
}

impl<P: PatchSampler> PatchQueue<P> {
    /// Validates the configuration and, if `start_immediately`, starts the first epoch.
    ///
    /// # Errors
    /// - [`QueueError::EmptySource`] if the source has no subjects
    /// - [`QueueError::InvalidMaxLength`] if `max_length` is 0
    /// - [`QueueError::QuotaLengthMismatch`] if a per-subject quota list has the wrong length
    /// - [`QueueError::ZeroQuota`] if all quotas are 0
    /// - any error from starting feeder workers
    pub fn new<S>(source: Arc<S>, sampler: P, config: QueueConfig) -> Result<Self>
    where
        S: SubjectSource + 'static,
    {
        let source: Arc<dyn SubjectSource> = source;
        let num_subjects = source.len();
        if num_subjects == 0 {
            return Err(QueueError::EmptySource.into());
        }
        if config.max_length == 0 {
            return Err(QueueError::InvalidMaxLength.into());
        }

        let samples_per_volume = config.samples_per_volume.resolve(num_subjects)?;
        let iterations_per_epoch: usize = samples_per_volume.iter().sum();
        if iterations_per_epoch == 0 {
            return Err(QueueError::ZeroQuota.into());
        }

        let seed = config.seed.unwrap_or_else(|| rand::rng().random());
        let feeder = SubjectFeeder::new(
            source.clone(),
            config.num_workers,
            config.shuffle_subjects,
            seed,
            config.worker_timeout,
        )
        .context("Failed to create subject feeder")?;

        let mut queue = Self {
            source,
            sampler,
            feeder,
            stream: None,
            max_length: config.max_length,
            samples_per_volume,
            iterations_per_epoch,
            shuffle_patches: config.shuffle_patches,
            verbose: config.verbose,
            rng: StdRng::seed_from_u64(seed),
            buffer: Vec::with_capacity(config.max_length),
            // All zero: the first fill sees an exhausted epoch and starts one.
            remaining_quota: vec![0; num_subjects],
            subject_cursor: None,
            current_subject: None,
            num_sampled_patches: 0,
            epochs_started: 0,
            streams_created: 0,
            last_fill: None,
        };

        if config.start_immediately {
            queue.start_epoch()?;
        }
        Ok(queue)
    }

    /// Number of pops in one epoch (`sum(samples_per_volume)`).
    pub fn len(&self) -> usize {
        self.iterations_per_epoch
    }

    pub fn is_empty(&self) -> bool {
        self.iterations_per_epoch == 0
    }

    pub fn iterations_per_epoch(&self) -> usize {
        self.iterations_per_epoch
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn num_subjects(&self) -> usize {
        self.samples_per_volume.len()
    }

    /// Patches currently buffered.
    pub fn num_patches(&self) -> usize {
        self.buffer.len()
    }

    /// Patches handed to the consumer so far.
    pub fn num_sampled_patches(&self) -> usize {
        self.num_sampled_patches
    }

    /// Per-subject quotas in source order.
    pub fn samples_per_volume(&self) -> &[usize] {
        &self.samples_per_volume
    }

    /// Quotas left this epoch, indexed by position in the current subject stream.
    pub fn remaining_quota(&self) -> &[usize] {
        &self.remaining_quota
    }

    pub fn subject_cursor(&self) -> Option<usize> {
        self.subject_cursor
    }

    /// Source indices of the current epoch's subjects, in visiting order.
    pub fn subject_order(&self) -> Option<&[usize]> {
        self.stream.as_ref().map(|stream| stream.order())
    }

    /// Epochs started so far (quota resets).
    pub fn epoch(&self) -> usize {
        self.epochs_started
    }

    /// Report of the most recent fill, if any.
    pub fn last_fill(&self) -> Option<&FillReport> {
        self.last_fill.as_ref()
    }

    /// Removes and returns the next patch, refilling first if the buffer is empty.
    pub fn pop(&mut self) -> Result<Patch> {
        if self.buffer.is_empty() {
            progress!(self, "Patches list is empty.");
            self.fill()?;
        }
        let patch = self.buffer.pop().ok_or(QueueError::EmptyAfterFill)?;
        self.num_sampled_patches += 1;
        Ok(patch)
    }

    /// Indexed access for consumers that expect a fixed-length, indexable sequence.
    ///
    /// The index is ignored; this pops. Call it exactly `len()` times per epoch from
    /// a single consumer.
    pub fn get(&mut self, _index: usize) -> Result<Patch> {
        self.pop()
    }

    /// One epoch worth of pops.
    pub fn epoch_iter(&mut self) -> EpochIter<'_, P> {
        let remaining = self.iterations_per_epoch;
        EpochIter {
            queue: self,
            remaining,
        }
    }

    /// Appends patches until the buffer is full, the epoch's quota is used up, or the
    /// subjects run out; then shuffles (or orders for FIFO pops) the new patches.
    ///
    /// # Errors
    /// Failures to prepare a subject or to sample a patch are returned as they happen.
    /// The queue stays usable afterwards:
    /// - a subject that failed to load forfeits its quota for this epoch, and the next
    ///   fill moves on to the following subject;
    /// - patches sampled before a sampler failure stay in the buffer, in order, and
    ///   only they are charged to the subject's quota.
    pub fn fill(&mut self) -> Result<FillReport> {
        let mut report = FillReport::default();

        if self.max_length % self.iterations_per_epoch != 0 {
            let warning = QueueWarning::MisalignedLength {
                max_length: self.max_length,
                iterations_per_epoch: self.iterations_per_epoch,
            };
            warn!("{}", warning);
            report.warnings.push(warning);
        }

        if self.remaining_total() == 0 {
            self.start_epoch()?;
            report.epoch_started = true;
        }

        let start = self.buffer.len();
        let outcome = self.draw_patches(&mut report);
        self.arrange_fresh(start);
        outcome?;

        progress!(
            self,
            patches_added = report.patches_added,
            subjects_fetched = report.subjects_fetched,
            buffered = self.buffer.len(),
            "Queue filled"
        );
        self.last_fill = Some(report.clone());
        Ok(report)
    }

    /// The fill loop: one portion per iteration.
    fn draw_patches(&mut self, report: &mut FillReport) -> Result<()> {
        let num_subjects = self.remaining_quota.len();

        while self.buffer.len() < self.max_length && self.remaining_total() != 0 {
            let resume = match self.subject_cursor {
                Some(cursor)
                    if self.current_subject.is_some() && self.remaining_quota[cursor] > 0 =>
                {
                    Some(cursor)
                }
                _ => None,
            };
            let cursor = match resume {
                Some(cursor) => cursor,
                None => {
                    let next = self.subject_cursor.map_or(0, |c| c + 1);
                    if next >= num_subjects {
                        break;
                    }
                    // The stream has moved past this position whatever the outcome.
                    self.subject_cursor = Some(next);
                    self.current_subject = None;
                    match self.next_subject() {
                        Ok(subject) => self.current_subject = Some(Arc::new(subject)),
                        Err(err) => {
                            self.remaining_quota[next] = 0;
                            return Err(err);
                        }
                    }
                    report.subjects_fetched += 1;
                    next
                }
            };

            // Take the whole remaining quota, or only the portion that fits.
            let headroom = self.max_length - self.buffer.len();
            let portion = self.remaining_quota[cursor].min(headroom);
            if portion == 0 {
                continue;
            }
            let subject = match &self.current_subject {
                Some(subject) => subject.clone(),
                None => continue,
            };

            let mut produced = 0;
            let mut failure = None;
            for patch in self.sampler.sample(subject).take(portion) {
                match patch {
                    Ok(patch) => {
                        self.buffer.push(patch);
                        produced += 1;
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            report.patches_added += produced;

            if let Some(err) = failure {
                self.remaining_quota[cursor] -= produced;
                return Err(err.context(format!("Failed to sample patch from subject {}", cursor)));
            }

            // A stream that ends early is still charged the whole portion, so the
            // epoch terminates.
            self.remaining_quota[cursor] -= portion;
            if produced < portion {
                let warning = QueueWarning::ShortPatchStream {
                    subject_index: cursor,
                    requested: portion,
                    produced,
                };
                warn!("{}", warning);
                report.warnings.push(warning);
            }
        }
        Ok(())
    }

    /// Shuffles the buffer, or puts the patches appended since `start` in FIFO order.
    fn arrange_fresh(&mut self, start: usize) {
        if self.shuffle_patches {
            self.buffer.shuffle(&mut self.rng);
        } else {
            // `pop` takes from the end: put the new patches in front of any leftovers,
            // reversed, so patches come out in the order they were appended.
            let fresh: Vec<Patch> = self.buffer.drain(start..).rev().collect();
            self.buffer.splice(0..0, fresh);
        }
    }

    /// Worst-case bytes held by a full buffer, estimated from `subject` or, if none is
    /// given, from the first subject of the source.
    pub fn max_memory(&self, subject: Option<&Subject>) -> Result<u64> {
        let patch_size = self.sampler.patch_size();
        match subject {
            Some(subject) => Ok(max_memory_bytes(patch_size, subject, self.max_length)),
            None => {
                let first = self
                    .source
                    .get(0)
                    .context("Failed to load the first subject for memory estimation")?;
                Ok(max_memory_bytes(patch_size, &first, self.max_length))
            }
        }
    }

    /// [`max_memory`](Self::max_memory) rendered with binary prefixes.
    pub fn max_memory_pretty(&self, subject: Option<&Subject>) -> Result<String> {
        Ok(format_memory(self.max_memory(subject)?))
    }

    fn remaining_total(&self) -> usize {
        self.remaining_quota.iter().sum()
    }

    /// EPOCH_EXHAUSTED -> EPOCH_ACTIVE.
    fn start_epoch(&mut self) -> Result<()> {
        self.restart_stream()?;
        self.remaining_quota = match &self.stream {
            Some(stream) => stream
                .order()
                .iter()
                .map(|&i| self.samples_per_volume[i])
                .collect(),
            None => vec![0; self.samples_per_volume.len()],
        };
        self.subject_cursor = None;
        self.current_subject = None;
        self.epochs_started += 1;
        Ok(())
    }

    fn restart_stream(&mut self) -> Result<()> {
        // Shut the old workers down before spawning new ones.
        self.stream = None;
        progress!(
            self,
            "Creating subjects stream with {} workers",
            self.feeder.num_workers()
        );
        let stream = self.feeder.stream(self.streams_created)?;
        self.streams_created += 1;
        self.stream = Some(stream);
        Ok(())
    }

    /// Pulls the next subject, restarting the stream once on end-of-sequence.
    fn next_subject(&mut self) -> Result<Subject> {
        if let Some(result) = self.stream.as_mut().and_then(|stream| stream.next()) {
            return result;
        }

        progress!(self, "Subject stream exhausted; restarting it once");
        self.restart_stream()?;
        match self.stream.as_mut().and_then(|stream| stream.next()) {
            Some(result) => result,
            None => Err(QueueError::FeederExhausted { attempts: 2 }.into()),
        }
    }
}

impl<P> fmt::Display for PatchQueue<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Queue(max_length={}, num_subjects={}, num_patches={}, samples_per_volume={:?}, \
             num_sampled_patches={}, iterations_per_epoch={})",
            self.max_length,
            self.samples_per_volume.len(),
            self.buffer.len(),
            self.samples_per_volume,
            self.num_sampled_patches,
            self.iterations_per_epoch
        )
    }
}

impl<P> fmt::Debug for PatchQueue<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Exactly `iterations_per_epoch` pops. Created by [`PatchQueue::epoch_iter`].
pub struct EpochIter<'a, P> {
    queue: &'a mut PatchQueue<P>,
    remaining: usize,
}

impl<P: PatchSampler> Iterator for EpochIter<'_, P> {
    type Item = Result<Patch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.queue.pop())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<P: PatchSampler> ExactSizeIterator for EpochIter<'_, P> {}
