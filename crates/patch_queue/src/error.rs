//! Error and warning types owned by the patch queue.
//!
//! Failures that come from collaborators (subject loading, preprocessing, patch
//! sampling, worker threads) travel as plain `anyhow::Error`s with context attached.
//! The kinds below are raised by the queue itself and are wrapped in `anyhow::Error`
//! as well, so callers tell them apart with `downcast_ref::<QueueError>()`:
//!
//! ```ignore
//! match PatchQueue::new(source, sampler, config) {
//!     Err(err) if matches!(
//!         err.downcast_ref::<QueueError>(),
//!         Some(QueueError::QuotaLengthMismatch { .. })
//!     ) => { /* fix the quota list */ }
//!     other => { /* ... */ }
//! }
//! ```

use std::fmt;

use thiserror::Error;

/// Failure kinds raised by the queue and its configuration layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// `samples_per_volume` was neither a non-negative integer nor a list of them.
    #[error("`samples_per_volume` should be an integer or a list of integers, got {found}")]
    InvalidQuotaType { found: String },

    /// Per-subject quota list does not have one entry per subject.
    #[error(
        "`samples_per_volume` (list) length must be equal to the number of subjects \
         (expected {expected}, got {got})"
    )]
    QuotaLengthMismatch { expected: usize, got: usize },

    /// The buffer capacity must hold at least one patch.
    #[error("`max_length` must be a positive integer")]
    InvalidMaxLength,

    /// No subjects to sample from.
    #[error("the subject source is empty")]
    EmptySource,

    /// Every quota is zero, so an epoch would never yield a patch.
    #[error("`samples_per_volume` sums to zero; an epoch must contain at least one patch")]
    ZeroQuota,

    /// The feeder signalled end-of-sequence again right after being restarted.
    #[error("subject feeder exhausted after {attempts} attempts while quota remains")]
    FeederExhausted { attempts: usize },

    /// `pop` found nothing to return even after refilling.
    #[error("patch buffer is still empty after a fill")]
    EmptyAfterFill,

    /// Lookup past the end of a subject source.
    #[error("subject index {index} out of bounds for source of size {len}")]
    SubjectOutOfRange { index: usize, len: usize },
}

/// Non-fatal conditions reported by [`PatchQueue::fill`](crate::PatchQueue::fill).
///
/// A warning never changes the outcome of the fill that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueWarning {
    /// Buffer refills will not line up with epoch boundaries, so a refill can mix
    /// patches from two adjacent epochs.
    MisalignedLength {
        max_length: usize,
        iterations_per_epoch: usize,
    },
    /// A finite patch stream ended before producing the requested portion.
    ShortPatchStream {
        subject_index: usize,
        requested: usize,
        produced: usize,
    },
}

impl fmt::Display for QueueWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MisalignedLength {
                max_length,
                iterations_per_epoch,
            } => write!(
                f,
                "Queue length ({}) not divisible by the number of patches per epoch ({})",
                max_length, iterations_per_epoch
            ),
            Self::ShortPatchStream {
                subject_index,
                requested,
                produced,
            } => write!(
                f,
                "Sampler produced {} of {} requested patches for subject {}",
                produced, requested, subject_index
            ),
        }
    }
}
