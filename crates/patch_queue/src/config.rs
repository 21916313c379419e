//! Configuration for `PatchQueue` behaviour.
//!
//! ```ignore
//! let config = QueueConfig::builder()
//!     .max_length(300)
//!     .samples_per_volume(10)
//!     .num_workers(4)
//!     .seed(42)
//!     .build();
//! ```
//!
//! The same settings can be loaded from JSON:
//!
//! ```json
//! { "max_length": 300, "samples_per_volume": [10, 20, 10], "num_workers": 4 }
//! ```
//!
//! # Memory and throughput
//! - `max_length`: a longer queue refills less often and mixes more subjects per
//!   refill, but holds more patches in RAM (see `PatchQueue::max_memory`).
//! - `samples_per_volume`: more patches per subject amortizes loading cost, fewer
//!   patches increase the variety inside the queue.
//! - `num_workers`: subjects prepared concurrently ahead of the consumer.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::error::QueueError;

/// Number of patches to draw from each subject per epoch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Value")]
pub enum SamplesPerVolume {
    /// The same quota for every subject.
    Uniform(usize),
    /// One quota per subject, in source order.
    PerSubject(Vec<usize>),
}

impl SamplesPerVolume {
    /// Interprets a dynamic value: an integer, or a list of integers.
    ///
    /// Anything else (negative numbers, floats, strings, nested lists, ...) is
    /// rejected with [`QueueError::InvalidQuotaType`].
    pub fn from_value(value: &Value) -> Result<Self, QueueError> {
        let invalid = || QueueError::InvalidQuotaType {
            found: value.to_string(),
        };
        match value {
            Value::Number(n) => n
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .map(Self::Uniform)
                .ok_or_else(invalid),
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_u64().and_then(|n| usize::try_from(n).ok()))
                .collect::<Option<Vec<_>>>()
                .map(Self::PerSubject)
                .ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }

    /// Expands to exactly one quota per subject.
    pub fn resolve(&self, num_subjects: usize) -> Result<Vec<usize>, QueueError> {
        match self {
            Self::Uniform(n) => Ok(vec![*n; num_subjects]),
            Self::PerSubject(quotas) if quotas.len() == num_subjects => Ok(quotas.clone()),
            Self::PerSubject(quotas) => Err(QueueError::QuotaLengthMismatch {
                expected: num_subjects,
                got: quotas.len(),
            }),
        }
    }
}

impl TryFrom<Value> for SamplesPerVolume {
    type Error = QueueError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(&value)
    }
}

impl From<usize> for SamplesPerVolume {
    fn from(n: usize) -> Self {
        Self::Uniform(n)
    }
}

impl From<Vec<usize>> for SamplesPerVolume {
    fn from(quotas: Vec<usize>) -> Self {
        Self::PerSubject(quotas)
    }
}

impl Default for SamplesPerVolume {
    fn default() -> Self {
        Self::Uniform(1)
    }
}

/// Configuration for `PatchQueue`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of patches held in the buffer (must be > 0)
    pub max_length: usize,
    /// Patches per subject per epoch
    pub samples_per_volume: SamplesPerVolume,
    /// Subjects prepared in parallel ahead of consumption (0 = on the calling thread)
    pub num_workers: usize,
    /// Visit subjects in a new random order every epoch
    pub shuffle_subjects: bool,
    /// Shuffle the buffer after every fill; otherwise patches come out in fill order
    pub shuffle_patches: bool,
    /// Create the subject stream at construction instead of on the first fill
    pub start_immediately: bool,
    /// Emit progress messages at debug level instead of trace level
    pub verbose: bool,
    /// Seed for subject order and patch shuffling. Drawn at random when `None`.
    pub seed: Option<u64>,
    /// Longest wait for one subject from the feeder workers. Default: 30s
    #[serde(with = "duration_secs")]
    pub worker_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_length: 1,
            samples_per_volume: SamplesPerVolume::default(),
            num_workers: 0,
            shuffle_subjects: true,
            shuffle_patches: true,
            start_immediately: true,
            verbose: false,
            seed: None,
            worker_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }

    /// Parses a JSON object. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse queue configuration")
    }
}

/// Builder for QueueConfig with method chaining
#[derive(Default)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    /// Set the buffer capacity (must be > 0)
    pub fn max_length(mut self, max_length: usize) -> Self {
        self.config.max_length = max_length;
        self
    }

    /// Set the per-subject quota: an integer for all subjects or one per subject
    pub fn samples_per_volume(mut self, samples: impl Into<SamplesPerVolume>) -> Self {
        self.config.samples_per_volume = samples.into();
        self
    }

    /// Set the number of feeder workers
    pub fn num_workers(mut self, workers: usize) -> Self {
        self.config.num_workers = workers;
        self
    }

    pub fn shuffle_subjects(mut self, shuffle: bool) -> Self {
        self.config.shuffle_subjects = shuffle;
        self
    }

    pub fn shuffle_patches(mut self, shuffle: bool) -> Self {
        self.config.shuffle_patches = shuffle;
        self
    }

    /// Set whether the subject stream starts during construction.
    pub fn start_immediately(mut self, start: bool) -> Self {
        self.config.start_immediately = start;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    /// Set the random seed for reproducible subject order and patch shuffling.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Set how long to wait for a prepared subject.
    ///
    /// - Too low: may fail during legitimately heavy preprocessing.
    /// - Too high: delays detection of stuck workers.
    pub fn worker_timeout(mut self, timeout: Duration) -> Self {
        self.config.worker_timeout = timeout;
        self
    }

    pub fn build(self) -> QueueConfig {
        self.config
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_defaults() {
        let config = QueueConfig::builder().max_length(8).build();
        assert_eq!(config.max_length, 8);
        assert_eq!(config.samples_per_volume, SamplesPerVolume::Uniform(1));
        assert_eq!(config.num_workers, 0);
        assert!(config.shuffle_subjects);
        assert!(config.shuffle_patches);
        assert!(config.start_immediately);
        assert!(!config.verbose);
        assert_eq!(config.worker_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_quota_from_value() {
        assert_eq!(
            SamplesPerVolume::from_value(&json!(4)),
            Ok(SamplesPerVolume::Uniform(4))
        );
        assert_eq!(
            SamplesPerVolume::from_value(&json!([1, 0, 3])),
            Ok(SamplesPerVolume::PerSubject(vec![1, 0, 3]))
        );

        for bad in [json!("4"), json!(2.5), json!(-1), json!([1, "a"]), json!({"n": 1}), json!(null)] {
            assert!(
                matches!(
                    SamplesPerVolume::from_value(&bad),
                    Err(QueueError::InvalidQuotaType { .. })
                ),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_quota_resolve() {
        assert_eq!(SamplesPerVolume::Uniform(2).resolve(3), Ok(vec![2, 2, 2]));
        assert_eq!(
            SamplesPerVolume::PerSubject(vec![1, 2]).resolve(3),
            Err(QueueError::QuotaLengthMismatch {
                expected: 3,
                got: 2
            })
        );
    }

    #[test]
    fn test_from_json() -> Result<()> {
        let config = QueueConfig::from_json_str(
            r#"{
                "max_length": 12,
                "samples_per_volume": [4, 8],
                "num_workers": 2,
                "shuffle_patches": false,
                "seed": 7,
                "worker_timeout": 1.5
            }"#,
        )?;
        assert_eq!(config.max_length, 12);
        assert_eq!(config.samples_per_volume, SamplesPerVolume::PerSubject(vec![4, 8]));
        assert_eq!(config.num_workers, 2);
        assert!(!config.shuffle_patches);
        assert!(config.shuffle_subjects);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.worker_timeout, Duration::from_millis(1500));
        Ok(())
    }

    #[test]
    fn test_from_json_rejects_bad_quota_type() {
        let err = QueueConfig::from_json_str(r#"{"max_length": 4, "samples_per_volume": "ten"}"#)
            .unwrap_err();
        assert!(format!("{:#}", err).contains("should be an integer or a list"));
    }
}
