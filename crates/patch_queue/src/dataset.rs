use crate::error::QueueError;
use crate::subject::Subject;
use crate::transform::Transform;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// An indexable, length-known collection of subjects.
///
/// `get` is where loading and preprocessing happen, so it may be slow and it may
/// fail. The feeder calls it either on the consumer thread or inside its worker
/// pool. Implementations must be `Send + Sync` because the same source is shared
/// (read-only) by every worker and by any number of queues.
pub trait SubjectSource: Send + Sync {
    /// Number of subjects.
    fn len(&self) -> usize;

    /// Loads and prepares the subject at `index`.
    fn get(&self, index: usize) -> Result<Subject>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: SubjectSource + ?Sized> SubjectSource for Arc<S> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> Result<Subject> {
        (**self).get(index)
    }
}

/// Subjects held in memory as `Arc<[Subject]>`, with an optional preprocessing step.
///
/// - Cloning only bumps reference counts.
/// - Every `get` hands out a cheap clone of the stored subject and runs the transform
///   on it, so the stored subjects are never modified.
#[derive(Clone)]
pub struct SubjectsDataset {
    subjects: Arc<[Subject]>,
    transform: Option<Arc<dyn Transform<Subject, Subject>>>,
    metadata: HashMap<String, String>,
}

impl SubjectsDataset {
    pub fn new(subjects: Vec<Subject>) -> Self {
        Self {
            subjects: subjects.into(),
            transform: None,
            metadata: HashMap::new(),
        }
    }

    /// Sets the preprocessing applied on every `get`.
    pub fn with_transform<T>(mut self, transform: T) -> Self
    where
        T: Transform<Subject, Subject> + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Adds/updates metadata, e.g. `dataset.with_metadata("split", "train")`.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|s| s.as_str())
    }

    /// The stored subject, before preprocessing.
    pub fn raw(&self, index: usize) -> Option<&Subject> {
        self.subjects.get(index)
    }
}

impl fmt::Debug for SubjectsDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubjectsDataset")
            .field("num_subjects", &self.subjects.len())
            .field("has_transform", &self.transform.is_some())
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl SubjectSource for SubjectsDataset {
    fn len(&self) -> usize {
        self.subjects.len()
    }

    fn get(&self, index: usize) -> Result<Subject> {
        let subject = self
            .subjects
            .get(index)
            .cloned()
            .ok_or(QueueError::SubjectOutOfRange {
                index,
                len: self.subjects.len(),
            })?;

        match &self.transform {
            Some(transform) => transform
                .apply(subject)
                .with_context(|| format!("Failed to preprocess subject {}", index)),
            None => Ok(subject),
        }
    }
}
