//! `PatchQueue` with feeder workers (`num_workers > 0`).
//!
//! Tests cover:
//! - Subject order and quotas are the same as on the consumer thread
//! - Subjects are prepared on worker threads, each exactly once per epoch
//! - Failures inside workers (errors, panics, timeouts) surface from `pop`
//! - Dropping a queue mid-epoch shuts its workers down

mod common;
use common::{fifo_config, make_subjects, tag, CountingTransform, FailingSource, TagSampler};
use patch_queue::{
    feeder::thread::current_worker_id, PatchQueue, QueueConfig, SamplesPerVolume, Subject,
    SubjectFeeder, SubjectSource, SubjectsDataset, Transform,
};

use anyhow::Result;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn worker_config(max_length: usize, quota: SamplesPerVolume, num_workers: usize) -> QueueConfig {
    let mut config = fifo_config(max_length, quota);
    config.num_workers = num_workers;
    config.worker_timeout = Duration::from_secs(10);
    config
}

/// Records which worker prepared each subject.
#[derive(Clone, Default)]
struct RecordWorker {
    seen: Arc<Mutex<Vec<Option<usize>>>>,
}

impl Transform<Subject, Subject> for RecordWorker {
    fn apply(&self, subject: Subject) -> Result<Subject> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(current_worker_id());
        }
        Ok(subject)
    }
}

// ============================================================================
// 1. Ordering and Quotas
// ============================================================================

#[test]
fn test_workers_preserve_fill_order() -> Result<()> {
    let dataset = Arc::new(SubjectsDataset::new(make_subjects(6)));
    let quota = SamplesPerVolume::PerSubject(vec![2, 1, 3, 1, 2, 1]);

    let mut inline = PatchQueue::new(dataset.clone(), TagSampler, fifo_config(4, quota.clone()))?;
    let mut parallel = PatchQueue::new(dataset, TagSampler, worker_config(4, quota, 3))?;

    for _ in 0..30 {
        assert_eq!(tag(&inline.pop()?), tag(&parallel.pop()?));
    }
    Ok(())
}

#[test]
fn test_shuffled_epochs_with_workers_honour_quotas() -> Result<()> {
    let dataset = Arc::new(SubjectsDataset::new(make_subjects(8)));
    let config = QueueConfig::builder()
        .max_length(6)
        .samples_per_volume(SamplesPerVolume::Uniform(3))
        .num_workers(4)
        .seed(77)
        .build();
    let mut queue = PatchQueue::new(dataset, TagSampler, config)?;

    for _ in 0..3 {
        let mut counts = vec![0usize; 8];
        for patch in queue.epoch_iter() {
            counts[tag(&patch?).0] += 1;
        }
        assert_eq!(counts, vec![3; 8]);
    }
    Ok(())
}

#[test]
fn test_each_subject_prepared_once_per_epoch_on_workers() -> Result<()> {
    let recorder = RecordWorker::default();
    let counter = CountingTransform::new(Duration::from_millis(5));
    let dataset = SubjectsDataset::new(make_subjects(5))
        .with_transform(recorder.clone().then(counter.clone()));
    let mut queue = PatchQueue::new(
        Arc::new(dataset),
        TagSampler,
        worker_config(2, SamplesPerVolume::Uniform(2), 2),
    )?;

    queue.epoch_iter().collect::<Result<Vec<_>>>()?;
    queue.epoch_iter().collect::<Result<Vec<_>>>()?;
    drop(queue);

    assert_eq!(counter.count(), 10);
    let seen = recorder.seen.lock().map(|s| s.clone()).unwrap_or_default();
    assert_eq!(seen.len(), 10);
    let workers: HashSet<_> = seen.iter().copied().collect();
    assert!(workers.iter().all(|id| matches!(id, Some(0) | Some(1))));
    Ok(())
}

#[test]
fn test_slow_preparation_overlaps_across_workers() -> Result<()> {
    let counter = CountingTransform::new(Duration::from_millis(100));
    let dataset = SubjectsDataset::new(make_subjects(4)).with_transform(counter.clone());
    let mut queue = PatchQueue::new(
        Arc::new(dataset),
        TagSampler,
        worker_config(4, SamplesPerVolume::Uniform(1), 4),
    )?;

    let start = Instant::now();
    queue.fill()?;
    // Four 100ms subjects on four workers take well under 400ms.
    assert!(start.elapsed() < Duration::from_millis(350), "{:?}", start.elapsed());
    assert_eq!(counter.count(), 4);
    Ok(())
}

// ============================================================================
// 2. Worker Failures
// ============================================================================

#[test]
fn test_worker_error_surfaces_from_pop() -> Result<()> {
    let source = FailingSource {
        inner: SubjectsDataset::new(make_subjects(4)),
        bad_index: 2,
    };
    let mut queue = PatchQueue::new(
        Arc::new(source),
        TagSampler,
        worker_config(4, SamplesPerVolume::Uniform(1), 2),
    )?;

    let err = queue.pop().unwrap_err();
    let msg = format!("{:#}", err);
    assert!(msg.contains("failed to prepare subject 2"), "{}", msg);
    assert!(msg.contains("corrupted volume 2"), "{}", msg);
    Ok(())
}

#[test]
fn test_worker_panic_surfaces_from_pop() -> Result<()> {
    struct Panicking;
    impl SubjectSource for Panicking {
        fn len(&self) -> usize {
            2
        }
        fn get(&self, index: usize) -> Result<Subject> {
            if index == 0 {
                panic!("segfault in reader");
            }
            Ok(Subject::default().with_metadata("id", index.to_string()))
        }
    }

    let mut queue = PatchQueue::new(
        Arc::new(Panicking),
        TagSampler,
        worker_config(2, SamplesPerVolume::Uniform(1), 2),
    )?;
    let msg = format!("{:#}", queue.pop().unwrap_err());
    assert!(msg.contains("panicked while preparing subject 0"), "{}", msg);
    Ok(())
}

#[test]
fn test_worker_timeout() -> Result<()> {
    let counter = CountingTransform::new(Duration::from_millis(500));
    let dataset = SubjectsDataset::new(make_subjects(2)).with_transform(counter);
    let mut config = worker_config(2, SamplesPerVolume::Uniform(1), 1);
    config.worker_timeout = Duration::from_millis(50);
    let mut queue = PatchQueue::new(Arc::new(dataset), TagSampler, config)?;

    let msg = format!("{:#}", queue.pop().unwrap_err());
    assert!(msg.contains("Worker timeout"), "{}", msg);
    Ok(())
}

// ============================================================================
// 3. Lifecycle
// ============================================================================

#[test]
fn test_drop_mid_epoch_joins_workers() -> Result<()> {
    let counter = CountingTransform::new(Duration::from_millis(20));
    let dataset = SubjectsDataset::new(make_subjects(10)).with_transform(counter.clone());
    let mut queue = PatchQueue::new(
        Arc::new(dataset),
        TagSampler,
        worker_config(2, SamplesPerVolume::Uniform(1), 3),
    )?;

    queue.pop()?;
    drop(queue);

    // Workers are joined: nothing is prepared after the drop returns.
    let after_drop = counter.count();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(counter.count(), after_drop);
    assert!(after_drop < 10);
    Ok(())
}

/// Sleeps while preparing subject 0.
struct StuckFirst;

impl SubjectSource for StuckFirst {
    fn len(&self) -> usize {
        3
    }

    fn get(&self, index: usize) -> Result<Subject> {
        if index == 0 {
            std::thread::sleep(Duration::from_millis(300));
        }
        Ok(Subject::default().with_metadata("id", index.to_string()))
    }
}

#[test]
fn test_drop_after_worker_timeouts_does_not_hang() -> Result<()> {
    let mut config = worker_config(3, SamplesPerVolume::Uniform(1), 1);
    config.worker_timeout = Duration::from_millis(50);
    let mut queue = PatchQueue::new(Arc::new(StuckFirst), TagSampler, config)?;

    // Retrying after a timeout must not leave a worker blocked on its result.
    assert!(queue.pop().is_err());
    assert!(queue.pop().is_err());
    std::thread::sleep(Duration::from_millis(500));

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    std::thread::spawn(move || {
        drop(queue);
        let _ = done_tx.send(());
    });
    assert!(
        done_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
        "dropping the queue hung after worker timeouts"
    );
    Ok(())
}

#[test]
fn test_stream_drop_after_worker_timeouts_does_not_hang() -> Result<()> {
    let feeder = SubjectFeeder::new(Arc::new(StuckFirst), 1, false, 0, Duration::from_millis(50))?;
    let mut stream = feeder.stream(0)?;
    assert!(stream.next().is_some_and(|r| r.is_err()));
    assert!(stream.next().is_some_and(|r| r.is_err()));
    std::thread::sleep(Duration::from_millis(500));

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    std::thread::spawn(move || {
        drop(stream);
        let _ = done_tx.send(());
    });
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    Ok(())
}

#[test]
fn test_lazy_start_spawns_workers_on_first_fill() -> Result<()> {
    let counter = CountingTransform::new(Duration::ZERO);
    let dataset = SubjectsDataset::new(make_subjects(3)).with_transform(counter.clone());
    let mut config = worker_config(3, SamplesPerVolume::Uniform(1), 2);
    config.start_immediately = false;
    let mut queue = PatchQueue::new(Arc::new(dataset), TagSampler, config)?;

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(counter.count(), 0);
    assert!(queue.subject_order().is_none());

    let report = queue.fill()?;
    assert!(report.epoch_started);
    assert_eq!(report.patches_added, 3);
    assert_eq!(counter.count(), 3);
    Ok(())
}
