pub mod config;
pub mod dataset;
pub mod error;
pub mod feeder;
pub mod memory;
pub mod queue;
pub mod sampler;
pub mod subject;
pub mod transform;

pub use config::{QueueConfig, QueueConfigBuilder, SamplesPerVolume};
pub use dataset::{SubjectSource, SubjectsDataset};
pub use error::{QueueError, QueueWarning};
pub use feeder::{SubjectFeeder, SubjectStream};
pub use memory::{format_memory, max_memory_bytes};
pub use queue::{EpochIter, FillReport, PatchQueue};
pub use sampler::{PatchSampler, PatchStream, UniformSampler};
pub use subject::{Image, ImageKind, Patch, Subject};
pub use transform::{RescaleIntensity, Transform};
