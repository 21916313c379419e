//! Samplers.
//!
//! - [`index`]: the order in which subjects are visited in an epoch.
//! - [`patch`]: how patches are cut out of one subject.

pub mod index;
pub mod patch;

pub use index::{IndexSampler, RandomSampler, SequentialSampler};
pub use patch::{PatchSampler, PatchStream, UniformSampler};
