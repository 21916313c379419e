//! Worst-case memory footprint of a full patch buffer.
//!
//! Every voxel is assumed to be a 32-bit float. All images of the reference subject
//! count, labels included, because the sampler crops all of them.

use humansize::{format_size, BINARY};

use crate::subject::Subject;

/// Bytes per stored voxel.
pub const BYTES_PER_VOXEL: u64 = 4;

/// `4 * prod(patch_size) * channels(subject) * max_length`.
pub fn max_memory_bytes(patch_size: [usize; 3], subject: &Subject, max_length: usize) -> u64 {
    let channels = subject.num_channels(false) as u64;
    let patch_voxels: u64 = patch_size.iter().map(|&s| s as u64).product();
    let bytes_per_patch = BYTES_PER_VOXEL * patch_voxels * channels;
    bytes_per_patch * max_length as u64
}

/// Binary-prefixed rendering, e.g. `"3 MiB"`.
pub fn format_memory(bytes: u64) -> String {
    format_size(bytes, BINARY)
}
