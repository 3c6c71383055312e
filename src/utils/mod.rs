//! Small helpers used across the pipeline.

pub mod checksum;
pub mod compress;
pub mod fs;
pub mod fstab;
pub mod signature;
pub mod sync;
pub mod verity;

pub use fstab::{Fstab, FstabEntry};
pub use sync::DataSync;
