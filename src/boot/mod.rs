//! Boot image: kernel, initrd and the tree they come from.
//!
//! The disk builder only needs the file names and an initrd; how the
//! initrd is produced is up to the implementation.

pub mod dracut;
pub mod snapshot;

pub use dracut::DracutBootImage;
pub use snapshot::BootImageSnapshot;

use crate::error::Result;
use crate::system::SystemIdentifier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File names below `boot/` of the boot root directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootNames {
    pub kernel_name: String,
    pub initrd_name: String,
    pub kernel_version: String,
}

pub trait BootImage {
    /// Check the boot root and get ready for `create_initrd`.
    fn prepare(&mut self) -> Result<()>;

    /// Tree holding `boot/` and `lib/modules`.
    fn boot_root_directory(&self) -> &Path;

    fn has_initrd_support(&self) -> bool;

    fn get_boot_names(&self) -> Result<BootNames>;

    /// Build the initrd. With an identifier the initrd carries `boot/mbrid`.
    fn create_initrd(&mut self, mbrid: Option<&SystemIdentifier>) -> Result<PathBuf>;

    /// Extra file (absolute inside the boot root) for the initrd.
    fn include_file(&mut self, path: &str);

    /// Path of the last initrd built.
    fn initrd_filename(&self) -> Option<&Path>;
}
