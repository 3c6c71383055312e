//! Serialisable hand-off of a prepared boot image.
//!
//! The disk build writes `<stem>.boot.json` next to the image; building
//! install media later reads it back instead of preparing the boot image
//! again. Only plain data goes in here, never open devices or mounts.

use super::{BootImage, BootNames};
use crate::error::{Error, IoContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootImageSnapshot {
    pub version: u32,
    pub boot_root_directory: PathBuf,
    pub kernel_name: String,
    pub initrd_name: String,
    pub kernel_version: String,
    pub initrd_filename: Option<PathBuf>,
    pub has_initrd_support: bool,
}

impl BootImageSnapshot {
    pub fn from_boot_image(boot: &dyn BootImage) -> Result<Self> {
        let names = boot.get_boot_names()?;
        Ok(Self {
            version: SNAPSHOT_VERSION,
            boot_root_directory: boot.boot_root_directory().to_path_buf(),
            kernel_name: names.kernel_name,
            initrd_name: names.initrd_name,
            kernel_version: names.kernel_version,
            initrd_filename: boot.initrd_filename().map(Path::to_path_buf),
            has_initrd_support: boot.has_initrd_support(),
        })
    }

    /// `<target_dir>/<stem>.boot.json`
    pub fn path_for(target_dir: &Path, image_stem: &str) -> PathBuf {
        target_dir.join(format!("{}.boot.json", image_stem))
    }

    pub fn boot_names(&self) -> BootNames {
        BootNames {
            kernel_name: self.kernel_name.clone(),
            initrd_name: self.initrd_name.clone(),
            kernel_version: self.kernel_version.clone(),
        }
    }

    pub fn dump(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| Error::Snapshot {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        fs::write(path, json).at_path(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).at_path(path)?;
        let snapshot: BootImageSnapshot = serde_json::from_str(&text).map_err(|e| Error::Snapshot {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Snapshot {
                path: path.to_path_buf(),
                message: format!("unsupported snapshot version {}", snapshot.version),
            });
        }
        Ok(snapshot)
    }
}
