//! Disk geometry planning.
//!
//! Everything here runs before the first partition is written: the total
//! disk size is the sum of the root data (with filesystem overhead) and
//! every fixed region the firmware and layout ask for.

use crate::config::{BootloaderKind, ImageConfiguration, VolumeManagerKind, VolumeSize};
use crate::defaults;
use crate::error::{Error, Result};
use crate::firmware::Firmware;
use crate::system::SystemSize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Size planner for one image description and root tree.
#[derive(Debug)]
pub struct DiskSetup<'a> {
    config: &'a ImageConfiguration,
    firmware: &'a Firmware,
    root_dir: PathBuf,
}

impl<'a> DiskSetup<'a> {
    pub fn new(config: &'a ImageConfiguration, firmware: &'a Firmware, root_dir: &Path) -> Self {
        Self {
            config,
            firmware,
            root_dir: root_dir.to_path_buf(),
        }
    }

    /// Whether the layout needs a separate `/boot` partition.
    pub fn need_boot_partition(&self) -> bool {
        if let Some(requested) = self.config.boot_partition {
            return requested;
        }
        // zipl reads its config and kernel from a partition of its own
        if self.config.bootloader == BootloaderKind::Zipl {
            return true;
        }
        if self.config.raid.is_some() {
            return true;
        }
        match self.config.volume_manager {
            Some(VolumeManagerKind::Lvm) => return true,
            Some(VolumeManagerKind::Btrfs) => return false,
            None => {}
        }
        self.config.overlay_root
    }

    pub fn boot_partition_size(&self) -> u64 {
        if !self.need_boot_partition() {
            return 0;
        }
        self.config
            .boot_partition_mbytes
            .unwrap_or(defaults::BOOT_PARTITION_MBYTES)
    }

    /// Boot partition and its clones.
    pub fn boot_partitions_mbytes(&self) -> u64 {
        self.boot_partition_size() * (u64::from(self.config.boot_clone_count) + 1)
    }

    pub fn get_boot_label(&self) -> &'static str {
        defaults::BOOT_LABEL
    }

    pub fn get_root_label(&self) -> &str {
        self.config.root_label()
    }

    pub fn get_efi_label(&self) -> &'static str {
        defaults::EFI_LABEL
    }

    /// Root data size plus filesystem overhead.
    pub fn root_filesystem_mbytes(&self) -> Result<u64> {
        let size = SystemSize::new(&self.root_dir);
        size.customize(size.accumulate_mbyte_file_sizes(&[])?, self.config.filesystem)
    }

    /// Required disk size without any configured override.
    pub fn calculate_disk_mbytes(&self) -> Result<u64> {
        info!("Precalculating required disk size");
        let mut total = 0u64;
        let mut add = |what: &str, mbytes: u64| {
            if mbytes > 0 {
                info!("--> {} adding {} MB", what, mbytes);
                total += mbytes;
            }
        };

        let root_mbytes = self.root_filesystem_mbytes()?;
        let copies = u64::from(self.config.root_clone_count) + 1;
        add("system data with filesystem overhead", root_mbytes * copies);

        add("custom partitions", self.custom_partitions_mbytes()?);

        if self.config.volume_manager == Some(VolumeManagerKind::Lvm) {
            add("LVM overhead", defaults::LVM_OVERHEAD_MBYTES);
            add("volume(s) size setup", self.accumulate_volume_size(root_mbytes)?);
            add("swap volume", self.config.swap_mbytes.unwrap_or(0));
        } else {
            if self.config.volume_manager == Some(VolumeManagerKind::Btrfs) {
                add("volume(s) size setup", self.accumulate_volume_size(root_mbytes)?);
            }
            add("swap partition", self.config.swap_mbytes.unwrap_or(0));
        }

        add("legacy bios boot partition", self.firmware.legacy_bios_partition_mbytes());
        add("boot partition(s)", self.boot_partitions_mbytes());
        add("spare partition", self.config.spare.as_ref().map_or(0, |s| s.mbytes));
        add("EFI partition", self.firmware.efi_partition_mbytes());
        add("PReP partition", self.firmware.prep_partition_mbytes());
        add("in-place recovery partition", self.inplace_recovery_partition_size()?);
        Ok(total)
    }

    /// Planned disk size honoring a configured override.
    pub fn get_disksize_mbytes(&self) -> Result<u64> {
        let calculated = self.calculate_disk_mbytes()?;
        Ok(self.apply_configured_size(calculated))
    }

    fn apply_configured_size(&self, calculated: u64) -> u64 {
        match self.config.size {
            None => {
                info!("Using calculated disk size: {} MB", calculated);
                calculated
            }
            Some(size) if size.additive => {
                let result = size.mbytes + calculated;
                info!(
                    "Using configured disk size: {} MB + {} MB calculated = {} MB",
                    size.mbytes, calculated, result
                );
                result
            }
            Some(size) => {
                info!("Using configured disk size: {} MB", size.mbytes);
                if size.mbytes < calculated {
                    warn!(
                        "--> Configured size smaller than calculated size: {} MB",
                        calculated
                    );
                }
                size.mbytes
            }
        }
    }

    /// Fixed size each root clone partition gets.
    pub fn root_clone_mbytes(&self, disk_mbytes: u64, used_mbytes: u64) -> u64 {
        let copies = u64::from(self.config.root_clone_count) + 1;
        disk_mbytes.saturating_sub(used_mbytes) / copies + defaults::MIN_PARTITION_SLACK_MBYTES
    }

    /// Custom partition sizes beyond the data already counted for root.
    fn custom_partitions_mbytes(&self) -> Result<u64> {
        let mut total = 0;
        for (name, partition) in &self.config.partitions {
            let data_mbytes = match &partition.mountpoint {
                Some(mountpoint) => self.path_mbytes(mountpoint, partition.filesystem)?,
                None => 0,
            };
            if partition.mbytes < data_mbytes {
                return Err(Error::SizingViolation {
                    name: format!("partition {}", name),
                    configured_mbytes: partition.mbytes,
                    required_mbytes: data_mbytes,
                });
            }
            total += partition.mbytes - data_mbytes;
        }
        Ok(total)
    }

    /// Extra space the configured volume sizes need on top of the root data.
    fn accumulate_volume_size(&self, root_mbytes: u64) -> Result<u64> {
        let mut total = 0;
        let mut data_total = 0;
        for volume in self.config.volumes.iter().filter(|v| !v.root) {
            let realpath = volume.realpath();
            let data_mbytes = self.path_mbytes(&realpath, self.config.filesystem)?;
            data_total += data_mbytes;
            match volume.size {
                VolumeSize::Freespace(mbytes) => total += mbytes + defaults::MIN_VOLUME_MBYTES,
                VolumeSize::Fixed(mbytes) => {
                    if mbytes < data_mbytes {
                        return Err(Error::SizingViolation {
                            name: format!("volume {}", volume.name),
                            configured_mbytes: mbytes,
                            required_mbytes: data_mbytes,
                        });
                    }
                    total += mbytes - data_mbytes;
                }
                VolumeSize::All => {}
            }
        }

        if let Some(root) = self.config.volumes.iter().find(|v| v.root) {
            match root.size {
                VolumeSize::Freespace(mbytes) => total += mbytes + defaults::MIN_VOLUME_MBYTES,
                VolumeSize::Fixed(mbytes) => {
                    let required = root_mbytes.saturating_sub(data_total);
                    if mbytes < required {
                        return Err(Error::SizingViolation {
                            name: format!("volume {}", root.name),
                            configured_mbytes: mbytes,
                            required_mbytes: required,
                        });
                    }
                    total += mbytes - required;
                }
                VolumeSize::All => {}
            }
        }
        Ok(total)
    }

    fn inplace_recovery_partition_size(&self) -> Result<u64> {
        if !self.config.inplace_recovery {
            return Ok(0);
        }
        let archive = self.root_dir.join(defaults::RECOVERY_ARCHIVE_NAME);
        if !archive.exists() {
            return Ok(0);
        }
        let bytes = fs::metadata(&archive)
            .map_err(|e| Error::io(&archive, e))?
            .len();
        let mbytes = bytes as f64 / 1_048_576.0;
        Ok((mbytes * defaults::INPLACE_RECOVERY_FACTOR) as u64)
    }

    /// Data size below `relpath` with overhead, 0 if the path is missing.
    fn path_mbytes(&self, relpath: &str, filesystem: crate::config::FilesystemKind) -> Result<u64> {
        let path = self.root_dir.join(relpath.trim_start_matches('/'));
        if !path.exists() {
            return Ok(0);
        }
        let size = SystemSize::new(path);
        size.customize(size.accumulate_mbyte_file_sizes(&[])?, filesystem)
    }
}
