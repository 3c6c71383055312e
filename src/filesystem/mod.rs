//! Filesystem creation and data sync.
//!
//! One [`FileSystem`] value per partition. The kind decides which
//! formatting tool runs; read-only image kinds (squashfs, clicfs) can only
//! be created into a file from a source tree.

pub mod squashfs;

use crate::config::FilesystemKind;
use crate::error::{Error, IoContext, Result};
use crate::mount::MountManager;
use crate::process::Cmd;
use crate::storage::{DeviceHandle, MappedDevice};
use crate::utils::DataSync;
use squashfs::SquashfsOptions;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Extra arguments for one filesystem, built per call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemArgs {
    /// Passed to the formatting tool before the device.
    pub create_options: Vec<String>,
    /// Joined into `mount -o`.
    pub mount_options: Vec<String>,
    /// Compression for read-only images.
    pub compression: Option<String>,
}

#[derive(Debug)]
pub struct FileSystem {
    kind: FilesystemKind,
    device: Option<MappedDevice>,
    root_dir: PathBuf,
    args: FilesystemArgs,
    mount: Option<MountManager>,
}

impl FileSystem {
    /// Filesystem of `kind` on `device`, filled from `root_dir`.
    pub fn new(
        kind: FilesystemKind,
        device: Option<&dyn DeviceHandle>,
        root_dir: &Path,
        args: FilesystemArgs,
    ) -> Self {
        Self {
            kind,
            device: device.map(MappedDevice::from_handle),
            root_dir: root_dir.to_path_buf(),
            args,
            mount: None,
        }
    }

    pub fn kind(&self) -> FilesystemKind {
        self.kind
    }

    pub fn device(&self) -> Option<&MappedDevice> {
        self.device.as_ref()
    }

    fn require_device(&self) -> Result<&str> {
        self.device
            .as_ref()
            .map(|d| d.device.as_str())
            .ok_or_else(|| Error::precondition(format!("no device given for {} filesystem", self.kind)))
    }

    fn mkfs(&self, target: &str, label: Option<&str>, uuid: Option<&str>, blocks: Option<u64>) -> Result<()> {
        let mut cmd = match self.kind {
            FilesystemKind::Ext2 | FilesystemKind::Ext3 | FilesystemKind::Ext4 => {
                let mut cmd = Cmd::new(format!("mkfs.{}", self.kind.name())).arg("-F");
                if let Some(label) = label {
                    cmd = cmd.arg("-L").arg(label);
                }
                if let Some(uuid) = uuid {
                    cmd = cmd.arg("-U").arg(uuid);
                }
                cmd
            }
            FilesystemKind::Btrfs => {
                let mut cmd = Cmd::new("mkfs.btrfs").arg("-f");
                if let Some(label) = label {
                    cmd = cmd.arg("-L").arg(label);
                }
                if let Some(uuid) = uuid {
                    cmd = cmd.arg("-U").arg(uuid);
                }
                cmd
            }
            FilesystemKind::Xfs => {
                let mut cmd = Cmd::new("mkfs.xfs").arg("-f");
                if let Some(label) = label {
                    cmd = cmd.arg("-L").arg(label);
                }
                if let Some(uuid) = uuid {
                    cmd = cmd.arg("-m").arg(format!("uuid={}", uuid));
                }
                cmd
            }
            FilesystemKind::Fat16 | FilesystemKind::Fat32 => {
                let bits = if self.kind == FilesystemKind::Fat16 { "-F16" } else { "-F32" };
                let mut cmd = Cmd::new("mkdosfs").arg(bits).arg("-I");
                if let Some(label) = label {
                    cmd = cmd.arg("-n").arg(label);
                }
                cmd
            }
            FilesystemKind::Swap => {
                let mut cmd = Cmd::new("mkswap");
                if let Some(label) = label {
                    cmd = cmd.arg("-L").arg(label);
                }
                cmd
            }
            FilesystemKind::Squashfs | FilesystemKind::Clicfs => {
                return Err(Error::NotImplemented {
                    what: format!("{} on a block device", self.kind),
                });
            }
        };
        cmd = cmd.args(self.args.create_options.iter().cloned()).arg(target);
        if let Some(blocks) = blocks.filter(|_| self.kind.is_ext()) {
            cmd = cmd.arg(blocks.to_string());
        }
        cmd.error_msg(format!("Failed to create {} filesystem", self.kind))
            .run()?;
        Ok(())
    }

    /// Format the device.
    pub fn create_on_device(
        &self,
        label: Option<&str>,
        size_blocks: Option<u64>,
        uuid: Option<&str>,
    ) -> Result<()> {
        let device = self.require_device()?;
        info!("--> creating {} filesystem on {}", self.kind, device);
        self.mkfs(device, label, uuid, size_blocks)
    }

    /// Create the filesystem inside `filename`.
    ///
    /// Read-only image kinds are built from the root tree honoring
    /// `exclude`; other kinds get an empty filesystem in a file of
    /// `size_mbytes`.
    pub fn create_on_file(
        &self,
        filename: &Path,
        label: Option<&str>,
        exclude: &[String],
        size_mbytes: Option<u64>,
    ) -> Result<()> {
        match self.kind {
            FilesystemKind::Squashfs => {
                let options = SquashfsOptions {
                    compression: self.args.compression.as_deref().unwrap_or("xz"),
                    ..Default::default()
                };
                squashfs::build_squashfs(&self.root_dir, filename, &options, exclude)
            }
            FilesystemKind::Clicfs => squashfs::build_clicfs(&self.root_dir, filename),
            _ => {
                let mbytes = size_mbytes.ok_or_else(|| {
                    Error::precondition(format!("{} on file needs a size", self.kind))
                })?;
                let file = fs::File::create(filename).at_path(filename)?;
                file.set_len(mbytes * 1_048_576).at_path(filename)?;
                self.mkfs(&filename.to_string_lossy(), label, None, None)
            }
        }
    }

    /// Mount at a temporary directory and copy the root tree in.
    ///
    /// The filesystem stays mounted until [`FileSystem::umount`].
    pub fn sync_data(&mut self, exclude: &[String]) -> Result<()> {
        let device = self.require_device()?.to_string();
        if self.mount.is_none() {
            let mut mount = MountManager::new(device, None)?;
            mount.mount(&self.args.mount_options)?;
            self.mount = Some(mount);
        }
        if let Some(mount) = &self.mount {
            DataSync::new(&self.root_dir, mount.mountpoint()).sync_data(exclude)?;
        }
        Ok(())
    }

    pub fn mountpoint(&self) -> Option<&Path> {
        self.mount.as_ref().map(MountManager::mountpoint)
    }

    /// Unmount a sync mount, false when still busy.
    pub fn umount(&mut self) -> bool {
        match self.mount.as_mut() {
            Some(mount) => {
                let done = mount.release();
                if done {
                    self.mount = None;
                }
                done
            }
            None => true,
        }
    }

    /// Give the filesystem a new random UUID.
    pub fn set_uuid(&self) -> Result<()> {
        let device = self.require_device()?;
        let cmd = match self.kind {
            kind if kind.is_ext() => Cmd::new("tune2fs").args(["-f", "-U", "random"]),
            FilesystemKind::Btrfs => Cmd::new("btrfstune").args(["-f", "-u"]),
            FilesystemKind::Xfs => Cmd::new("xfs_admin").args(["-U", "generate"]),
            other => {
                warn!("setting a new UUID is not supported for {}, skipped", other);
                return Ok(());
            }
        };
        cmd.arg(device)
            .error_msg("Failed to set filesystem UUID")
            .run()?;
        Ok(())
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        if !self.umount() {
            warn!("{} filesystem still busy at teardown", self.kind);
        }
    }
}
