//! Btrfs subvolume and LVM logical volume management.
//!
//! Both backends follow the same life cycle:
//!
//! ```text
//! Uninitialized ──setup──> Setup ──create_volumes──> VolumesCreated
//!                                                        │ mount_volumes
//!                                                        v
//!                                    Umounted <──────> Mounted
//! ```
//!
//! The root volume configuration is validated when the manager is
//! constructed, so two root volumes fail before anything touches the disk.

pub mod btrfs;
pub mod lvm;

pub use btrfs::BtrfsVolumeManager;
pub use lvm::LvmVolumeManager;

use crate::config::{
    validate_volumes, FilesystemKind, ImageConfiguration, Persistency, VolumeManagerKind,
    VolumeSize, VolumeSpec,
};
use crate::defaults;
use crate::error::{Error, IoContext, Result};
use crate::process::Cmd;
use crate::storage::{DeviceHandle, DeviceMap, MappedDevice};
use crate::system::SystemSize;
use crate::utils::FstabEntry;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Uninitialized,
    Setup,
    VolumesCreated,
    Mounted,
    Umounted,
}

/// Settings taken from the image description, built per manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeManagerArgs {
    pub root_label: String,
    pub root_is_snapshot: bool,
    pub root_is_readonly_snapshot: bool,
    pub quota_groups: bool,
    pub mount_options: Vec<String>,
    pub volume_group_name: String,
    pub swap_mbytes: Option<u64>,
}

impl VolumeManagerArgs {
    pub fn from_config(config: &ImageConfiguration) -> Self {
        Self {
            root_label: config.root_label().to_string(),
            root_is_snapshot: config.btrfs_root_is_snapshot,
            root_is_readonly_snapshot: config.btrfs_root_is_readonly_snapshot,
            quota_groups: config.btrfs_quota_groups,
            mount_options: config
                .fs_mount_options
                .as_deref()
                .map(|o| o.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            volume_group_name: config.volume_group_name().to_string(),
            swap_mbytes: config.swap_mbytes,
        }
    }
}

/// Operations shared by all volume manager backends.
pub trait VolumeManager {
    /// Create the container on the root device and mount its top level.
    fn setup(&mut self) -> Result<()>;

    /// Create every configured non-root volume, parents first.
    fn create_volumes(&mut self, filesystem: FilesystemKind) -> Result<()>;

    /// fstab entries for the managed volumes.
    fn get_fstab(&self, persistency: Persistency, filesystem: FilesystemKind) -> Result<Vec<FstabEntry>>;

    /// Role to device node for the volumes this manager provides.
    fn get_device(&self) -> DeviceMap;

    fn mount_volumes(&mut self) -> Result<()>;

    /// Unmount in reverse order. False if anything stayed busy.
    fn umount_volumes(&mut self) -> bool;

    /// Copy the root tree into the volumes.
    fn sync_data(&mut self, exclude: &[String]) -> Result<()>;

    fn set_property_readonly_root(&mut self) -> Result<()>;

    /// Top level mount directory.
    fn mountpoint(&self) -> Option<&Path>;

    /// Directory that receives the root tree.
    fn root_path(&self) -> Option<PathBuf>;

    fn state(&self) -> VolumeState;

    /// Unmount and remove the mount directory if nothing is busy.
    fn release(&mut self) -> bool;
}

/// Volume manager for `kind` on the root device.
pub fn new_volume_manager(
    kind: VolumeManagerKind,
    root_device: &dyn DeviceHandle,
    root_dir: &Path,
    volumes: &[VolumeSpec],
    args: VolumeManagerArgs,
) -> Result<Box<dyn VolumeManager>> {
    let base = VolumeBase::new(root_device, root_dir, volumes, args)?;
    Ok(match kind {
        VolumeManagerKind::Btrfs => Box::new(BtrfsVolumeManager::new(base)),
        VolumeManagerKind::Lvm => Box::new(LvmVolumeManager::new(base)),
    })
}

/// State shared by the backends.
#[derive(Debug)]
pub struct VolumeBase {
    device: MappedDevice,
    root_dir: PathBuf,
    volumes: Vec<VolumeSpec>,
    args: VolumeManagerArgs,
    mountpoint: Option<PathBuf>,
    state: VolumeState,
}

impl VolumeBase {
    pub fn new(
        root_device: &dyn DeviceHandle,
        root_dir: &Path,
        volumes: &[VolumeSpec],
        args: VolumeManagerArgs,
    ) -> Result<Self> {
        validate_volumes(volumes)?;
        Ok(Self {
            device: MappedDevice::from_handle(root_device),
            root_dir: root_dir.to_path_buf(),
            volumes: volumes.to_vec(),
            args,
            mountpoint: None,
            state: VolumeState::Uninitialized,
        })
    }

    fn require_state(&self, allowed: &[VolumeState], operation: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(Error::VolumeSetup {
            message: format!("{} is not possible in state {:?}", operation, self.state),
        })
    }

    fn setup_mountpoint(&mut self) -> Result<PathBuf> {
        if let Some(path) = &self.mountpoint {
            return Ok(path.clone());
        }
        let dir = tempfile::Builder::new()
            .prefix("image-volumes.")
            .tempdir()
            .at_path(std::env::temp_dir())?
            .into_path();
        self.mountpoint = Some(dir.clone());
        Ok(dir)
    }

    fn require_mountpoint(&self) -> Result<PathBuf> {
        self.mountpoint.clone().ok_or_else(|| Error::VolumeSetup {
            message: "volume manager is not set up".to_string(),
        })
    }

    fn remove_mountpoint(&mut self) {
        if let Some(path) = self.mountpoint.take() {
            if let Err(e) = fs::remove_dir_all(&path) {
                warn!("could not remove {}: {}", path.display(), e);
            }
        }
    }

    /// Non-root volumes sorted parents first, and the volume taking all
    /// remaining space if one is configured.
    fn canonical_volume_list(&self) -> (Vec<VolumeSpec>, Option<VolumeSpec>) {
        let mut volumes: Vec<VolumeSpec> = Vec::new();
        let mut full_size = None;
        for volume in self.volumes.iter().filter(|v| !v.root) {
            if volume.size == VolumeSize::All && full_size.is_none() {
                full_size = Some(volume.clone());
            } else {
                volumes.push(volume.clone());
            }
        }
        volumes.sort_by(|a, b| {
            let (pa, pb) = (a.realpath(), b.realpath());
            pa.matches('/').count().cmp(&pb.matches('/').count()).then(pa.cmp(&pb))
        });
        (volumes, full_size)
    }

    fn root_volume(&self) -> Option<&VolumeSpec> {
        self.volumes.iter().find(|v| v.root)
    }

    /// Create missing volume paths in the source tree.
    fn create_volume_paths_in_root_dir(&self) -> Result<()> {
        for volume in self.volumes.iter().filter(|v| !v.root) {
            let path = self.root_dir.join(volume.realpath());
            if !path.exists() {
                fs::create_dir_all(&path).at_path(&path)?;
            }
        }
        Ok(())
    }

    fn apply_attributes_on_volume(&self, toplevel: &Path, volume: &VolumeSpec) -> Result<()> {
        if volume.nocow {
            info!("--> setting no-copy-on-write for {}", volume.realpath());
            Cmd::new("chattr")
                .arg("+C")
                .arg_path(&toplevel.join(volume.realpath()))
                .error_msg("Failed to disable copy-on-write")
                .run()?;
        }
        Ok(())
    }

    /// Size of a volume in megabytes.
    ///
    /// Free space sizes add the data below the volume path (without nested
    /// volumes) plus the minimum volume slack.
    fn get_volume_mbsize(&self, volume: &VolumeSpec, filesystem: FilesystemKind) -> Result<u64> {
        let (mut mbsize, freespace) = match volume.size {
            VolumeSize::Fixed(n) => (n, false),
            VolumeSize::Freespace(n) => (n, true),
            VolumeSize::All => (0, true),
        };
        let lookup = volume.realpath();
        let path = self.root_dir.join(&lookup);
        if !freespace || !path.exists() {
            return Ok(mbsize.max(if freespace { defaults::MIN_VOLUME_MBYTES } else { 0 }));
        }

        let exclude: Vec<String> = self
            .volumes
            .iter()
            .filter(|v| !v.root && v.realpath() != lookup)
            .map(VolumeSpec::realpath)
            .filter_map(|other| {
                if lookup.is_empty() {
                    Some(other)
                } else {
                    other
                        .strip_prefix(&format!("{}/", lookup))
                        .map(str::to_string)
                }
            })
            .collect();

        let size = SystemSize::new(&path);
        if mbsize != defaults::MIN_VOLUME_MBYTES {
            mbsize += defaults::MIN_VOLUME_MBYTES;
        }
        mbsize += size.customize(size.accumulate_mbyte_file_sizes(&exclude)?, filesystem)?;
        Ok(mbsize)
    }

    /// `UUID=..`, `LABEL=..` or `PARTUUID=..` for the root device.
    fn device_spec(&self, persistency: Persistency) -> Result<String> {
        let id = crate::storage::block_id(&self.device.device, persistency.blkid_type())?;
        Ok(format!("{}={}", persistency.blkid_type(), id))
    }

    fn mount_options_with(&self, first: &str) -> Vec<String> {
        std::iter::once(first.to_string())
            .chain(self.args.mount_options.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn volume(name: &str, path: Option<&str>, size: VolumeSize) -> VolumeSpec {
        VolumeSpec {
            name: name.to_string(),
            path: path.map(str::to_string),
            size,
            root: false,
            nocow: false,
            label: None,
        }
    }

    #[test]
    fn test_two_roots_fail_before_any_command() {
        let mut a = volume("a", None, VolumeSize::default());
        a.root = true;
        let mut b = volume("b", None, VolumeSize::default());
        b.root = true;
        let (runner, _guard) = crate::process::testing::RecordingRunner::install();
        let result = new_volume_manager(
            VolumeManagerKind::Btrfs,
            &MappedDevice::new("/dev/mapper/loop0p2", true),
            Path::new("/build/root"),
            &[a, b],
            VolumeManagerArgs::default(),
        );
        assert!(matches!(result, Err(Error::VolumeSetup { .. })));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_canonical_order_parents_first() {
        let volumes = vec![
            volume("log", Some("var/log"), VolumeSize::default()),
            volume("home", None, VolumeSize::All),
            volume("var", None, VolumeSize::default()),
            volume("audit", Some("var/log/audit"), VolumeSize::default()),
        ];
        let base = VolumeBase::new(
            &MappedDevice::new("/dev/sda2", false),
            Path::new("/build/root"),
            &volumes,
            VolumeManagerArgs::default(),
        )
        .unwrap();
        let (sorted, full) = base.canonical_volume_list();
        let paths: Vec<_> = sorted.iter().map(VolumeSpec::realpath).collect();
        assert_eq!(paths, vec!["var", "var/log", "var/log/audit"]);
        assert_eq!(full.unwrap().name, "home");
    }

    #[test]
    fn test_volume_size_excludes_nested_volumes() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("var/log")).unwrap();
        fs::write(root.path().join("var/data"), vec![0u8; 4 * 1_048_576]).unwrap();
        fs::write(root.path().join("var/log/big"), vec![0u8; 20 * 1_048_576]).unwrap();
        let volumes = vec![
            volume("var", None, VolumeSize::Freespace(100)),
            volume("log", Some("var/log"), VolumeSize::Fixed(200)),
        ];
        let base = VolumeBase::new(
            &MappedDevice::new("/dev/sda2", false),
            root.path(),
            &volumes,
            VolumeManagerArgs::default(),
        )
        .unwrap();
        // 100 + 30 slack + 4 MB data * 1.5 for xfs
        assert_eq!(base.get_volume_mbsize(&volumes[0], FilesystemKind::Xfs).unwrap(), 136);
        assert_eq!(base.get_volume_mbsize(&volumes[1], FilesystemKind::Xfs).unwrap(), 200);
    }
}
