//! Btrfs subvolumes below a top level `@` subvolume.

use super::{VolumeBase, VolumeManager, VolumeState};
use crate::config::{FilesystemKind, Persistency};
use crate::error::{Error, IoContext, Result};
use crate::filesystem::{FileSystem, FilesystemArgs};
use crate::mount::{MountManager, RetryPolicy};
use crate::process::Cmd;
use crate::storage::{role, DeviceMap};
use crate::utils::{DataSync, FstabEntry};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const SNAPSHOT_PATH: &str = "@/.snapshots/1/snapshot";

/// Subvolume mounted as `/` by default.
pub fn default_volume_name(root_is_snapshot: bool) -> &'static str {
    if root_is_snapshot {
        SNAPSHOT_PATH
    } else {
        "@"
    }
}

#[derive(Debug)]
pub struct BtrfsVolumeManager {
    base: VolumeBase,
    toplevel_mount: Option<MountManager>,
    subvol_mounts: Vec<(MountManager, Vec<String>)>,
    retry: RetryPolicy,
}

impl BtrfsVolumeManager {
    pub fn new(base: VolumeBase) -> Self {
        Self {
            base,
            toplevel_mount: None,
            subvol_mounts: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn default_volume(&self) -> &'static str {
        default_volume_name(self.base.args.root_is_snapshot)
    }

    /// The top level is always mounted by id, a plain mount would land on
    /// the default subvolume once it is set.
    fn toplevel_mount_options(&self) -> Vec<String> {
        self.base.mount_options_with("subvolid=5")
    }

    fn subvolume_create(path: &Path) -> Result<()> {
        Cmd::new("btrfs")
            .args(["subvolume", "create"])
            .arg_path(path)
            .error_msg("Failed to create btrfs subvolume")
            .run()?;
        Ok(())
    }

    /// Mark `volume` as the default subvolume.
    fn set_default_volume(&self, mountpoint: &Path, volume: &str) -> Result<()> {
        let out = Cmd::new("btrfs")
            .args(["subvolume", "list"])
            .arg_path(mountpoint)
            .error_msg("Failed to list btrfs subvolumes")
            .run()?;
        let pattern = Regex::new(r"ID (\d+) .*path (.*)").map_err(|e| Error::VolumeSetup {
            message: e.to_string(),
        })?;
        for line in out.stdout.lines() {
            if let Some(caps) = pattern.captures(line) {
                if caps[2].trim() == volume {
                    Cmd::new("btrfs")
                        .args(["subvolume", "set-default"])
                        .arg(&caps[1])
                        .arg_path(mountpoint)
                        .error_msg("Failed to set default btrfs subvolume")
                        .run()?;
                    return Ok(());
                }
            }
        }
        Err(Error::VolumeRootId {
            path: volume.to_string(),
        })
    }
}

impl VolumeManager for BtrfsVolumeManager {
    fn setup(&mut self) -> Result<()> {
        self.base
            .require_state(&[VolumeState::Uninitialized], "btrfs setup")?;
        let mountpoint = self.base.setup_mountpoint()?;

        FileSystem::new(
            FilesystemKind::Btrfs,
            Some(&self.base.device),
            &self.base.root_dir,
            FilesystemArgs::default(),
        )
        .create_on_device(Some(&self.base.args.root_label), None, None)?;

        let mut toplevel = MountManager::new(self.base.device.device.clone(), Some(&mountpoint))?
            .with_retry(self.retry);
        toplevel.mount(&self.toplevel_mount_options())?;
        self.toplevel_mount = Some(toplevel);

        if self.base.args.quota_groups {
            Cmd::new("btrfs")
                .args(["quota", "enable"])
                .arg_path(&mountpoint)
                .error_msg("Failed to enable btrfs quota")
                .run()?;
        }

        let root_volume = mountpoint.join("@");
        Self::subvolume_create(&root_volume)?;
        if self.base.args.root_is_snapshot {
            let snapshots = root_volume.join(".snapshots");
            Self::subvolume_create(&snapshots)?;
            let first = snapshots.join("1");
            fs::create_dir_all(&first).at_path(&first)?;
            Cmd::new("btrfs")
                .args(["subvolume", "snapshot"])
                .arg_path(&root_volume)
                .arg_path(&first.join("snapshot"))
                .error_msg("Failed to create root snapshot")
                .run()?;
        }
        self.set_default_volume(&mountpoint, self.default_volume())?;
        self.base.state = VolumeState::Setup;
        Ok(())
    }

    fn create_volumes(&mut self, filesystem: FilesystemKind) -> Result<()> {
        self.base
            .require_state(&[VolumeState::Setup], "creating volumes")?;
        info!("Creating {} sub volumes", filesystem);
        self.base.create_volume_paths_in_root_dir()?;
        let mountpoint = self.base.require_mountpoint()?;
        let toplevel = mountpoint.join("@");

        let (mut volumes, full_size) = self.base.canonical_volume_list();
        volumes.extend(full_size);
        for volume in &volumes {
            let realpath = volume.realpath();
            info!("--> sub volume {}", realpath);
            let target = toplevel.join(&realpath);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).at_path(parent)?;
            }
            Self::subvolume_create(&target)?;
            self.base.apply_attributes_on_volume(&toplevel, volume)?;

            if self.base.args.root_is_snapshot {
                let snapshot_target = mountpoint.join(SNAPSHOT_PATH).join(&realpath);
                let manager =
                    MountManager::new(self.base.device.device.clone(), Some(&snapshot_target))?
                        .with_retry(self.retry);
                let options = self.base.mount_options_with(&format!("subvol=@/{}", realpath));
                self.subvol_mounts.push((manager, options));
            }
        }
        self.base.state = VolumeState::VolumesCreated;
        Ok(())
    }

    fn get_fstab(&self, persistency: Persistency, _filesystem: FilesystemKind) -> Result<Vec<FstabEntry>> {
        let device_spec = self.base.device_spec(persistency)?;
        let mut entries = Vec::new();
        let (mut volumes, full_size) = self.base.canonical_volume_list();
        volumes.extend(full_size);
        for volume in &volumes {
            let realpath = volume.realpath();
            let options = self.base.mount_options_with(&format!("subvol=@/{}", realpath));
            let options: Vec<&str> = options.iter().map(String::as_str).collect();
            entries.push(FstabEntry::new(
                &device_spec,
                &format!("/{}", realpath),
                "btrfs",
                &options,
                0,
            ));
        }
        if self.base.args.root_is_snapshot {
            let options = self.base.mount_options_with("subvol=@/.snapshots");
            let options: Vec<&str> = options.iter().map(String::as_str).collect();
            entries.push(FstabEntry::new(&device_spec, "/.snapshots", "btrfs", &options, 0));
        }
        Ok(entries)
    }

    fn get_device(&self) -> DeviceMap {
        let mut map = DeviceMap::new();
        map.insert(role::ROOT.to_string(), self.base.device.clone());
        map
    }

    fn mount_volumes(&mut self) -> Result<()> {
        self.base.require_state(
            &[VolumeState::VolumesCreated, VolumeState::Umounted, VolumeState::Mounted],
            "mounting volumes",
        )?;
        let options = self.toplevel_mount_options();
        if let Some(toplevel) = self.toplevel_mount.as_mut() {
            toplevel.mount(&options)?;
        }
        for (manager, options) in &mut self.subvol_mounts {
            manager.mount(options)?;
        }
        self.base.state = VolumeState::Mounted;
        Ok(())
    }

    fn umount_volumes(&mut self) -> bool {
        let mut all_umounted = true;
        for (manager, _) in self.subvol_mounts.iter_mut().rev() {
            if !manager.umount() {
                all_umounted = false;
            }
        }
        if all_umounted {
            if let Some(toplevel) = self.toplevel_mount.as_mut() {
                all_umounted = toplevel.umount();
            }
        }
        if all_umounted && self.base.state == VolumeState::Mounted {
            self.base.state = VolumeState::Umounted;
        }
        all_umounted
    }

    fn sync_data(&mut self, exclude: &[String]) -> Result<()> {
        self.mount_volumes()?;
        let target = self.root_path().ok_or_else(|| Error::VolumeSetup {
            message: "volume manager is not set up".to_string(),
        })?;
        DataSync::new(&self.base.root_dir, target).sync_data(exclude)
    }

    fn set_property_readonly_root(&mut self) -> Result<()> {
        if !(self.base.args.root_is_snapshot && self.base.args.root_is_readonly_snapshot) {
            return Ok(());
        }
        let mountpoint = self.base.require_mountpoint()?;
        Cmd::new("btrfs")
            .args(["property", "set"])
            .arg_path(&mountpoint.join(SNAPSHOT_PATH))
            .args(["ro", "true"])
            .error_msg("Failed to set root snapshot read-only")
            .run()?;
        Ok(())
    }

    fn mountpoint(&self) -> Option<&Path> {
        self.base.mountpoint.as_deref()
    }

    fn root_path(&self) -> Option<PathBuf> {
        self.base
            .mountpoint
            .as_ref()
            .map(|m| m.join(self.default_volume()))
    }

    fn state(&self) -> VolumeState {
        self.base.state
    }

    fn release(&mut self) -> bool {
        if !self.umount_volumes() {
            return false;
        }
        self.subvol_mounts.clear();
        self.toplevel_mount = None;
        self.base.remove_mountpoint();
        true
    }
}

impl Drop for BtrfsVolumeManager {
    fn drop(&mut self) {
        if self.base.mountpoint.is_some() && !self.release() {
            warn!("btrfs volumes still busy, keeping mount directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VolumeSize, VolumeSpec};
    use crate::process::testing::RecordingRunner;
    use crate::storage::MappedDevice;
    use crate::volume_manager::tests::volume;
    use crate::volume_manager::VolumeManagerArgs;
    use tempfile::TempDir;

    const LIST: &str = "ID 256 gen 7 top level 5 path @\n\
                        ID 257 gen 7 top level 256 path @/.snapshots\n\
                        ID 258 gen 7 top level 257 path @/.snapshots/1/snapshot\n";

    fn manager(root: &Path, volumes: &[VolumeSpec], snapshot: bool) -> BtrfsVolumeManager {
        let args = VolumeManagerArgs {
            root_label: "ROOT".to_string(),
            root_is_snapshot: snapshot,
            ..Default::default()
        };
        BtrfsVolumeManager::new(
            VolumeBase::new(&MappedDevice::new("/dev/mapper/loop0p3", true), root, volumes, args).unwrap(),
        )
    }

    #[test]
    fn test_snapshot_setup_sets_snapshot_default() {
        let root = TempDir::new().unwrap();
        let (runner, _guard) = RecordingRunner::install();
        runner.respond_when("btrfs", "list", LIST);
        let volumes = vec![
            volume("home", None, VolumeSize::default()),
            volume("log", Some("var/log"), VolumeSize::default()),
        ];
        let mut vm = manager(root.path(), &volumes, true);
        vm.setup().unwrap();
        let mp = vm.mountpoint().unwrap().to_path_buf();

        let cmds = runner.commands_for("btrfs");
        assert_eq!(cmds[0], format!("btrfs subvolume create {}/@", mp.display()));
        assert_eq!(cmds[1], format!("btrfs subvolume create {}/@/.snapshots", mp.display()));
        assert_eq!(
            cmds[2],
            format!(
                "btrfs subvolume snapshot {0}/@ {0}/@/.snapshots/1/snapshot",
                mp.display()
            )
        );
        assert_eq!(cmds[4], format!("btrfs subvolume set-default 258 {}", mp.display()));

        vm.create_volumes(FilesystemKind::Btrfs).unwrap();
        assert_eq!(vm.state(), VolumeState::VolumesCreated);
        assert_eq!(vm.subvol_mounts.len(), 2);

        runner.respond("blkid", "abcd\n");
        let fstab: Vec<String> = vm
            .get_fstab(Persistency::ByUuid, FilesystemKind::Btrfs)
            .unwrap()
            .iter()
            .map(FstabEntry::to_line)
            .collect();
        assert_eq!(
            fstab,
            vec![
                "UUID=abcd /home btrfs subvol=@/home 0 0",
                "UUID=abcd /var/log btrfs subvol=@/var/log 0 0",
                "UUID=abcd /.snapshots btrfs subvol=@/.snapshots 0 0",
            ]
        );
        assert!(vm.release());
        assert!(!mp.exists());
    }

    #[test]
    fn test_plain_setup_defaults_to_toplevel() {
        let root = TempDir::new().unwrap();
        let (runner, _guard) = RecordingRunner::install();
        runner.respond_when("btrfs", "list", "ID 256 gen 5 top level 5 path @\n");
        let mut vm = manager(root.path(), &[], false);
        vm.setup().unwrap();
        assert!(runner
            .commands()
            .iter()
            .any(|c| c.starts_with("btrfs subvolume set-default 256")));
        assert!(vm.root_path().unwrap().ends_with("@"));
        vm.release();
    }

    #[test]
    fn test_missing_default_volume_is_root_id_error() {
        let root = TempDir::new().unwrap();
        let (_runner, _guard) = RecordingRunner::install();
        let mut vm = manager(root.path(), &[], false);
        assert!(matches!(vm.setup(), Err(Error::VolumeRootId { .. })));
        vm.release();
    }

    #[test]
    fn test_create_before_setup_rejected() {
        let root = TempDir::new().unwrap();
        let (_runner, _guard) = RecordingRunner::install();
        let mut vm = manager(root.path(), &[], false);
        assert!(matches!(
            vm.create_volumes(FilesystemKind::Btrfs),
            Err(Error::VolumeSetup { .. })
        ));
    }

    #[test]
    fn test_busy_volume_keeps_toplevel_and_dir() {
        let root = TempDir::new().unwrap();
        let (runner, _guard) = RecordingRunner::install();
        runner.respond_when("btrfs", "list", LIST);
        let volumes = vec![volume("home", None, VolumeSize::default())];
        let mut vm = manager(root.path(), &volumes, true).with_retry(RetryPolicy {
            attempts: 1,
            interval: std::time::Duration::ZERO,
            lazy_fallback: false,
        });
        vm.setup().unwrap();
        vm.create_volumes(FilesystemKind::Btrfs).unwrap();
        vm.mount_volumes().unwrap();
        let mp = vm.mountpoint().unwrap().to_path_buf();

        runner.fail_when("umount", "snapshot/home");
        assert!(!vm.umount_volumes());
        assert!(!vm.release());
        assert!(mp.exists());
        // the top level stays mounted while a volume is busy
        assert!(!runner
            .commands_for("umount")
            .contains(&format!("umount {}", mp.display())));
    }

    #[test]
    fn test_readonly_property_only_for_readonly_snapshot() {
        let root = TempDir::new().unwrap();
        let (runner, _guard) = RecordingRunner::install();
        runner.respond_when("btrfs", "list", LIST);
        let args = VolumeManagerArgs {
            root_label: "ROOT".to_string(),
            root_is_snapshot: true,
            root_is_readonly_snapshot: true,
            ..Default::default()
        };
        let mut vm = BtrfsVolumeManager::new(
            VolumeBase::new(&MappedDevice::new("/dev/sda3", false), root.path(), &[], args).unwrap(),
        );
        vm.setup().unwrap();
        vm.set_property_readonly_root().unwrap();
        assert!(runner
            .commands()
            .last()
            .unwrap()
            .ends_with("@/.snapshots/1/snapshot ro true"));
        vm.release();
    }

    #[test]
    fn test_toplevel_remount_after_set_default_uses_subvolid() {
        let root = TempDir::new().unwrap();
        let (runner, _guard) = RecordingRunner::install();
        runner.respond_when("btrfs", "list", LIST);
        let volumes = vec![volume("home", None, VolumeSize::default())];
        let mut vm = manager(root.path(), &volumes, true);
        vm.setup().unwrap();
        vm.create_volumes(FilesystemKind::Btrfs).unwrap();
        vm.mount_volumes().unwrap();
        assert!(vm.umount_volumes());
        vm.mount_volumes().unwrap();
        let mp = vm.mountpoint().unwrap().to_path_buf();

        let toplevel: Vec<String> = runner
            .commands_for("mount")
            .into_iter()
            .filter(|c| c.ends_with(&mp.display().to_string()))
            .collect();
        assert_eq!(toplevel.len(), 2);
        for cmd in &toplevel {
            assert_eq!(cmd, &format!("mount -o subvolid=5 /dev/mapper/loop0p3 {}", mp.display()));
        }
        let set_default = runner
            .commands()
            .iter()
            .position(|c| c.starts_with("btrfs subvolume set-default"))
            .unwrap();
        let remount = runner
            .commands()
            .iter()
            .rposition(|c| c == &toplevel[1])
            .unwrap();
        assert!(remount > set_default);
        assert!(runner.commands_for("mount").iter().any(|c| c
            == &format!(
                "mount -o subvol=@/home /dev/mapper/loop0p3 {}/@/.snapshots/1/snapshot/home",
                mp.display()
            )));
        vm.release();
    }
}
