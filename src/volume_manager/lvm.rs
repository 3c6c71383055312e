//! LVM volume group with one logical volume per configured volume.

use super::{VolumeBase, VolumeManager, VolumeState};
use crate::config::{FilesystemKind, Persistency, VolumeSize, VolumeSpec};
use crate::defaults;
use crate::error::{Error, Result};
use crate::filesystem::{FileSystem, FilesystemArgs};
use crate::mount::{MountManager, RetryPolicy};
use crate::process::Cmd;
use crate::storage::{role, DeviceMap, MappedDevice};
use crate::utils::{DataSync, FstabEntry};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const ROOT_VOLUME_NAME: &str = "LVRoot";
pub const SWAP_VOLUME_NAME: &str = "LVSwap";

#[derive(Debug)]
pub struct LvmVolumeManager {
    base: VolumeBase,
    volume_group: Option<String>,
    /// Logical volume name to device node, in creation order.
    volume_map: Vec<(String, String)>,
    /// Root first, then the other volumes parents first.
    mount_list: Vec<(String, MountManager)>,
    retry: RetryPolicy,
}

impl LvmVolumeManager {
    pub fn new(base: VolumeBase) -> Self {
        Self {
            base,
            volume_group: None,
            volume_map: Vec::new(),
            mount_list: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn volume_group_in_use(name: &str) -> Result<bool> {
        let out = Cmd::new("vgs")
            .args(["--noheadings", "-o", "vg_name"])
            .error_msg("Failed to list volume groups")
            .run()?;
        Ok(out.stdout.lines().any(|line| line.trim() == name))
    }

    fn require_volume_group(&self) -> Result<String> {
        self.volume_group.clone().ok_or_else(|| Error::VolumeSetup {
            message: "volume group is not set up".to_string(),
        })
    }

    fn lvcreate(&mut self, group: &str, name: &str, mbsize: Option<u64>) -> Result<String> {
        let mut cmd = Cmd::new("lvcreate");
        cmd = match mbsize {
            Some(mbsize) => {
                info!("--> volume {} with {} MB", name, mbsize);
                cmd.arg("-L").arg(mbsize.to_string())
            }
            None => {
                info!("--> fullsize volume {}", name);
                cmd.args(["-l", "+100%FREE"])
            }
        };
        cmd.args(["-n", name])
            .arg(group)
            .error_msg(format!("Failed to create logical volume {}", name))
            .run()?;
        let node = format!("/dev/{}/{}", group, name);
        self.volume_map.push((name.to_string(), node.clone()));
        Ok(node)
    }

    fn create_filesystem(&self, node: &str, kind: FilesystemKind, label: Option<&str>) -> Result<()> {
        FileSystem::new(
            kind,
            Some(&MappedDevice::new(node, self.base.device.is_loop)),
            &self.base.root_dir,
            FilesystemArgs::default(),
        )
        .create_on_device(label, None, None)
    }

    fn add_to_mount_list(&mut self, name: &str, node: &str, realpath: &str) -> Result<()> {
        let mountpoint = self.base.require_mountpoint()?;
        let target = if realpath.is_empty() {
            mountpoint
        } else {
            mountpoint.join(realpath)
        };
        let manager = MountManager::new(node, Some(&target))?.with_retry(self.retry);
        if name == ROOT_VOLUME_NAME {
            self.mount_list.insert(0, (realpath.to_string(), manager));
        } else {
            self.mount_list.push((realpath.to_string(), manager));
        }
        Ok(())
    }

    fn create_volume(
        &mut self,
        group: &str,
        volume: &VolumeSpec,
        name: &str,
        filesystem: FilesystemKind,
        full_size: bool,
    ) -> Result<()> {
        let mbsize = if full_size {
            None
        } else {
            Some(self.base.get_volume_mbsize(volume, filesystem)?)
        };
        let node = self.lvcreate(group, name, mbsize)?;
        let label = if name == ROOT_VOLUME_NAME {
            Some(self.base.args.root_label.clone())
        } else {
            volume.label.clone()
        };
        self.create_filesystem(&node, filesystem, label.as_deref())?;
        self.add_to_mount_list(name, &node, &volume.realpath())
    }

    fn node_of(&self, name: &str) -> Option<&str> {
        self.volume_map
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node.as_str())
    }
}

impl VolumeManager for LvmVolumeManager {
    fn setup(&mut self) -> Result<()> {
        self.base
            .require_state(&[VolumeState::Uninitialized], "lvm setup")?;
        let group = self.base.args.volume_group_name.clone();
        let group = if group.is_empty() {
            defaults::VOLUME_GROUP_NAME.to_string()
        } else {
            group
        };
        if Self::volume_group_in_use(&group)? {
            return Err(Error::VolumeSetup {
                message: format!("requested volume group {} is in use on this host", group),
            });
        }
        self.base.setup_mountpoint()?;
        info!("Creating volume group {}", group);
        Cmd::new("vgremove")
            .arg("--force")
            .arg(&group)
            .allow_fail()
            .run()?;
        Cmd::new("pvcreate")
            .arg(&self.base.device.device)
            .error_msg("Failed to create physical volume")
            .run()?;
        Cmd::new("vgcreate")
            .arg(&group)
            .arg(&self.base.device.device)
            .error_msg("Failed to create volume group")
            .run()?;
        self.volume_group = Some(group);
        self.base.state = VolumeState::Setup;
        Ok(())
    }

    fn create_volumes(&mut self, filesystem: FilesystemKind) -> Result<()> {
        self.base
            .require_state(&[VolumeState::Setup], "creating volumes")?;
        let group = self.require_volume_group()?;
        info!("Creating volumes({})", filesystem);
        self.base.create_volume_paths_in_root_dir()?;

        let root = self.base.root_volume().cloned().unwrap_or(VolumeSpec {
            name: ROOT_VOLUME_NAME.to_string(),
            path: None,
            size: VolumeSize::default(),
            root: true,
            nocow: false,
            label: None,
        });
        let (mut volumes, mut full_size) = self.base.canonical_volume_list();
        let root_is_full_size = root.size == VolumeSize::All;
        if root_is_full_size {
            volumes.extend(full_size.take());
        } else {
            self.create_volume(&group, &root, ROOT_VOLUME_NAME, filesystem, false)?;
        }

        if let Some(mbytes) = self.base.args.swap_mbytes {
            let node = self.lvcreate(&group, SWAP_VOLUME_NAME, Some(mbytes))?;
            self.create_filesystem(&node, FilesystemKind::Swap, Some(defaults::SWAP_LABEL))?;
        }

        for volume in &volumes {
            self.create_volume(&group, volume, &volume.name, filesystem, false)?;
        }
        if root_is_full_size {
            self.create_volume(&group, &root, ROOT_VOLUME_NAME, filesystem, true)?;
        } else if let Some(volume) = full_size {
            self.create_volume(&group, &volume, &volume.name, filesystem, true)?;
        }
        self.base.state = VolumeState::VolumesCreated;
        Ok(())
    }

    fn get_fstab(&self, _persistency: Persistency, filesystem: FilesystemKind) -> Result<Vec<FstabEntry>> {
        let options: Vec<&str> = self.base.args.mount_options.iter().map(String::as_str).collect();
        Ok(self
            .mount_list
            .iter()
            .filter(|(realpath, _)| !realpath.is_empty())
            .map(|(realpath, manager)| {
                let mut entry = FstabEntry::new(
                    manager.device(),
                    &format!("/{}", realpath),
                    filesystem.fstab_type(),
                    &options,
                    2,
                );
                entry.dump = 1;
                entry
            })
            .collect())
    }

    fn get_device(&self) -> DeviceMap {
        let mut map = DeviceMap::new();
        for (name, node) in &self.volume_map {
            let key = match name.as_str() {
                ROOT_VOLUME_NAME => role::ROOT.to_string(),
                SWAP_VOLUME_NAME => role::SWAP.to_string(),
                other => other.to_string(),
            };
            map.insert(key, MappedDevice::new(node.as_str(), self.base.device.is_loop));
        }
        map
    }

    fn mount_volumes(&mut self) -> Result<()> {
        self.base.require_state(
            &[VolumeState::VolumesCreated, VolumeState::Umounted, VolumeState::Mounted],
            "mounting volumes",
        )?;
        for (_, manager) in &mut self.mount_list {
            manager.mount(&self.base.args.mount_options)?;
        }
        self.base.state = VolumeState::Mounted;
        Ok(())
    }

    fn umount_volumes(&mut self) -> bool {
        let mut all_umounted = true;
        for (_, manager) in self.mount_list.iter_mut().rev() {
            if !manager.umount() {
                all_umounted = false;
            }
        }
        if all_umounted && self.base.state == VolumeState::Mounted {
            self.base.state = VolumeState::Umounted;
        }
        all_umounted
    }

    fn sync_data(&mut self, exclude: &[String]) -> Result<()> {
        self.mount_volumes()?;
        let target = self.base.require_mountpoint()?;
        DataSync::new(&self.base.root_dir, target).sync_data(exclude)
    }

    fn set_property_readonly_root(&mut self) -> Result<()> {
        Err(Error::VolumeSetup {
            message: "a read-only root property is not available on LVM".to_string(),
        })
    }

    fn mountpoint(&self) -> Option<&Path> {
        self.base.mountpoint.as_deref()
    }

    fn root_path(&self) -> Option<PathBuf> {
        self.base.mountpoint.clone()
    }

    fn state(&self) -> VolumeState {
        self.base.state
    }

    fn release(&mut self) -> bool {
        if !self.umount_volumes() {
            return false;
        }
        self.mount_list.clear();
        self.base.remove_mountpoint();
        if let Some(group) = self.volume_group.take() {
            let result = Cmd::new("vgchange").arg("-an").arg(&group).run();
            if result.is_err() {
                warn!("volume group {} still busy", group);
            }
        }
        true
    }
}

impl LvmVolumeManager {
    /// Device node of the root logical volume once created.
    pub fn root_node(&self) -> Option<&str> {
        self.node_of(ROOT_VOLUME_NAME)
    }
}

impl Drop for LvmVolumeManager {
    fn drop(&mut self) {
        let active = self.volume_group.is_some() || self.base.mountpoint.is_some();
        if active && !self.release() {
            warn!("lvm volumes still busy, keeping volume group active");
        }
    }
}
