//! Partition creation in firmware precedence order.

use super::disk::Disk;
use super::partitioner::PartitionSize;
use super::setup::DiskSetup;
use super::DeviceMap;
use crate::config::{ImageConfiguration, PartitionTableType, VolumeManagerKind};
use crate::error::Result;
use crate::firmware::Firmware;
use tracing::info;

/// Sizes only known once data has been measured or built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionPlan {
    /// Size of the prebuilt read-only root image.
    pub readonly_mbytes: Option<u64>,
    /// Fixed root size when root clones follow it.
    pub root_clone_mbytes: Option<u64>,
}

/// Lays out the partition table of a disk.
///
/// Order: EFI CSM, EFI, PReP, boot, boot clones, swap, custom, spare,
/// read-only root, root, root clones.
#[derive(Debug)]
pub struct PartitionTableBuilder<'a> {
    config: &'a ImageConfiguration,
    firmware: &'a Firmware,
    setup: &'a DiskSetup<'a>,
}

impl<'a> PartitionTableBuilder<'a> {
    pub fn new(config: &'a ImageConfiguration, firmware: &'a Firmware, setup: &'a DiskSetup<'a>) -> Self {
        Self {
            config,
            firmware,
            setup,
        }
    }

    /// Create every partition and return the device map.
    pub fn build(&self, disk: &mut Disk, plan: &PartitionPlan) -> Result<DeviceMap> {
        info!("Creating partitions");
        disk.wipe()?;

        if self.firmware.legacy_bios_mode() {
            disk.create_efi_csm_partition(self.firmware.legacy_bios_partition_mbytes())?;
        }
        if self.firmware.efi_mode().is_some() {
            disk.create_efi_partition(self.firmware.efi_partition_mbytes())?;
        }
        if self.firmware.ofw_mode() {
            disk.create_prep_partition(self.firmware.prep_partition_mbytes())?;
        }
        if self.setup.need_boot_partition() {
            let size = PartitionSize::Mbytes(self.setup.boot_partition_size());
            disk.create_boot_partition(size)?;
            for index in 1..=self.config.boot_clone_count {
                disk.create_boot_clone_partition(index, size)?;
            }
        }
        if let Some(mbytes) = self.config.swap_mbytes {
            if self.config.volume_manager != Some(VolumeManagerKind::Lvm) {
                disk.create_swap_partition(mbytes)?;
            }
        }
        for (name, partition) in &self.config.partitions {
            disk.create_custom_partition(name, partition.mbytes)?;
        }
        if let Some(spare) = &self.config.spare {
            disk.create_spare_partition(PartitionSize::Mbytes(spare.mbytes))?;
        }
        if self.config.overlay_root {
            if let Some(mbytes) = plan.readonly_mbytes {
                disk.create_root_readonly_partition(mbytes)?;
            }
        }

        let root_size = match (self.config.root_clone_count, plan.root_clone_mbytes) {
            (count, Some(mbytes)) if count > 0 => PartitionSize::Mbytes(mbytes),
            _ => PartitionSize::AllFree,
        };
        if self.config.volume_manager == Some(VolumeManagerKind::Lvm) {
            disk.create_root_lvm_partition(root_size)?;
        } else if self.config.raid.is_some() {
            disk.create_root_raid_partition(root_size)?;
        } else {
            disk.create_root_partition(root_size)?;
        }
        if let PartitionSize::Mbytes(mbytes) = root_size {
            for index in 1..=self.config.root_clone_count {
                disk.create_root_clone_partition(index, mbytes)?;
            }
        }

        let bios_like = self.firmware.bios_mode() || self.firmware.ofw_mode();
        if bios_like && disk.table_type() != PartitionTableType::Dasd {
            disk.activate_boot_partition()?;
        }

        if self.firmware.efi_mode().is_some() && self.firmware.is_x86() {
            if self.config.force_mbr {
                disk.create_mbr()?;
            } else if self.config.gpt_hybrid_mbr {
                disk.create_hybrid_mbr()?;
            }
        }

        disk.map_partitions()?;
        Ok(disk.get_device())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use crate::storage::MappedDevice;
    use tempfile::TempDir;

    fn layout(toml: &str) -> (Vec<String>, Vec<String>, DeviceMap) {
        let config = ImageConfiguration::from_toml_str(&format!("image_name = \"t\"\n{}", toml)).unwrap();
        let firmware = Firmware::new(&config).unwrap();
        let root = TempDir::new().unwrap();
        let setup = DiskSetup::new(&config, &firmware, root.path());
        let (runner, _guard) = RecordingRunner::install();
        let mut disk = Disk::new(
            firmware.partition_table_type(),
            &MappedDevice::new("/dev/loop0", true),
        );
        let map = PartitionTableBuilder::new(&config, &firmware, &setup)
            .build(&mut disk, &PartitionPlan::default())
            .unwrap();
        let names = disk
            .partitioner()
            .records()
            .iter()
            .map(|r| r.name.clone())
            .collect();
        disk.release().unwrap();
        (names, runner.commands(), map)
    }

    #[test]
    fn test_bios_flat_root_only() {
        let (names, cmds, map) = layout("arch = \"x86_64\"\nfilesystem = \"ext4\"\nfirmware = \"bios\"");
        assert_eq!(names, vec!["p.lxroot"]);
        assert!(cmds.contains(&"sfdisk --activate /dev/loop0 1".to_string()));
        assert_eq!(map.len(), 1);
        assert_eq!(map["root"].device, "/dev/mapper/loop0p1");
    }

    #[test]
    fn test_efi_with_legacy_bios() {
        let (names, cmds, _) = layout("arch = \"x86_64\"\nfilesystem = \"ext4\"\nfirmware = \"efi\"");
        assert_eq!(names, vec!["p.legacy", "p.UEFI", "p.lxroot"]);
        assert!(!cmds.iter().any(|c| c.contains("--activate")));
    }

    #[test]
    fn test_uefi_lvm_boot() {
        let (names, _, map) = layout(
            "arch = \"x86_64\"\nfilesystem = \"ext4\"\nfirmware = \"uefi\"\nvolume_manager = \"lvm\"\nefi_csm = false",
        );
        assert_eq!(names, vec!["p.UEFI", "p.lxboot", "p.lxlvm"]);
        assert!(map.contains_key("boot"));
    }

    #[test]
    fn test_ofw_prep_first_and_active() {
        let (names, cmds, _) = layout("arch = \"ppc64le\"\nfilesystem = \"ext4\"\nraid = \"mirroring\"");
        assert_eq!(names, vec!["p.prep", "p.lxboot", "p.lxraid"]);
        assert!(cmds.contains(&"sfdisk --activate /dev/loop0 1".to_string()));
    }

    #[test]
    fn test_ec2_full_precedence() {
        let (names, _, _) = layout(
            r#"
            arch = "x86_64"
            filesystem = "ext4"
            firmware = "ec2"
            boot_partition = true
            swap_mbytes = 128

            [spare]
            mbytes = 50

            [partitions.data]
            mbytes = 100
            filesystem = "xfs"
            "#,
        );
        assert_eq!(names, vec!["p.lxboot", "p.swap", "p.data", "p.spare", "p.lxroot"]);
    }

    #[test]
    fn test_ec2_boot_partition_not_activated() {
        let (_, cmds, _) = layout("arch = \"x86_64\"\nfilesystem = \"ext4\"\nfirmware = \"ec2\"");
        assert!(!cmds.iter().any(|c| c.contains("--activate")));
    }

    #[test]
    fn test_boot_clones_follow_boot() {
        let (names, _, map) = layout(
            "arch = \"x86_64\"\nfilesystem = \"ext4\"\nfirmware = \"bios\"\nboot_partition = true\nboot_clone_count = 2",
        );
        assert_eq!(names, vec!["p.lxboot", "p.lxbootclone1", "p.lxbootclone2", "p.lxroot"]);
        assert_eq!(map["bootclone2"].device, "/dev/mapper/loop0p3");
    }

    #[test]
    fn test_s390_dasd_table() {
        let (names, cmds, _) = layout(
            "arch = \"s390x\"\nfilesystem = \"ext4\"\nboot_partition = true\n[zipl]\ntarget_type = \"CDL\"",
        );
        assert_eq!(names, vec!["p.lxboot", "p.lxroot"]);
        assert!(cmds.iter().filter(|c| c.starts_with("fdasd")).count() >= 2);
        assert!(!cmds.iter().any(|c| c.contains("--activate")));
    }

    #[test]
    fn test_hybrid_mbr_on_efi() {
        let (_, cmds, _) = layout(
            "arch = \"x86_64\"\nfilesystem = \"ext4\"\nfirmware = \"efi\"\ngpt_hybrid_mbr = true",
        );
        assert!(cmds.contains(&"sgdisk -h 1:2:3 /dev/loop0".to_string()));
    }
}
