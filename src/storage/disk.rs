//! A partitioned disk and its partition device nodes.

use super::partitioner::{new_partitioner, PartitionFlag, PartitionSize, PartitionType, Partitioner};
use super::{role, DeviceHandle, DeviceMap, MappedDevice};
use crate::config::PartitionTableType;
use crate::error::Result;
use crate::process::Cmd;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Partition id map key of a custom partition.
pub fn custom_partition_id_key(name: &str) -> String {
    format!("{}_PART", name.to_uppercase())
}

/// Partitions of one block device, keyed by role.
pub struct Disk {
    storage: MappedDevice,
    partitioner: Box<dyn Partitioner>,
    partitions: BTreeMap<String, u32>,
    partition_ids: BTreeMap<String, String>,
    mapped: bool,
}

impl std::fmt::Debug for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk")
            .field("storage", &self.storage)
            .field("table", &self.partitioner.table_type())
            .field("partitions", &self.partitions)
            .field("mapped", &self.mapped)
            .finish()
    }
}

impl Disk {
    pub fn new(table: PartitionTableType, storage: &dyn DeviceHandle) -> Self {
        Self::with_partitioner(new_partitioner(table, storage.device()), storage)
    }

    pub fn with_partitioner(partitioner: Box<dyn Partitioner>, storage: &dyn DeviceHandle) -> Self {
        Self {
            storage: MappedDevice::from_handle(storage),
            partitioner,
            partitions: BTreeMap::new(),
            partition_ids: BTreeMap::new(),
            mapped: false,
        }
    }

    pub fn table_type(&self) -> PartitionTableType {
        self.partitioner.table_type()
    }

    pub fn storage(&self) -> &MappedDevice {
        &self.storage
    }

    pub fn partitioner(&self) -> &dyn Partitioner {
        self.partitioner.as_ref()
    }

    /// Remove any existing partition table.
    pub fn wipe(&mut self) -> Result<()> {
        info!("--> wiping partition table of {}", self.storage.device);
        self.partitioner.wipe()?;
        self.partitions.clear();
        self.partition_ids.clear();
        Ok(())
    }

    fn add_partition(
        &mut self,
        role_name: &str,
        label: &str,
        size: PartitionSize,
        partition_type: PartitionType,
        id_key: Option<&str>,
    ) -> Result<u32> {
        info!("--> creating {} partition ({})", role_name, size);
        let number = self.partitioner.create(label, size, partition_type)?;
        self.partitions.insert(role_name.to_string(), number);
        if let Some(key) = id_key {
            self.partition_ids.insert(key.to_string(), number.to_string());
        }
        Ok(number)
    }

    /// BIOS boot partition used by GRUB next to EFI.
    pub fn create_efi_csm_partition(&mut self, mbytes: u64) -> Result<u32> {
        self.add_partition(
            role::EFI_CSM,
            "p.legacy",
            PartitionSize::Mbytes(mbytes),
            PartitionType::Csm,
            Some("BIOS_GRUB_PART"),
        )
    }

    pub fn create_efi_partition(&mut self, mbytes: u64) -> Result<u32> {
        self.add_partition(
            role::EFI,
            "p.UEFI",
            PartitionSize::Mbytes(mbytes),
            PartitionType::Efi,
            Some("EFI_PART"),
        )
    }

    pub fn create_prep_partition(&mut self, mbytes: u64) -> Result<u32> {
        self.add_partition(
            role::PREP,
            "p.prep",
            PartitionSize::Mbytes(mbytes),
            PartitionType::Prep,
            Some("PREP_PART"),
        )
    }

    pub fn create_boot_partition(&mut self, size: PartitionSize) -> Result<u32> {
        self.add_partition(role::BOOT, "p.lxboot", size, PartitionType::Linux, Some("BOOT_PART"))
    }

    pub fn create_swap_partition(&mut self, mbytes: u64) -> Result<u32> {
        self.add_partition(
            role::SWAP,
            "p.swap",
            PartitionSize::Mbytes(mbytes),
            PartitionType::Swap,
            Some("SWAP_PART"),
        )
    }

    pub fn create_spare_partition(&mut self, size: PartitionSize) -> Result<u32> {
        self.add_partition(role::SPARE, "p.spare", size, PartitionType::Linux, Some("SPARE_PART"))
    }

    pub fn create_custom_partition(&mut self, name: &str, mbytes: u64) -> Result<u32> {
        let key = custom_partition_id_key(name);
        self.add_partition(
            name,
            &format!("p.{}", name),
            PartitionSize::Mbytes(mbytes),
            PartitionType::Linux,
            Some(&key),
        )
    }

    /// Read-only partition holding the compressed root image.
    pub fn create_root_readonly_partition(&mut self, mbytes: u64) -> Result<u32> {
        self.add_partition(
            role::READONLY,
            "p.lxreadonly",
            PartitionSize::Mbytes(mbytes),
            PartitionType::Linux,
            Some("RO_PART"),
        )
    }

    pub fn create_root_lvm_partition(&mut self, size: PartitionSize) -> Result<u32> {
        let number = self.add_partition(role::ROOT, "p.lxlvm", size, PartitionType::Lvm, Some("ROOT_PART"))?;
        self.partition_ids
            .insert("ROOT_PART_VOL".to_string(), "LVRoot".to_string());
        Ok(number)
    }

    pub fn create_root_raid_partition(&mut self, size: PartitionSize) -> Result<u32> {
        let number = self.add_partition(role::ROOT, "p.lxraid", size, PartitionType::Raid, Some("RAID_PART"))?;
        self.partition_ids
            .insert("ROOT_PART".to_string(), number.to_string());
        Ok(number)
    }

    pub fn create_root_partition(&mut self, size: PartitionSize) -> Result<u32> {
        self.add_partition(role::ROOT, "p.lxroot", size, PartitionType::Linux, Some("ROOT_PART"))
    }

    /// Copy target of the root partition, numbered from 1.
    pub fn create_root_clone_partition(&mut self, index: u32, mbytes: u64) -> Result<u32> {
        self.add_partition(
            &role::rootclone(index),
            &format!("p.lxrootclone{}", index),
            PartitionSize::Mbytes(mbytes),
            PartitionType::Linux,
            None,
        )
    }

    /// Copy target of the boot partition, numbered from 1.
    pub fn create_boot_clone_partition(&mut self, index: u32, size: PartitionSize) -> Result<u32> {
        self.add_partition(
            &role::bootclone(index),
            &format!("p.lxbootclone{}", index),
            size,
            PartitionType::Linux,
            None,
        )
    }

    /// Mark the partition the firmware boots from: PReP, boot or root.
    pub fn activate_boot_partition(&mut self) -> Result<()> {
        let number = [role::PREP, role::BOOT, role::ROOT]
            .iter()
            .find_map(|r| self.partitions.get(*r).copied());
        if let Some(number) = number {
            self.partitioner.set_flag(number, PartitionFlag::Active)?;
        }
        Ok(())
    }

    pub fn create_hybrid_mbr(&mut self) -> Result<()> {
        info!("--> creating hybrid MBR");
        self.partitioner.set_hybrid_mbr()
    }

    pub fn create_mbr(&mut self) -> Result<()> {
        info!("--> converting partition table to MBR");
        self.partitioner.set_mbr()
    }

    pub fn resize_table(&mut self, entries: u32) -> Result<()> {
        self.partitioner.resize_table(entries)
    }

    pub fn partition_number(&self, role_name: &str) -> Option<u32> {
        self.partitions.get(role_name).copied()
    }

    /// Make partition nodes visible to the kernel.
    ///
    /// Loop devices go through device mapper, real disks get a rescan.
    pub fn map_partitions(&mut self) -> Result<()> {
        if self.storage.is_loop {
            Cmd::new("kpartx")
                .args(["-s", "-a"])
                .arg(&self.storage.device)
                .error_msg("Failed to map partitions")
                .run()?;
        } else {
            Cmd::new("partprobe")
                .arg(&self.storage.device)
                .error_msg("Failed to re-read partition table")
                .run()?;
        }
        self.mapped = true;
        Ok(())
    }

    /// Device node of partition `number`.
    pub fn partition_node(&self, number: u32) -> String {
        partition_node(&self.storage, number)
    }

    /// Role name to partition node for every created partition.
    pub fn get_device(&self) -> DeviceMap {
        self.partitions
            .iter()
            .map(|(name, number)| {
                (
                    name.clone(),
                    MappedDevice::new(self.partition_node(*number), self.storage.is_loop),
                )
            })
            .collect()
    }

    /// `KEY -> partition number` pairs for `config.partids`.
    ///
    /// `BOOT_PART` falls back to the root partition.
    pub fn get_public_partition_id_map(&self) -> BTreeMap<String, String> {
        let mut ids = self.partition_ids.clone();
        if !ids.contains_key("BOOT_PART") {
            if let Some(root) = ids.get("ROOT_PART").cloned() {
                ids.insert("BOOT_PART".to_string(), root);
            }
        }
        ids
    }

    /// Remove the partition mappings of a loop device.
    pub fn release(&mut self) -> Result<()> {
        if !self.mapped {
            return Ok(());
        }
        self.mapped = false;
        if self.storage.is_loop {
            Cmd::new("kpartx")
                .args(["-s", "-d"])
                .arg(&self.storage.device)
                .error_msg("Failed to remove partition mappings")
                .run()?;
        }
        Ok(())
    }
}

impl Drop for Disk {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("partition unmapping failed: {}", e);
        }
    }
}

/// `/dev/mapper/loop0p2` for loop devices, `/dev/sda2` or `/dev/nvme0n1p2`
/// for real ones.
fn partition_node(storage: &MappedDevice, number: u32) -> String {
    if storage.is_loop {
        let name = storage
            .device
            .rsplit('/')
            .next()
            .unwrap_or(storage.device.as_str());
        format!("/dev/mapper/{}p{}", name, number)
    } else if storage.device.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", storage.device, number)
    } else {
        format!("{}{}", storage.device, number)
    }
}
