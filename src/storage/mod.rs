//! Block devices, partition tables and the device map.
//!
//! Every layer that produces a device node (loop device, partition mapping,
//! RAID array, LUKS mapping, logical volume) exposes it through
//! [`DeviceHandle`]. The [`DeviceMap`] stores plain [`MappedDevice`] values
//! keyed by role; wrapping the root partition in RAID or LUKS replaces the
//! `root` entry and nothing downstream needs to know.
//!
//! # Architecture
//!
//! ```text
//! LoopDevice ──> Disk (partitioner) ──> DeviceMap
//!                                         │ root
//!                                         ├──> RaidDevice ──> root
//!                                         ├──> IntegrityDevice ──> root
//!                                         └──> LuksDevice ──> root
//! ```

pub mod disk;
pub mod integrity;
pub mod loop_device;
pub mod luks;
pub mod partitioner;
pub mod raid;
pub mod setup;
pub mod table;

pub use disk::Disk;
pub use integrity::IntegrityDevice;
pub use loop_device::LoopDevice;
pub use luks::LuksDevice;
pub use partitioner::{PartitionSize, PartitionType, Partitioner};
pub use raid::RaidDevice;
pub use setup::DiskSetup;
pub use table::{PartitionPlan, PartitionTableBuilder};

use crate::error::{Error, Result};
use crate::process::Cmd;
use std::collections::BTreeMap;

/// Anything that resolves to a device node.
pub trait DeviceHandle {
    fn device(&self) -> &str;
    fn is_loop(&self) -> bool;
}

/// A device node recorded in the device map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedDevice {
    pub device: String,
    pub is_loop: bool,
}

impl MappedDevice {
    pub fn new(device: impl Into<String>, is_loop: bool) -> Self {
        Self {
            device: device.into(),
            is_loop,
        }
    }

    /// Snapshot any handle for storage in a [`DeviceMap`].
    pub fn from_handle(handle: &dyn DeviceHandle) -> Self {
        Self::new(handle.device(), handle.is_loop())
    }
}

impl DeviceHandle for MappedDevice {
    fn device(&self) -> &str {
        &self.device
    }

    fn is_loop(&self) -> bool {
        self.is_loop
    }
}

/// Role name to device node.
pub type DeviceMap = BTreeMap<String, MappedDevice>;

/// Device map role names.
pub mod role {
    pub const ROOT: &str = "root";
    pub const BOOT: &str = "boot";
    pub const EFI: &str = "efi";
    pub const EFI_CSM: &str = "efi_csm";
    pub const PREP: &str = "prep";
    pub const SWAP: &str = "swap";
    pub const SPARE: &str = "spare";
    pub const READONLY: &str = "readonly";
    /// Root partition before RAID, integrity or LUKS wrapped it.
    pub const ROOT_PARTITION: &str = "root_partition";

    pub fn rootclone(n: u32) -> String {
        format!("rootclone{}", n)
    }

    pub fn bootclone(n: u32) -> String {
        format!("bootclone{}", n)
    }
}

/// Look up a role that must exist.
pub fn require<'a>(map: &'a DeviceMap, name: &str) -> Result<&'a MappedDevice> {
    map.get(name).ok_or_else(|| Error::Partitioner {
        message: format!("no '{}' device in device map", name),
    })
}

/// Read one blkid tag (`UUID`, `LABEL`, `PARTUUID`, `TYPE`) of a device.
pub fn block_id(device: &str, tag: &str) -> Result<String> {
    let out = Cmd::new("blkid")
        .args(["-s", tag, "-o", "value"])
        .arg(device)
        .error_msg(format!("Failed to read {} of {}", tag, device))
        .run()?;
    Ok(out.stdout.trim().to_string())
}
