//! Per-build disk identifier.
//!
//! A random 32-bit token written into the boot tree (`boot/mbrid`) and at
//! MBR offset 440 so the installed bootloader can find its own disk.

use crate::error::{IoContext, Result};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::info;

/// Byte offset of the disk signature in the MBR.
pub const MBR_ID_OFFSET: u64 = 440;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemIdentifier {
    image_id: u32,
}

impl SystemIdentifier {
    /// Generate a fresh random identifier.
    pub fn calculate() -> Self {
        let bytes = uuid::Uuid::new_v4().into_bytes();
        Self {
            image_id: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    pub fn from_value(image_id: u32) -> Self {
        Self { image_id }
    }

    pub fn value(&self) -> u32 {
        self.image_id
    }

    /// Hex form, e.g. `0x0a1b2c3d`.
    pub fn get_id(&self) -> String {
        format!("0x{:08x}", self.image_id)
    }

    /// Write the hex form followed by a newline.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).at_path(parent)?;
        }
        fs::write(path, format!("{}\n", self.get_id())).at_path(path)
    }

    /// Write the 4-byte little-endian token at the MBR signature offset.
    pub fn write_to_disk(&self, device: &Path) -> Result<()> {
        info!("--> writing disk identifier {} to {}", self.get_id(), device.display());
        let mut disk = OpenOptions::new().write(true).open(device).at_path(device)?;
        disk.seek(SeekFrom::Start(MBR_ID_OFFSET)).at_path(device)?;
        disk.write_all(&self.image_id.to_le_bytes()).at_path(device)?;
        disk.flush().at_path(device)
    }

    /// Token currently stored at the MBR signature offset of `disk`.
    pub fn read_from_disk(disk: &Path) -> Result<Self> {
        let mut file = fs::File::open(disk).at_path(disk)?;
        file.seek(SeekFrom::Start(MBR_ID_OFFSET)).at_path(disk)?;
        let mut bytes = [0u8; 4];
        file.read_exact(&mut bytes).at_path(disk)?;
        Ok(Self::from_value(u32::from_le_bytes(bytes)))
    }
}
