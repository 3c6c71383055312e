//! Bootloader installation onto the finished disk.
//!
//! Installers mount what they need, run the platform tool and tear their
//! mounts down in reverse order whatever the outcome.

pub mod grub2;
pub mod zipl;

pub use grub2::Grub2Install;
pub use zipl::ZiplInstall;

use crate::config::BootloaderKind;
use crate::error::{Error, Result};
use crate::firmware::Firmware;
use std::path::Path;
use tracing::info;

/// Device nodes of the finished disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallDevices {
    /// Whole disk.
    pub disk_device: String,
    pub root_device: String,
    /// Separate `/boot`, `None` when it lives on the root device.
    pub boot_device: Option<String>,
    pub efi_device: Option<String>,
    pub prep_device: Option<String>,
    /// Subvolume to mount as `/` when the root is not the default one.
    pub root_volume_name: Option<String>,
    /// Volumes below the root: relative path, device and mount options.
    pub volumes: Vec<(String, String, Vec<String>)>,
}

impl InstallDevices {
    pub fn boot_device(&self) -> &str {
        self.boot_device.as_deref().unwrap_or(&self.root_device)
    }
}

pub trait BootLoaderInstall {
    /// Whether an explicit install step exists for this setup.
    fn install_required(&self) -> bool;

    fn install(&mut self) -> Result<()>;
}

/// Families that are complete once their config is written.
#[derive(Debug)]
pub struct SelfInstalled {
    kind: BootloaderKind,
}

impl BootLoaderInstall for SelfInstalled {
    fn install_required(&self) -> bool {
        false
    }

    fn install(&mut self) -> Result<()> {
        info!("{:?} needs no install step", self.kind);
        Ok(())
    }
}

pub fn new_bootloader_install(
    kind: BootloaderKind,
    firmware: &Firmware,
    root_dir: &Path,
    devices: InstallDevices,
) -> Result<Box<dyn BootLoaderInstall>> {
    Ok(match kind {
        BootloaderKind::Grub2 => Box::new(Grub2Install::new(firmware, root_dir, devices)),
        BootloaderKind::Zipl => Box::new(ZiplInstall::new(devices)),
        BootloaderKind::SystemdBoot | BootloaderKind::Isolinux => Box::new(SelfInstalled { kind }),
        BootloaderKind::Custom => {
            return Err(Error::NotImplemented {
                what: "custom bootloader install".to_string(),
            })
        }
    })
}
