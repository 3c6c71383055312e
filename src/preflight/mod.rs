//! Preflight checks for disk builds.
//!
//! Validates that the host has the tools the selected configuration needs
//! and that the process may touch block devices, before any disk I/O.
//!
//! # Example
//!
//! ```rust,ignore
//! use disk_image_builder::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("sgdisk") {
//!     println!("gdisk not installed");
//! }
//!
//! let tools = &[("kpartx", "kpartx"), ("losetup", "util-linux")];
//! check_required_tools(tools)?;
//! ```

use crate::config::{
    BootloaderKind, FilesystemKind, ImageConfiguration, PartitionTableType, VolumeManagerKind,
};
use crate::error::{Error, Result};
use crate::firmware::Firmware;

/// Check if a command exists in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools every disk build uses.
///
/// Each tuple is (command_name, package_name).
pub const BASE_REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("kpartx", "kpartx"),
    ("blkid", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("rsync", "rsync"),
    ("dd", "coreutils"),
];

/// Check that specific tools are available.
///
/// Returns a `Precondition` error listing every missing tool and the package
/// that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect();

    if !missing.is_empty() {
        return Err(Error::precondition(format!(
            "Missing required host tools:\n{}",
            missing.join("\n")
        )));
    }

    Ok(())
}

/// Tools required by a concrete image description.
pub fn tools_for(
    config: &ImageConfiguration,
    firmware: &Firmware,
) -> Vec<(&'static str, &'static str)> {
    let mut tools: Vec<(&'static str, &'static str)> = BASE_REQUIRED_TOOLS.to_vec();

    match firmware.partition_table_type() {
        PartitionTableType::Gpt => tools.push(("sgdisk", "gdisk")),
        PartitionTableType::Msdos => tools.push(("sfdisk", "util-linux")),
        PartitionTableType::Dasd => tools.push(("fdasd", "s390-tools")),
    }

    match config.filesystem {
        FilesystemKind::Ext2 | FilesystemKind::Ext3 | FilesystemKind::Ext4 => {
            tools.push(("tune2fs", "e2fsprogs"))
        }
        FilesystemKind::Btrfs => tools.push(("mkfs.btrfs", "btrfs-progs")),
        FilesystemKind::Xfs => tools.push(("mkfs.xfs", "xfsprogs")),
        FilesystemKind::Squashfs => tools.push(("mksquashfs", "squashfs-tools")),
        _ => {}
    }

    match config.volume_manager {
        Some(VolumeManagerKind::Btrfs) => tools.push(("btrfs", "btrfs-progs")),
        Some(VolumeManagerKind::Lvm) => {
            tools.push(("vgcreate", "lvm2"));
            tools.push(("lvcreate", "lvm2"));
        }
        None => {}
    }

    if firmware.efi_mode().is_some() {
        tools.push(("mkdosfs", "dosfstools"));
    }
    if config.raid.is_some() {
        tools.push(("mdadm", "mdadm"));
    }
    if config.luks.is_some() {
        tools.push(("cryptsetup", "cryptsetup"));
    }

    match config.bootloader {
        BootloaderKind::Grub2 => {
            if firmware.efi_mode().is_some() {
                tools.push(("grub2-mkimage", "grub2"));
            }
            if firmware.needs_bios_boot_sector() || firmware.ofw_mode() {
                tools.push(("grub2-install", "grub2"));
            }
        }
        BootloaderKind::Zipl => tools.push(("zipl", "s390-tools")),
        _ => {}
    }

    if config.disk_format.is_some() {
        tools.push(("qemu-img", "qemu-img"));
    }
    if config.install_iso || config.install_stick {
        tools.push(("xorriso", "xorriso"));
    }

    tools.sort();
    tools.dedup();
    tools
}

/// Check every tool the given configuration needs.
pub fn check_host_tools(config: &ImageConfiguration, firmware: &Firmware) -> Result<()> {
    check_required_tools(&tools_for(config, firmware))
}

/// Refuse to run without root privileges.
///
/// Loop devices, partition mapping and mounts all require them.
pub fn require_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(Error::precondition(
            "disk builds require root privileges (loop devices, mounts)",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_failure_lists_package() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err().to_string();
        assert!(err.contains("fake-package"));
    }

    #[test]
    fn test_tools_for_lvm_efi() {
        let config = ImageConfiguration::from_toml_str(
            r#"
            image_name = "test"
            arch = "x86_64"
            filesystem = "ext4"
            firmware = "efi"
            volume_manager = "lvm"
            "#,
        )
        .unwrap();
        let firmware = Firmware::new(&config).unwrap();
        let tools = tools_for(&config, &firmware);
        assert!(tools.contains(&("sgdisk", "gdisk")));
        assert!(tools.contains(&("vgcreate", "lvm2")));
        assert!(tools.contains(&("mkdosfs", "dosfstools")));
        assert!(tools.contains(&("grub2-install", "grub2")));
        assert!(!tools.contains(&("sfdisk", "util-linux")));
    }
}
