//! grub2-install for BIOS and PReP targets.

use super::{BootLoaderInstall, InstallDevices};
use crate::bootloader::config::grub2::GrubData;
use crate::defaults;
use crate::error::{Error, Result};
use crate::firmware::Firmware;
use crate::mount::{MountStack, RetryPolicy};
use crate::process::Cmd;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug)]
pub struct Grub2Install {
    firmware: Firmware,
    /// Only used to pick the tool prefix before anything is mounted.
    root_dir: PathBuf,
    devices: InstallDevices,
}

impl Grub2Install {
    pub fn new(firmware: &Firmware, root_dir: &Path, devices: InstallDevices) -> Self {
        Self {
            firmware: firmware.clone(),
            root_dir: root_dir.to_path_buf(),
            devices,
        }
    }

    fn grub_data(&self, root_mount: &Path) -> GrubData {
        GrubData::lookup(root_mount)
            .or_else(|_| GrubData::lookup(&self.root_dir))
            .unwrap_or_else(|_| {
                warn!("No grub data found, assuming grub2 naming");
                GrubData {
                    name: "grub2",
                    lib_dir: root_mount.join("usr/lib/grub2"),
                }
            })
    }

    fn install_mounted(&self, mounts: &mut MountStack) -> Result<()> {
        let root_options: Vec<String> = self
            .devices
            .root_volume_name
            .iter()
            .map(|name| format!("subvol={}", name))
            .collect();
        let root_mount = mounts
            .mount(&self.devices.root_device, None, &root_options)?
            .to_path_buf();

        for (path, device, options) in &self.devices.volumes {
            mounts.mount(device, Some(&root_mount.join(path)), options)?;
        }
        if let Some(boot) = &self.devices.boot_device {
            if boot != &self.devices.root_device {
                mounts.mount(boot, Some(&root_mount.join("boot")), &[])?;
            }
        }

        let data = self.grub_data(&root_mount);
        let (target, modules, device) = if self.firmware.ofw_mode() {
            let prep = self
                .devices
                .prep_device
                .as_deref()
                .ok_or_else(|| Error::bootloader("PReP device required for grub2 install"))?;
            ("powerpc-ieee1275", defaults::GRUB_OFW_MODULES, prep)
        } else {
            ("i386-pc", defaults::GRUB_BIOS_MODULES, self.devices.disk_device.as_str())
        };

        info!("Installing grub2 {} core image to {}", target, device);
        let mut cmd = Cmd::new(data.tool("install"))
            .arg("--skip-fs-probe")
            .arg("--directory")
            .arg_path(&root_mount.join("usr/lib").join(data.name).join(target))
            .arg("--boot-directory")
            .arg_path(&root_mount.join("boot"))
            .arg("--target")
            .arg(target)
            .arg("--modules")
            .arg(modules.join(" "));
        if self.firmware.ofw_mode() {
            cmd = cmd.arg("--no-nvram");
        }
        cmd.arg(device)
            .error_msg("Failed to install grub2 core image")
            .run()?;
        Ok(())
    }
}

impl BootLoaderInstall for Grub2Install {
    fn install_required(&self) -> bool {
        self.firmware.needs_bios_boot_sector() || self.firmware.ofw_mode()
    }

    fn install(&mut self) -> Result<()> {
        if !self.install_required() {
            info!("No grub2 install step for EFI-only firmware");
            return Ok(());
        }
        let mut mounts = MountStack::new().with_retry(RetryPolicy::installer());
        let result = self.install_mounted(&mut mounts);
        if !mounts.umount() {
            warn!("grub2 install mounts still busy: {:?}", mounts.mountpoints());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageConfiguration;
    use crate::process::testing::RecordingRunner;

    fn firmware(extra: &str) -> Firmware {
        let config = ImageConfiguration::from_toml_str(&format!(
            "image_name = \"a\"\narch = \"x86_64\"\n{}",
            extra
        ))
        .unwrap();
        Firmware::new(&config).unwrap()
    }

    #[test]
    fn test_bios_boot_device_is_root() {
        let (runner, _guard) = RecordingRunner::install();
        let devices = InstallDevices {
            disk_device: "/dev/loop0".to_string(),
            root_device: "/dev/mapper/loop0p1".to_string(),
            ..Default::default()
        };
        assert_eq!(devices.boot_device(), devices.root_device);

        let mut install = Grub2Install::new(&firmware(""), Path::new("/nonexistent"), devices);
        assert!(install.install_required());
        install.install().unwrap();

        let mounts = runner.commands_for("mount");
        assert_eq!(mounts.len(), 1);
        assert!(mounts[0].starts_with("mount /dev/mapper/loop0p1 "));

        let grub = runner.commands_for("grub2-install");
        assert_eq!(grub.len(), 1);
        assert!(grub[0].starts_with("grub2-install --skip-fs-probe --directory "));
        assert!(grub[0].contains("/usr/lib/grub2/i386-pc --boot-directory "));
        assert!(grub[0].contains("--target i386-pc --modules ext2 iso9660"));
        assert!(grub[0].ends_with(" /dev/loop0"));
        assert_eq!(runner.commands_for("umount").len(), 1);
    }

    #[test]
    fn test_teardown_reverse_order_on_failure() {
        let (runner, _guard) = RecordingRunner::install();
        runner.fail_when("grub2-install", "i386-pc");
        let devices = InstallDevices {
            disk_device: "/dev/loop0".to_string(),
            root_device: "/dev/mapper/loop0p3".to_string(),
            boot_device: Some("/dev/mapper/loop0p2".to_string()),
            ..Default::default()
        };
        let mut install = Grub2Install::new(&firmware(""), Path::new("/nonexistent"), devices);
        assert!(matches!(install.install(), Err(Error::Command { .. })));

        let umounts = runner.commands_for("umount");
        assert_eq!(umounts.len(), 2);
        assert!(umounts[0].ends_with("/boot"));
    }

    #[test]
    fn test_prep_target() {
        let config = ImageConfiguration::from_toml_str("image_name = \"a\"\narch = \"ppc64le\"").unwrap();
        let firmware = Firmware::new(&config).unwrap();
        let (runner, _guard) = RecordingRunner::install();
        let devices = InstallDevices {
            disk_device: "/dev/loop0".to_string(),
            root_device: "/dev/mapper/loop0p2".to_string(),
            prep_device: Some("/dev/mapper/loop0p1".to_string()),
            ..Default::default()
        };
        Grub2Install::new(&firmware, Path::new("/nonexistent"), devices)
            .install()
            .unwrap();
        let grub = runner.commands_for("grub2-install");
        assert!(grub[0].contains("--target powerpc-ieee1275"));
        assert!(grub[0].ends_with("--no-nvram /dev/mapper/loop0p1"));
    }

    #[test]
    fn test_efi_only_skips_install() {
        let (runner, _guard) = RecordingRunner::install();
        let mut install = Grub2Install::new(
            &firmware("firmware = \"efi\"\nefi_csm = false"),
            Path::new("/nonexistent"),
            InstallDevices::default(),
        );
        assert!(!install.install_required());
        install.install().unwrap();
        assert!(runner.commands().is_empty());
    }
}
