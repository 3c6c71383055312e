//! Bootloader configuration.
//!
//! Every family moves through the same states per target:
//!
//! ```text
//! Unconfigured ──setup_boot_images──> BootImagesWritten
//!              ──setup_image_config─> ConfigRendered ──write──> Written
//! ```
//!
//! Configs only write below `boot_dir`; mounting the target disk is left
//! to the installers in [`crate::bootloader::install`].

pub mod bls;
pub mod custom;
pub mod grub2;
pub mod isolinux;
pub mod systemd_boot;
pub mod zipl;

pub use custom::CustomBootLoaderConfig;
pub use grub2::Grub2BootLoaderConfig;
pub use isolinux::IsolinuxBootLoaderConfig;
pub use systemd_boot::SystemdBootLoaderConfig;
pub use zipl::ZiplBootLoaderConfig;

use crate::bootloader::template::{Template, Values};
use crate::config::{BootloaderConfig, BootloaderKind, ImageConfiguration, VolumeManagerKind, VolumeSpec};
use crate::defaults;
use crate::error::{Error, Result};
use crate::firmware::Firmware;
use crate::storage::DiskSetup;
use crate::system::SystemIdentifier;
use crate::volume_manager::btrfs::default_volume_name;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// What the rendered config boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootTarget {
    Disk,
    InstallIso,
    LiveIso,
}

impl BootTarget {
    pub fn is_iso(self) -> bool {
        self != BootTarget::Disk
    }
}

impl fmt::Display for BootTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootTarget::Disk => "disk",
            BootTarget::InstallIso => "install-iso",
            BootTarget::LiveIso => "live-iso",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootloaderState {
    Unconfigured,
    BootImagesWritten,
    ConfigRendered,
    Written,
}

/// Per-build inputs to a bootloader config.
#[derive(Debug, Clone, Default)]
pub struct BootParams {
    /// Filesystem UUID of the device holding the boot path.
    pub boot_uuid: Option<String>,
    pub root_uuid: Option<String>,
    /// Disk identifier used by install and live media to find themselves.
    pub mbrid: Option<SystemIdentifier>,
    /// Kernel file name relative to the boot path.
    pub kernel: String,
    pub initrd: String,
    pub kernel_version: String,
    pub hypervisor: Option<String>,
    /// Extra kernel options, typically the `root=` parameter.
    pub boot_options: String,
    /// Whole-disk device node, required by zipl.
    pub target_device: Option<String>,
}

/// One bootloader family.
pub trait BootLoaderConfig {
    /// Put loader binaries, modules and kernel files in place.
    fn setup_boot_images(&mut self, target: BootTarget, params: &BootParams) -> Result<()>;

    /// Render the config text in memory.
    fn setup_image_config(&mut self, target: BootTarget, params: &BootParams) -> Result<()>;

    /// Persist the rendered config. Fails if nothing was rendered.
    fn write(&mut self) -> Result<()>;

    fn state(&self) -> BootloaderState;

    fn setup_disk_boot_images(&mut self, params: &BootParams) -> Result<()> {
        self.setup_boot_images(BootTarget::Disk, params)
    }

    fn setup_disk_image_config(&mut self, params: &BootParams) -> Result<()> {
        self.setup_image_config(BootTarget::Disk, params)
    }

    fn setup_install_boot_images(&mut self, params: &BootParams) -> Result<()> {
        self.setup_boot_images(BootTarget::InstallIso, params)
    }

    fn setup_install_image_config(&mut self, params: &BootParams) -> Result<()> {
        self.setup_image_config(BootTarget::InstallIso, params)
    }

    fn setup_live_boot_images(&mut self, params: &BootParams) -> Result<()> {
        self.setup_boot_images(BootTarget::LiveIso, params)
    }

    fn setup_live_image_config(&mut self, params: &BootParams) -> Result<()> {
        self.setup_image_config(BootTarget::LiveIso, params)
    }
}

/// Build the config for `kind`.
///
/// `root_dir` is the system tree loader data is taken from, `boot_dir` the
/// tree the results are written to. For disks both are usually the same.
pub fn new_bootloader_config(
    kind: BootloaderKind,
    config: &ImageConfiguration,
    firmware: &Firmware,
    root_dir: &Path,
    boot_dir: &Path,
) -> Result<Box<dyn BootLoaderConfig>> {
    let base = BootLoaderBase::new(config, firmware, root_dir, boot_dir);
    Ok(match kind {
        BootloaderKind::Grub2 => Box::new(Grub2BootLoaderConfig::new(base)),
        BootloaderKind::SystemdBoot => Box::new(SystemdBootLoaderConfig::new(base)),
        BootloaderKind::Zipl => Box::new(ZiplBootLoaderConfig::new(base, &config.zipl)?),
        BootloaderKind::Isolinux => Box::new(IsolinuxBootLoaderConfig::new(base)),
        BootloaderKind::Custom => Box::new(CustomBootLoaderConfig),
    })
}

/// VESA mode numbers to GRUB resolutions.
const VIDEO_MODES: &[(&str, &str)] = &[
    ("0x301", "640x480"),
    ("0x310", "640x480"),
    ("0x311", "640x480"),
    ("0x312", "640x480"),
    ("0x303", "800x600"),
    ("0x313", "800x600"),
    ("0x314", "800x600"),
    ("0x315", "800x600"),
    ("0x305", "1024x768"),
    ("0x316", "1024x768"),
    ("0x317", "1024x768"),
    ("0x318", "1024x768"),
    ("0x307", "1280x1024"),
    ("0x319", "1280x1024"),
    ("0x31a", "1280x1024"),
    ("0x31b", "1280x1024"),
];

/// State and settings shared by all families.
#[derive(Debug, Clone)]
pub struct BootLoaderBase {
    pub(crate) root_dir: PathBuf,
    pub(crate) boot_dir: PathBuf,
    pub(crate) firmware: Firmware,
    pub(crate) settings: BootloaderConfig,
    pub(crate) title: String,
    pub(crate) timeout: u32,
    pub(crate) kernel_cmdline: String,
    pub(crate) has_boot_partition: bool,
    pub(crate) bootloader: BootloaderKind,
    pub(crate) volume_manager: Option<VolumeManagerKind>,
    pub(crate) root_is_snapshot: bool,
    pub(crate) volumes: Vec<VolumeSpec>,
    pub(crate) state: BootloaderState,
}

impl BootLoaderBase {
    pub fn new(config: &ImageConfiguration, firmware: &Firmware, root_dir: &Path, boot_dir: &Path) -> Self {
        let has_boot_partition = DiskSetup::new(config, firmware, root_dir).need_boot_partition();
        Self {
            root_dir: root_dir.to_path_buf(),
            boot_dir: boot_dir.to_path_buf(),
            firmware: firmware.clone(),
            settings: config.bootloader_settings.clone(),
            title: config.menu_title().to_string(),
            timeout: config.bootloader_timeout(),
            kernel_cmdline: config.kernel_cmdline.trim().to_string(),
            has_boot_partition,
            bootloader: config.bootloader,
            volume_manager: config.volume_manager,
            root_is_snapshot: config.btrfs_root_is_snapshot,
            volumes: config.volumes.clone(),
            state: BootloaderState::Unconfigured,
        }
    }

    pub fn arch(&self) -> &str {
        self.firmware.arch()
    }

    /// Path the loader reads its data from, relative to the boot device.
    pub fn get_boot_path(&self, target: BootTarget) -> Result<String> {
        if target.is_iso() {
            return Ok(format!("/boot/{}/loader", self.arch()));
        }
        if self.has_boot_partition {
            // zipl resolves its targets through the mount path
            return Ok(if self.bootloader == BootloaderKind::Zipl {
                "/boot".to_string()
            } else {
                "/".to_string()
            });
        }
        if self.volume_manager == Some(VolumeManagerKind::Btrfs) {
            for volume in &self.volumes {
                if matches!(volume.realpath().as_str(), "boot" | "boot/grub" | "boot/grub2") {
                    return Err(Error::bootloader(format!(
                        "{} must not be a subvolume",
                        volume.realpath()
                    )));
                }
            }
            return Ok(format!("/{}/boot", default_volume_name(self.root_is_snapshot)));
        }
        Ok("/boot".to_string())
    }

    /// Join a boot path and a file name without doubling slashes.
    pub fn boot_file(boot_path: &str, name: &str) -> String {
        format!("{}/{}", boot_path.trim_end_matches('/'), name.trim_start_matches('/'))
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Title with characters menus cannot show replaced.
    pub fn quote_title(name: &str) -> String {
        name.replace(' ', "_").replace('[', "(").replace(']', ")")
    }

    pub fn timeout(&self) -> u32 {
        self.timeout
    }

    pub fn gfxmode(&self) -> String {
        match self.settings.gfxmode.as_deref() {
            Some(mode) => VIDEO_MODES
                .iter()
                .find(|(vesa, _)| *vesa == mode)
                .map(|(_, resolution)| resolution.to_string())
                .unwrap_or_else(|| mode.to_string()),
            None => "auto".to_string(),
        }
    }

    pub fn failsafe_requested(&self) -> bool {
        self.settings.failsafe.unwrap_or(true)
    }

    /// Configured kernel options plus the per-build ones.
    ///
    /// A `root=` in the configured command line wins over the computed one.
    pub fn get_boot_cmdline(&self, params: &BootParams) -> String {
        let explicit_root = self.kernel_cmdline.contains("root=");
        let mut parts: Vec<&str> = Vec::new();
        if !self.kernel_cmdline.is_empty() {
            parts.push(&self.kernel_cmdline);
        }
        for option in params.boot_options.split_whitespace() {
            if explicit_root && option.starts_with("root=") {
                warn!("Kernel root device explicitly set via kernel_cmdline");
                continue;
            }
            parts.push(option);
        }
        parts.join(" ")
    }

    pub fn get_failsafe_cmdline(&self, params: &BootParams) -> String {
        let cmdline = self.get_boot_cmdline(params);
        if cmdline.is_empty() {
            defaults::FAILSAFE_KERNEL_OPTIONS.to_string()
        } else {
            format!("{} {}", cmdline, defaults::FAILSAFE_KERNEL_OPTIONS)
        }
    }

    /// `EFI/BOOT` directory in the boot tree, created on demand.
    pub fn create_efi_path(&self, target: BootTarget) -> Result<PathBuf> {
        let path = if target.is_iso() {
            self.boot_dir.join("EFI/BOOT")
        } else {
            self.boot_dir.join("boot/efi/EFI/BOOT")
        };
        std::fs::create_dir_all(&path).map_err(|e| Error::io(&path, e))?;
        Ok(path)
    }

    pub fn render(template: &Template, values: &Values) -> Result<String> {
        template.substitute(values)
    }

    /// Move to `next`, refusing to skip the boot image stage.
    pub fn advance(&mut self, next: BootloaderState) -> Result<()> {
        let ready = match next {
            BootloaderState::Unconfigured | BootloaderState::BootImagesWritten => true,
            BootloaderState::ConfigRendered => self.state >= BootloaderState::BootImagesWritten,
            BootloaderState::Written => self.state >= BootloaderState::ConfigRendered,
        };
        if !ready {
            return Err(Error::bootloader(format!(
                "cannot move from {:?} to {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}
