//! isolinux menus for BIOS booted install and live ISOs.

use super::{BootLoaderBase, BootLoaderConfig, BootParams, BootTarget, BootloaderState};
use crate::bootloader::template::isolinux as templates;
use crate::bootloader::template::Values;
use crate::error::{Error, Result};
use crate::utils::fs::{copy_file, write_file};
use std::path::PathBuf;
use tracing::{info, warn};

/// Loader binaries looked up in the system tree, first one mandatory.
const LOADER_FILES: &[&str] = &["isolinux.bin", "ldlinux.c32", "menu.c32", "mboot.c32", "gfxboot.c32"];

const SYSLINUX_DIRS: &[&str] = &["usr/share/syslinux", "usr/lib/syslinux/modules/bios", "usr/lib/ISOLINUX"];

#[derive(Debug)]
pub struct IsolinuxBootLoaderConfig {
    base: BootLoaderBase,
    config: Option<String>,
    message: Option<String>,
}

impl IsolinuxBootLoaderConfig {
    pub fn new(base: BootLoaderBase) -> Self {
        Self {
            base,
            config: None,
            message: None,
        }
    }

    fn loader_dir(&self) -> PathBuf {
        self.base
            .boot_dir
            .join(format!("boot/{}/loader", self.base.arch()))
    }

    fn require_iso(target: BootTarget) -> Result<()> {
        if target.is_iso() {
            Ok(())
        } else {
            Err(Error::bootloader("isolinux only supports ISO targets"))
        }
    }

    fn multiboot(&self) -> bool {
        self.base.settings.hypervisor_domain.as_deref() == Some("dom0")
    }
}

impl BootLoaderConfig for IsolinuxBootLoaderConfig {
    fn setup_boot_images(&mut self, target: BootTarget, _params: &BootParams) -> Result<()> {
        Self::require_iso(target)?;
        let loader_dir = self.loader_dir();
        for (index, name) in LOADER_FILES.iter().enumerate() {
            let source = SYSLINUX_DIRS
                .iter()
                .map(|dir| self.base.root_dir.join(dir).join(name))
                .find(|path| path.exists());
            match source {
                Some(source) => copy_file(&source, &loader_dir.join(name))?,
                None if index == 0 => {
                    return Err(Error::not_found(
                        "isolinux loader",
                        self.base.root_dir.join(SYSLINUX_DIRS[0]).join(name),
                    ))
                }
                None => warn!("isolinux module {} not found, skipped", name),
            }
        }
        self.base.advance(BootloaderState::BootImagesWritten)
    }

    fn setup_image_config(&mut self, target: BootTarget, params: &BootParams) -> Result<()> {
        Self::require_iso(target)?;
        let install = target == BootTarget::InstallIso;
        let failsafe = self.base.failsafe_requested();
        let theme = self.base.settings.theme.is_some();
        let title = BootLoaderBase::quote_title(self.base.title());

        let template = if install {
            templates::install_template(self.multiboot(), failsafe, theme)
        } else {
            templates::live_template(self.multiboot(), failsafe, true, theme)
        };

        let mut values = Values::new();
        values.insert(
            "default_boot",
            if install { "harddisk".to_string() } else { title.clone() },
        );
        // isolinux counts in tenths of a second
        values.insert("boot_timeout", (self.base.timeout() * 10).to_string());
        values.insert("title", title);
        values.insert("kernel_file", params.kernel.clone());
        values.insert("initrd_file", params.initrd.clone());
        values.insert(
            "hypervisor",
            params.hypervisor.clone().unwrap_or_else(|| "xen.gz".to_string()),
        );
        values.insert("boot_options", self.base.get_boot_cmdline(params));
        values.insert("failsafe_boot_options", self.base.get_failsafe_cmdline(params));

        let config = BootLoaderBase::render(&template, &values)?;
        let message = BootLoaderBase::render(&templates::message_template(install), &values)?;
        self.base.advance(BootloaderState::ConfigRendered)?;
        self.config = Some(config);
        self.message = Some(message);
        Ok(())
    }

    fn write(&mut self) -> Result<()> {
        let (Some(config), Some(message)) = (&self.config, &self.message) else {
            return Err(Error::bootloader("no isolinux configuration rendered"));
        };
        let loader_dir = self.loader_dir();
        info!("Writing isolinux config to {}", loader_dir.display());
        write_file(&loader_dir.join("isolinux.cfg"), config)?;
        write_file(&loader_dir.join("isolinux.msg"), message)?;
        self.base.advance(BootloaderState::Written)
    }

    fn state(&self) -> BootloaderState {
        self.base.state
    }
}
