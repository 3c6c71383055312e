//! systemd-boot: loader.conf plus one BLS entry on the EFI partition.

use super::bls;
use super::{BootLoaderBase, BootLoaderConfig, BootParams, BootTarget, BootloaderState};
use crate::bootloader::template::systemd_boot as templates;
use crate::bootloader::template::Values;
use crate::error::{Error, Result};
use crate::utils::fs::{copy_file, write_file};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug)]
pub struct SystemdBootLoaderConfig {
    base: BootLoaderBase,
    entry_name: Option<String>,
    loader_conf: Option<String>,
    entry: Option<String>,
}

impl SystemdBootLoaderConfig {
    pub fn new(base: BootLoaderBase) -> Self {
        Self {
            base,
            entry_name: None,
            loader_conf: None,
            entry: None,
        }
    }

    fn loader_dir(&self) -> PathBuf {
        self.base.boot_dir.join("boot/efi/loader")
    }

    fn require_disk(&self, target: BootTarget) -> Result<()> {
        if target != BootTarget::Disk {
            return Err(Error::bootloader(format!(
                "systemd-boot does not support the {} target",
                target
            )));
        }
        if self.base.firmware.efi_mode().is_none() {
            return Err(Error::bootloader("systemd-boot requires EFI firmware"));
        }
        Ok(())
    }

    /// Kernel directory on the EFI partition, relative to its root.
    fn kernel_dir(&self, params: &BootParams) -> Result<String> {
        Ok(format!(
            "{}/{}",
            bls::os_release_id(&self.base.root_dir)?,
            params.kernel_version
        ))
    }

    fn entry_name(&mut self, params: &BootParams) -> Result<String> {
        if let Some(name) = &self.entry_name {
            return Ok(name.clone());
        }
        let name = bls::entry_file_name(&self.base.root_dir, &params.kernel_version)?;
        self.entry_name = Some(name.clone());
        Ok(name)
    }
}

impl BootLoaderConfig for SystemdBootLoaderConfig {
    fn setup_boot_images(&mut self, target: BootTarget, params: &BootParams) -> Result<()> {
        self.require_disk(target)?;
        let image_name = crate::defaults::efi_image_name(self.base.arch())
            .ok_or_else(|| Error::bootloader(format!("no EFI image name for {}", self.base.arch())))?;
        let loader = self
            .base
            .root_dir
            .join("usr/lib/systemd/boot/efi")
            .join(format!("systemd-{}", image_name));
        if !loader.exists() {
            return Err(Error::not_found("systemd-boot EFI binary", loader));
        }

        let efi_path = self.base.create_efi_path(target)?;
        copy_file(&loader, &efi_path.join(image_name))?;
        copy_file(
            &loader,
            &self.base.boot_dir.join("boot/efi/EFI/systemd").join(format!("systemd-{}", image_name)),
        )?;

        let kernel_dir = self.base.boot_dir.join("boot/efi").join(self.kernel_dir(params)?);
        for (name, target_name) in [(&params.kernel, "linux"), (&params.initrd, "initrd")] {
            let source = self.base.root_dir.join("boot").join(name);
            if !source.exists() {
                return Err(Error::not_found("boot file", source));
            }
            info!("--> copying {} to the EFI partition", name);
            copy_file(&source, &kernel_dir.join(target_name))?;
        }
        self.base.advance(BootloaderState::BootImagesWritten)
    }

    fn setup_image_config(&mut self, target: BootTarget, params: &BootParams) -> Result<()> {
        self.require_disk(target)?;
        let entry_name = self.entry_name(params)?;
        let kernel_dir = self.kernel_dir(params)?;

        let mut values = Values::new();
        values.insert("boot_timeout", self.base.timeout().to_string());
        values.insert("default_entry", entry_name);
        values.insert("title", self.base.title().to_string());
        values.insert("kernel_file", format!("/{}/linux", kernel_dir));
        values.insert("initrd_file", format!("/{}/initrd", kernel_dir));
        values.insert("boot_options", self.base.get_boot_cmdline(params));

        let loader_conf = BootLoaderBase::render(&templates::loader_template(), &values)?;
        let entry = BootLoaderBase::render(&templates::entry_template(), &values)?;
        self.base.advance(BootloaderState::ConfigRendered)?;
        self.loader_conf = Some(loader_conf);
        self.entry = Some(entry);
        Ok(())
    }

    fn write(&mut self) -> Result<()> {
        let (Some(loader_conf), Some(entry), Some(name)) =
            (&self.loader_conf, &self.entry, &self.entry_name)
        else {
            return Err(Error::bootloader("no systemd-boot configuration rendered"));
        };
        let loader_dir = self.loader_dir();
        info!("Writing systemd-boot config to {}", loader_dir.display());
        write_file(&loader_dir.join("loader.conf"), loader_conf)?;
        write_file(&loader_dir.join("entries").join(name), entry)?;
        self.base.advance(BootloaderState::Written)
    }

    fn state(&self) -> BootloaderState {
        self.base.state
    }
}
