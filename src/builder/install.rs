//! Installation media for OEM disks.
//!
//! The install ISO carries the compressed raw disk, the kernel and initrd of
//! the prepared boot image and a loader for every firmware the disk supports.
//! The PXE archive carries the same payload for network installs.
//!
//! ```text
//! <media>/
//!   <stem>.raw.zst, <stem>.md5
//!   boot/<hexid>, boot/mbrid
//!   boot/<arch>/loader/{linux,initrd,isolinux.*,grub2/}
//!   boot/<arch>/efi          FAT image with EFI/BOOT
//!   EFI/BOOT/
//! ```

use crate::boot::BootImageSnapshot;
use crate::bootloader::{new_bootloader_config, BootParams};
use crate::config::{BootloaderKind, ImageConfiguration};
use crate::error::{Error, IoContext, Result};
use crate::firmware::Firmware;
use crate::process::Cmd;
use crate::system::SystemIdentifier;
use crate::utils::{checksum, compress, fs::copy_file};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// Volume id the installer looks for.
pub const INSTALL_VOLUME_ID: &str = "INSTALL";

const EFI_IMAGE_MBYTES: u64 = 32;

pub struct InstallImageBuilder<'a> {
    config: &'a ImageConfiguration,
    firmware: &'a Firmware,
    root_dir: PathBuf,
    target_dir: PathBuf,
    boot: BootImageSnapshot,
    mbrid: SystemIdentifier,
}

impl<'a> InstallImageBuilder<'a> {
    /// Install media get an identifier of their own; the initrd finds the
    /// media through `boot/<hexid>`.
    pub fn new(
        config: &'a ImageConfiguration,
        firmware: &'a Firmware,
        root_dir: &Path,
        target_dir: &Path,
        boot: BootImageSnapshot,
    ) -> Self {
        Self {
            config,
            firmware,
            root_dir: root_dir.to_path_buf(),
            target_dir: target_dir.to_path_buf(),
            boot,
            mbrid: SystemIdentifier::calculate(),
        }
    }

    pub fn with_identifier(mut self, mbrid: SystemIdentifier) -> Self {
        self.mbrid = mbrid;
        self
    }

    pub fn iso_filename(&self) -> PathBuf {
        self.target_dir
            .join(format!("{}.install.iso", self.config.image_stem()))
    }

    pub fn pxe_filename(&self) -> PathBuf {
        self.target_dir
            .join(format!("{}.install.tar.zst", self.config.image_stem()))
    }

    fn work_dir(&self, prefix: &str) -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.target_dir)
            .at_path(&self.target_dir)
    }

    fn kernel_file(&self) -> Result<PathBuf> {
        let kernel = self
            .boot
            .boot_root_directory
            .join("boot")
            .join(&self.boot.kernel_name);
        if !kernel.exists() {
            return Err(Error::not_found("kernel", kernel));
        }
        Ok(kernel)
    }

    fn initrd_file(&self) -> Result<PathBuf> {
        let initrd = self.boot.initrd_filename.clone().unwrap_or_else(|| {
            self.boot
                .boot_root_directory
                .join("boot")
                .join(&self.boot.initrd_name)
        });
        if !initrd.exists() {
            return Err(Error::not_found("initrd", initrd));
        }
        Ok(initrd)
    }

    /// Compress the raw disk and digest it, both moved into `dir`.
    fn stage_disk(&self, raw: &Path, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let stem = self.config.image_stem();
        info!("--> compressing {}", raw.display());
        let packed = compress::compress_file(raw)?;
        let packed_target = dir.join(format!("{}.raw.zst", stem));
        fs::rename(&packed, &packed_target).at_path(&packed)?;

        let md5 = checksum::write_md5(raw)?;
        let md5_target = dir.join(format!("{}.md5", stem));
        fs::rename(&md5, &md5_target).at_path(&md5)?;
        Ok((packed_target, md5_target))
    }

    fn boot_params(&self) -> BootParams {
        BootParams {
            mbrid: Some(self.mbrid),
            kernel: "linux".to_string(),
            initrd: "initrd".to_string(),
            kernel_version: self.boot.kernel_version.clone(),
            ..Default::default()
        }
    }

    /// Build `<stem>.install.iso`. The ISO is hybrid, so it also serves as
    /// the install stick image.
    pub fn create_install_iso(&self, raw: &Path) -> Result<PathBuf> {
        let bios = self.firmware.is_x86()
            && (self.firmware.bios_mode() || self.firmware.legacy_bios_mode());
        let efi = self.firmware.efi_mode().is_some();
        if !bios && !efi {
            return Err(Error::bootloader(
                "install media need BIOS or EFI firmware",
            ));
        }

        info!("Creating install ISO");
        let media = self.work_dir(".install-media")?;
        let media_dir = media.path();
        self.stage_disk(raw, media_dir)?;

        self.mbrid
            .write(&media_dir.join("boot").join(self.mbrid.get_id()))?;
        self.mbrid.write(&media_dir.join("boot/mbrid"))?;

        let loader_rel = format!("boot/{}/loader", self.config.arch);
        let loader_dir = media_dir.join(&loader_rel);
        copy_file(&self.kernel_file()?, &loader_dir.join("linux"))?;
        copy_file(&self.initrd_file()?, &loader_dir.join("initrd"))?;

        let params = self.boot_params();
        if bios {
            info!("--> setting up isolinux");
            let mut isolinux = new_bootloader_config(
                BootloaderKind::Isolinux,
                self.config,
                self.firmware,
                &self.root_dir,
                media_dir,
            )?;
            isolinux.setup_install_boot_images(&params)?;
            isolinux.setup_install_image_config(&params)?;
            isolinux.write()?;
        }
        let efi_image_rel = format!("boot/{}/efi", self.config.arch);
        if efi {
            info!("--> setting up grub2 EFI loader");
            let mut grub = new_bootloader_config(
                BootloaderKind::Grub2,
                self.config,
                self.firmware,
                &self.root_dir,
                media_dir,
            )?;
            grub.setup_install_boot_images(&params)?;
            grub.setup_install_image_config(&params)?;
            grub.write()?;
            create_efi_fat_image(
                &media_dir.join(&efi_image_rel),
                &media_dir.join("EFI/BOOT"),
            )?;
        }

        let iso = self.iso_filename();
        info!("--> running xorriso for {}", iso.display());
        let mut cmd = Cmd::new("xorriso")
            .args(["-as", "mkisofs", "-o"])
            .arg_path(&iso)
            .args(["-V", INSTALL_VOLUME_ID, "-R", "-J"]);
        if bios {
            cmd = cmd
                .arg("-b")
                .arg(format!("{}/isolinux.bin", loader_rel))
                .arg("-c")
                .arg(format!("{}/boot.catalog", loader_rel))
                .args(["-no-emul-boot", "-boot-load-size", "4", "-boot-info-table"]);
        }
        if efi {
            if bios {
                cmd = cmd.arg("-eltorito-alt-boot");
            }
            cmd = cmd
                .arg("-e")
                .arg(&efi_image_rel)
                .args(["-no-emul-boot", "-isohybrid-gpt-basdat"]);
        }
        cmd.arg_path(media_dir)
            .error_msg("xorriso failed. Install xorriso.")
            .run()?;
        Ok(iso)
    }

    /// Build `<stem>.install.tar.zst` for network installs.
    pub fn create_install_pxe_archive(&self, raw: &Path) -> Result<PathBuf> {
        info!("Creating PXE install archive");
        let work = self.work_dir(".install-pxe")?;
        let (packed, md5) = self.stage_disk(raw, work.path())?;
        let stem = self.config.image_stem();

        let files = vec![
            (packed, format!("{}.raw.zst", stem)),
            (md5, format!("{}.md5", stem)),
            (self.kernel_file()?, format!("{}.kernel", stem)),
            (self.initrd_file()?, format!("{}.initrd", stem)),
        ];
        let archive = self.pxe_filename();
        compress::create_tar_zst_from_files(&archive, &files)?;
        Ok(archive)
    }
}

/// FAT image holding every file of `efi_boot_dir` below `EFI/BOOT`.
fn create_efi_fat_image(output: &Path, efi_boot_dir: &Path) -> Result<()> {
    info!("--> creating EFI boot image {}", output.display());
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).at_path(parent)?;
    }
    let file = fs::File::create(output).at_path(output)?;
    file.set_len(EFI_IMAGE_MBYTES * 1_048_576).at_path(output)?;
    drop(file);

    let image = output.to_string_lossy().into_owned();
    Cmd::new("mkfs.fat")
        .args(["-F", "16"])
        .arg(&image)
        .error_msg("mkfs.fat failed. Install dosfstools.")
        .run()?;
    for dir in ["::EFI", "::EFI/BOOT"] {
        Cmd::new("mmd")
            .args(["-i", &image, dir])
            .error_msg("mmd failed. Install mtools.")
            .run()?;
    }

    let mut sources: Vec<PathBuf> = Vec::new();
    if efi_boot_dir.is_dir() {
        for entry in fs::read_dir(efi_boot_dir).at_path(efi_boot_dir)? {
            let path = entry.at_path(efi_boot_dir)?.path();
            if path.is_file() {
                sources.push(path);
            }
        }
    }
    sources.sort();
    for source in sources {
        Cmd::new("mcopy")
            .args(["-i", &image])
            .arg_path(&source)
            .arg("::EFI/BOOT/")
            .error_msg(format!("mcopy failed to copy {}", source.display()))
            .run()?;
    }
    Ok(())
}
