//! zipl configuration for s390 disks.
//!
//! The target geometry and the offset of the first partition are read from
//! the disk itself, so the config can only be rendered once the partition
//! table exists.

use super::bls;
use super::{BootLoaderBase, BootLoaderConfig, BootParams, BootTarget, BootloaderState};
use crate::bootloader::template::zipl as templates;
use crate::bootloader::template::Values;
use crate::config::{PartitionTableType, ZiplConfig};
use crate::defaults;
use crate::error::{Error, Result};
use crate::process::Cmd;
use crate::utils::fs::{copy_file, write_file};
use regex::Regex;
use std::path::PathBuf;
use tracing::info;

/// Signed composite image name below `boot/zipl`.
pub const SECURE_IMAGE_NAME: &str = "secure_linux.img";

/// Cylinders, tracks per cylinder, blocks per track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u64,
    pub tracks_per_cylinder: u64,
    pub blocks_per_track: u64,
}

impl DiskGeometry {
    fn as_value(&self) -> String {
        format!(
            "{},{},{}",
            self.cylinders, self.tracks_per_cylinder, self.blocks_per_track
        )
    }
}

fn geometry_error(output: &str) -> Error {
    Error::bootloader(format!("unknown format for disk geometry: {}", output.trim()))
}

fn capture_u64(re: &Regex, text: &str, group: usize) -> Option<u64> {
    re.captures(text)?.get(group)?.as_str().parse().ok()
}

fn read_dasd_geometry(device: &str) -> Result<DiskGeometry> {
    let output = Cmd::new("fdasd")
        .args(["-f", "-p", device])
        .error_msg("Failed to read DASD geometry")
        .run()?
        .stdout;
    let field = |name: &str| -> Result<u64> {
        let re = Regex::new(&format!(r"(?m)^\s*{}\s*\.*:\s*(\d+)", regex::escape(name)))
            .map_err(|e| Error::bootloader(e.to_string()))?;
        capture_u64(&re, &output, 1).ok_or_else(|| geometry_error(&output))
    };
    Ok(DiskGeometry {
        cylinders: field("cylinders")?,
        tracks_per_cylinder: field("tracks per cylinder")?,
        blocks_per_track: field("blocks per track")?,
    })
}

fn read_msdos_geometry(device: &str) -> Result<DiskGeometry> {
    let output = Cmd::new("sfdisk")
        .args(["-g", device])
        .error_msg("Failed to read disk geometry")
        .run()?
        .stdout;
    let re = Regex::new(r"/dev.*: (\d+) cylinders, (\d+) heads, (\d+) sectors/track")
        .map_err(|e| Error::bootloader(e.to_string()))?;
    let captures = re.captures(&output).ok_or_else(|| geometry_error(&output))?;
    let group = |n: usize| -> Result<u64> {
        captures
            .get(n)
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| geometry_error(&output))
    };
    Ok(DiskGeometry {
        cylinders: group(1)?,
        tracks_per_cylinder: group(2)?,
        blocks_per_track: group(3)?,
    })
}

/// Start of the first partition as reported by the partition tool.
fn read_first_partition_start(device: &str, table: PartitionTableType) -> Result<u64> {
    if table == PartitionTableType::Dasd {
        let output = Cmd::new("fdasd")
            .args(["-f", "-s", "-p", device])
            .error_msg("Failed to read DASD partitions")
            .run()?
            .stdout;
        output
            .lines()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|start| start.parse().ok())
            .ok_or_else(|| Error::bootloader(format!("unknown partition format: {}", output.trim())))
    } else {
        let output = Cmd::new("parted")
            .args(["-m", device, "unit", "s", "print"])
            .error_msg("Failed to read partition table")
            .run()?
            .stdout;
        let re = Regex::new(r"(?m)^1:(\d+)s").map_err(|e| Error::bootloader(e.to_string()))?;
        capture_u64(&re, &output, 1)
            .ok_or_else(|| Error::bootloader(format!("unknown partition format: {}", output.trim())))
    }
}

#[derive(Debug)]
pub struct ZiplBootLoaderConfig {
    base: BootLoaderBase,
    target_type: String,
    target_blocksize: u32,
    host_key_certificates: Vec<PathBuf>,
    entry_name: Option<String>,
    config: Option<String>,
    entry: Option<String>,
}

impl ZiplBootLoaderConfig {
    pub fn new(base: BootLoaderBase, zipl: &ZiplConfig) -> Result<Self> {
        if !base.firmware.is_s390() {
            return Err(Error::bootloader(format!(
                "zipl is not supported on {}",
                base.arch()
            )));
        }
        Ok(Self {
            base,
            target_type: zipl
                .target_type
                .clone()
                .unwrap_or_else(|| defaults::S390_DISK_TYPE.to_string()),
            target_blocksize: zipl.target_blocksize.unwrap_or(defaults::S390_DISK_BLOCK_SIZE),
            host_key_certificates: zipl.host_key_certificates.clone(),
            entry_name: None,
            config: None,
            entry: None,
        })
    }

    fn zipl_dir(&self) -> PathBuf {
        self.base.boot_dir.join("boot/zipl")
    }

    fn secure(&self) -> bool {
        !self.host_key_certificates.is_empty()
    }

    fn require_disk(target: BootTarget) -> Result<()> {
        if target == BootTarget::Disk {
            Ok(())
        } else {
            Err(Error::bootloader(format!("zipl does not support the {} target", target)))
        }
    }

    fn build_secure_image(&self, params: &BootParams) -> Result<()> {
        for certificate in &self.host_key_certificates {
            if !certificate.exists() {
                return Err(Error::not_found("host key certificate", certificate));
            }
        }
        let zipl_dir = self.zipl_dir();
        let parmfile = zipl_dir.join("parmfile");
        write_file(&parmfile, &self.base.get_boot_cmdline(params))?;

        let boot = self.base.root_dir.join("boot");
        let mut cmd = Cmd::new("genprotimg")
            .arg("-i")
            .arg_path(&boot.join(&params.kernel))
            .arg("-r")
            .arg_path(&boot.join(&params.initrd))
            .arg("-p")
            .arg_path(&parmfile);
        for certificate in &self.host_key_certificates {
            cmd = cmd.arg("-k").arg_path(certificate);
        }
        info!("--> creating secure execution image");
        cmd.arg("-o")
            .arg_path(&zipl_dir.join(SECURE_IMAGE_NAME))
            .error_msg("Failed to create secure execution image")
            .run()?;
        Ok(())
    }
}

impl BootLoaderConfig for ZiplBootLoaderConfig {
    fn setup_boot_images(&mut self, target: BootTarget, params: &BootParams) -> Result<()> {
        Self::require_disk(target)?;
        if self.secure() {
            self.build_secure_image(params)?;
        } else {
            for name in [&params.kernel, &params.initrd] {
                let source = self.base.root_dir.join("boot").join(name);
                if !source.exists() {
                    return Err(Error::not_found("boot file", source));
                }
                copy_file(&source, &self.zipl_dir().join(name))?;
            }
        }
        self.base.advance(BootloaderState::BootImagesWritten)
    }

    fn setup_image_config(&mut self, target: BootTarget, params: &BootParams) -> Result<()> {
        Self::require_disk(target)?;
        let device = params
            .target_device
            .as_deref()
            .ok_or_else(|| Error::bootloader("targetbase device name is required for zipl setup"))?;

        let table = self.base.firmware.partition_table_type();
        let geometry = if table == PartitionTableType::Dasd {
            read_dasd_geometry(device)?
        } else {
            read_msdos_geometry(device)?
        };
        let offset = read_first_partition_start(device, table)? * geometry.blocks_per_track;
        let with_geometry = !self.target_type.eq_ignore_ascii_case("SCSI");

        let mut values = Values::new();
        values.insert("target_directory", ".".to_string());
        values.insert("boot_timeout", self.base.timeout().to_string());
        values.insert("targetbase", device.to_string());
        values.insert("targettype", self.target_type.clone());
        values.insert("targetblocksize", self.target_blocksize.to_string());
        values.insert("targetoffset", offset.to_string());
        values.insert("targetgeometry", geometry.as_value());
        values.insert("title", self.base.title().to_string());
        values.insert("kernel_version", params.kernel_version.clone());
        values.insert("kernel_file", format!("/boot/zipl/{}", params.kernel));
        values.insert("initrd_file", format!("/boot/zipl/{}", params.initrd));
        values.insert("secure_image_file", format!("/boot/zipl/{}", SECURE_IMAGE_NAME));
        values.insert("boot_options", self.base.get_boot_cmdline(params));

        let config = BootLoaderBase::render(&templates::config_template(with_geometry), &values)?;
        let entry = BootLoaderBase::render(&templates::entry_template(self.secure()), &values)?;
        let entry_name = bls::entry_file_name(&self.base.root_dir, &params.kernel_version)?;
        self.base.advance(BootloaderState::ConfigRendered)?;
        self.config = Some(config);
        self.entry = Some(entry);
        self.entry_name = Some(entry_name);
        Ok(())
    }

    fn write(&mut self) -> Result<()> {
        let (Some(config), Some(entry), Some(name)) = (&self.config, &self.entry, &self.entry_name) else {
            return Err(Error::bootloader("no zipl configuration rendered"));
        };
        info!("Writing zipl config file");
        write_file(&self.zipl_dir().join("config"), config)?;
        write_file(&self.base.boot_dir.join(bls::ENTRIES_DIR).join(name), entry)?;
        self.base.advance(BootloaderState::Written)
    }

    fn state(&self) -> BootloaderState {
        self.base.state
    }
}
