//! Standalone dm-integrity below the root filesystem.

use super::{block_id, DeviceHandle, MappedDevice};
use crate::config::IntegrityConfig;
use crate::defaults;
use crate::error::{Error, IoContext, Result};
use crate::process::Cmd;
use crate::utils::signature::sign_file;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// Fields of `integritysetup dump` used for the metadata block.
#[derive(Debug, Default, PartialEq, Eq)]
struct Superblock {
    provided_data_sectors: String,
    sector_size: String,
    flags: Vec<String>,
}

/// An integrity mapping opened as `/dev/mapper/integrityRoot`.
#[derive(Debug)]
pub struct IntegrityDevice {
    backing: MappedDevice,
    map_name: String,
    algorithm: &'static str,
    keyfile: Option<PathBuf>,
    key_description: Option<String>,
    legacy_hmac: bool,
    mapped: Option<String>,
    metadata: Option<NamedTempFile>,
}

impl IntegrityDevice {
    pub fn new(backing: &dyn DeviceHandle, config: &IntegrityConfig) -> Self {
        let algorithm = if config.keyfile.is_some() {
            defaults::INTEGRITY_KEY_ALGORITHM
        } else {
            defaults::INTEGRITY_ALGORITHM
        };
        Self {
            backing: MappedDevice::from_handle(backing),
            map_name: defaults::INTEGRITY_MAP_NAME.to_string(),
            algorithm,
            keyfile: config.keyfile.clone(),
            key_description: config.key_description.clone(),
            legacy_hmac: config.legacy_hmac,
            mapped: None,
            metadata: None,
        }
    }

    fn common_options(&self) -> Result<Vec<String>> {
        let mut options = vec!["--integrity".to_string(), self.algorithm.to_string()];
        if let Some(keyfile) = &self.keyfile {
            let key_bytes = fs::metadata(keyfile).at_path(keyfile)?.len();
            options.push("--integrity-key-file".to_string());
            options.push(keyfile.display().to_string());
            options.push("--integrity-key-size".to_string());
            options.push(key_bytes.to_string());
        }
        if self.legacy_hmac {
            options.push("--integrity-legacy-hmac".to_string());
        }
        Ok(options)
    }

    /// Format the backing device and open the mapping.
    pub fn create_dm_integrity(&mut self) -> Result<()> {
        let device = self.backing.device.clone();
        info!("Creating dm_integrity on {}", device);
        let options = self.common_options()?;

        Cmd::new("integritysetup")
            .args(["-v", "--batch-mode"])
            .args(options.iter().cloned())
            .args(["--sector-size".to_string(), defaults::INTEGRITY_SECTOR_SIZE.to_string()])
            .arg("format")
            .arg(&device)
            .error_msg("Failed to format integrity device")
            .run()?;
        Cmd::new("integritysetup")
            .args(["-v", "--batch-mode"])
            .args(options)
            .arg("open")
            .arg(&device)
            .arg(&self.map_name)
            .error_msg("Failed to open integrity device")
            .run()?;
        self.mapped = Some(format!("/dev/mapper/{}", self.map_name));
        Ok(())
    }

    fn superblock(&self) -> Result<Superblock> {
        let out = Cmd::new("integritysetup")
            .arg("dump")
            .arg(&self.backing.device)
            .error_msg("Failed to read integrity superblock")
            .run()?;
        let mut superblock = Superblock::default();
        for line in out.stdout.lines() {
            if line.is_empty() || line.starts_with("Info for") {
                continue;
            }
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("provided_data_sectors") => {
                    superblock.provided_data_sectors = fields.next().unwrap_or_default().to_string();
                }
                Some("sector_size") => {
                    superblock.sector_size = fields.next().unwrap_or_default().to_string();
                }
                Some("flags") => superblock.flags = fields.map(str::to_string).collect(),
                _ => {}
            }
        }
        if superblock.provided_data_sectors.is_empty() || superblock.sector_size.is_empty() {
            return Err(Error::Integrity {
                message: format!("incomplete superblock dump of {}", self.backing.device),
            });
        }
        Ok(superblock)
    }

    /// Build the verification metadata block:
    ///
    /// ```text
    /// <version> <fstype> <ro|rw> integrity 0xFF <sectors> <sector_size> <n> <params> 0xFF 0x00
    /// ```
    pub fn create_integrity_metadata(&mut self) -> Result<()> {
        let mapped = self.mapped.as_deref().ok_or_else(|| Error::Integrity {
            message: "integrity device is not open".to_string(),
        })?;
        let filesystem = block_id(mapped, "TYPE")?;
        let superblock = self.superblock()?;
        let mode = if filesystem == "squashfs" { "ro" } else { "rw" };
        let header = format!(
            "{} {} {} integrity",
            defaults::DM_METADATA_FORMAT_VERSION,
            filesystem,
            mode
        );
        let hash = match &self.key_description {
            Some(description) => format!("internal_hash:{}:{}", self.algorithm, description),
            None => format!("internal_hash:{}", self.algorithm),
        };
        let parameters: Vec<String> = std::iter::once(hash).chain(superblock.flags).collect();
        let meta = format!(
            "{} {} {} {}",
            superblock.provided_data_sectors,
            superblock.sector_size,
            parameters.len(),
            parameters.join(" ")
        );

        let mut file = NamedTempFile::new().at_path(std::env::temp_dir())?;
        let mut block = header.into_bytes();
        block.push(0xFF);
        block.extend_from_slice(meta.as_bytes());
        block.extend_from_slice(&[0xFF, 0x00]);
        file.write_all(&block).at_path(file.path())?;
        self.metadata = Some(file);
        Ok(())
    }

    /// Append a signature to the metadata block.
    pub fn sign_integrity_metadata(&self, signing_key: &Path) -> Result<()> {
        match &self.metadata {
            Some(file) => sign_file(file.path(), signing_key),
            None => Ok(()),
        }
    }

    /// Write the metadata block at `size - DM_METADATA_OFFSET` of the
    /// backing device.
    pub fn write_integrity_metadata(&self) -> Result<()> {
        let Some(file) = &self.metadata else {
            return Ok(());
        };
        let block = fs::read(file.path()).at_path(file.path())?;
        if block.len() as u64 > defaults::DM_METADATA_OFFSET {
            return Err(Error::Integrity {
                message: format!(
                    "metadata size of {}b exceeds {}b limit",
                    block.len(),
                    defaults::DM_METADATA_OFFSET
                ),
            });
        }
        let target = Path::new(&self.backing.device);
        let offset = defaults::DM_METADATA_OFFSET as i64;
        OpenOptions::new()
            .write(true)
            .open(target)
            .and_then(|mut dev| {
                dev.seek(SeekFrom::End(-offset))?;
                dev.write_all(&block)
            })
            .at_path(target)
    }

    /// integritytab line binding the mapping to the backing partition.
    pub fn create_integritytab(&self, path: &Path) -> Result<()> {
        let partuuid = block_id(&self.backing.device, "PARTUUID")?;
        let key = self
            .keyfile
            .as_ref()
            .map_or_else(|| "-".to_string(), |k| k.display().to_string());
        let line = format!(
            "{} PARTUUID={} {} integrity-algorithm={}\n",
            self.map_name, partuuid, key, self.algorithm
        );
        fs::write(path, line).at_path(path)
    }

    pub fn release(&mut self) -> Result<()> {
        if self.mapped.take().is_none() {
            return Ok(());
        }
        Cmd::new("integritysetup")
            .arg("close")
            .arg(&self.map_name)
            .error_msg(format!("Failed to close {}", self.map_name))
            .run()?;
        Ok(())
    }
}

impl DeviceHandle for IntegrityDevice {
    fn device(&self) -> &str {
        self.mapped.as_deref().unwrap_or_default()
    }

    fn is_loop(&self) -> bool {
        self.backing.is_loop
    }
}

impl Drop for IntegrityDevice {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("shutdown of integrity map failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    const DUMP: &str = "Info for integrity device /dev/mapper/loop0p3.\n\
        superblock_version 5\n\
        log2_interleave_sectors 15\n\
        integrity_tag_size 32\n\
        journal_sections 91\n\
        provided_data_sectors 409360\n\
        sector_size 512\n\
        log2_blocks_per_bitmap 12\n\
        flags fix_padding fix_hmac\n";

    #[test]
    fn test_format_and_open() {
        let (runner, _guard) = RecordingRunner::install();
        let mut integrity = IntegrityDevice::new(
            &MappedDevice::new("/dev/mapper/loop0p3", true),
            &IntegrityConfig::default(),
        );
        integrity.create_dm_integrity().unwrap();
        assert_eq!(integrity.device(), "/dev/mapper/integrityRoot");

        let cmds = runner.commands_for("integritysetup");
        assert_eq!(
            cmds[0],
            "integritysetup -v --batch-mode --integrity sha256 --sector-size 512 format /dev/mapper/loop0p3"
        );
        assert_eq!(
            cmds[1],
            "integritysetup -v --batch-mode --integrity sha256 open /dev/mapper/loop0p3 integrityRoot"
        );
        integrity.release().unwrap();
        assert_eq!(runner.commands().last().unwrap(), "integritysetup close integrityRoot");
    }

    #[test]
    fn test_keyed_hmac_options() {
        let tmp = TempDir::new().unwrap();
        let keyfile = tmp.path().join("integrity.key");
        fs::write(&keyfile, [7u8; 64]).unwrap();
        let (runner, _guard) = RecordingRunner::install();
        let config = IntegrityConfig {
            keyfile: Some(keyfile.clone()),
            legacy_hmac: true,
            ..Default::default()
        };
        let mut integrity = IntegrityDevice::new(&MappedDevice::new("/dev/sda3", false), &config);
        integrity.create_dm_integrity().unwrap();
        assert!(runner.commands()[0].contains(&format!(
            "--integrity hmac-sha256 --integrity-key-file {} --integrity-key-size 64 --integrity-legacy-hmac",
            keyfile.display()
        )));
        integrity.release().unwrap();
    }

    #[test]
    fn test_integritytab() {
        let tmp = TempDir::new().unwrap();
        let (runner, _guard) = RecordingRunner::install();
        runner.respond("blkid", "0815-03\n");
        let integrity = IntegrityDevice::new(
            &MappedDevice::new("/dev/mapper/loop0p3", true),
            &IntegrityConfig::default(),
        );
        let tab = tmp.path().join("integritytab");
        integrity.create_integritytab(&tab).unwrap();
        assert_eq!(
            fs::read_to_string(&tab).unwrap(),
            "integrityRoot PARTUUID=0815-03 - integrity-algorithm=sha256\n"
        );
    }

    #[test]
    fn test_metadata_written_before_device_end() {
        let tmp = TempDir::new().unwrap();
        let backing = tmp.path().join("root.part");
        fs::write(&backing, vec![0u8; 16384]).unwrap();
        let (runner, _guard) = RecordingRunner::install();
        runner.respond("integritysetup", DUMP);
        runner.respond("blkid", "ext4\n");

        let mut integrity = IntegrityDevice::new(
            &MappedDevice::new(backing.to_string_lossy(), false),
            &IntegrityConfig::default(),
        );
        integrity.create_dm_integrity().unwrap();
        integrity.create_integrity_metadata().unwrap();
        integrity.sign_integrity_metadata(Path::new("/keys/sign.pem")).unwrap();
        integrity.write_integrity_metadata().unwrap();

        let data = fs::read(&backing).unwrap();
        let expected: Vec<u8> = [
            &b"1 ext4 rw integrity"[..],
            &[0xFF],
            &b"409360 512 3 internal_hash:sha256 fix_padding fix_hmac"[..],
            &[0xFF, 0x00],
        ]
        .concat();
        let start = 16384 - 4096;
        assert_eq!(&data[start..start + expected.len()], expected.as_slice());
        assert!(runner.commands_for("openssl")[0].contains("-sign /keys/sign.pem"));
        integrity.release().unwrap();
    }

    #[test]
    fn test_metadata_needs_open_device() {
        let (_runner, _guard) = RecordingRunner::install();
        let mut integrity = IntegrityDevice::new(
            &MappedDevice::new("/dev/sda3", false),
            &IntegrityConfig::default(),
        );
        assert!(matches!(
            integrity.create_integrity_metadata(),
            Err(Error::Integrity { .. })
        ));
    }
}
