//! LUKS encryption of the root partition.

use super::{block_id, DeviceHandle, MappedDevice};
use crate::defaults;
use crate::error::{Error, IoContext, Result};
use crate::process::Cmd;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A LUKS container opened as `/dev/mapper/luksRoot`.
#[derive(Debug)]
pub struct LuksDevice {
    backing: MappedDevice,
    map_name: String,
    mapped: Option<String>,
    keyfile: Option<PathBuf>,
}

impl LuksDevice {
    pub fn new(backing: &dyn DeviceHandle) -> Self {
        Self {
            backing: MappedDevice::from_handle(backing),
            map_name: defaults::LUKS_MAP_NAME.to_string(),
            mapped: None,
            keyfile: None,
        }
    }

    fn os_options(os: Option<&str>) -> Result<Vec<&'static str>> {
        match os {
            None => Ok(Vec::new()),
            Some("sle12") => Ok(vec![
                "--cipher",
                "aes-xts-plain64",
                "--key-size",
                "256",
                "--hash",
                "sha1",
            ]),
            Some(other) => Err(Error::Luks {
                message: format!("no custom option configuration found for OS {}", other),
            }),
        }
    }

    /// Format and open the container.
    ///
    /// The passphrase is written to a temporary file for cryptsetup. With
    /// `keyfile` an additional random key is created at that path and
    /// registered; it alone is enough when the passphrase is empty.
    pub fn create_crypto_luks(
        &mut self,
        passphrase: &str,
        os: Option<&str>,
        randomize: bool,
        keyfile: Option<&Path>,
    ) -> Result<()> {
        if passphrase.is_empty() && keyfile.is_none() {
            return Err(Error::Luks {
                message: "passphrase must not be empty".to_string(),
            });
        }
        let options = Self::os_options(os)?;
        let device = self.backing.device.clone();
        info!("Creating crypto LUKS on {}", device);

        if randomize {
            info!("--> Randomizing...");
            let out = Cmd::new("blockdev")
                .arg("--getsize64")
                .arg(&device)
                .error_msg("Failed to read device size")
                .run()?;
            let bytes: u64 = out.stdout.trim().parse().map_err(|_| Error::Luks {
                message: format!("unexpected size '{}' for {}", out.stdout.trim(), device),
            })?;
            Cmd::new("dd")
                .args(["if=/dev/urandom", "bs=1M"])
                .arg(format!("count={}", bytes / 1_048_576))
                .arg(format!("of={}", device))
                .error_msg("Failed to randomize device")
                .run()?;
        }

        if let Some(path) = keyfile {
            create_random_keyfile(path)?;
        }

        let mut secret = tempfile::NamedTempFile::new().at_path(std::env::temp_dir())?;
        let format_key: PathBuf = if passphrase.is_empty() {
            keyfile.map(Path::to_path_buf).unwrap_or_default()
        } else {
            secret
                .write_all(passphrase.as_bytes())
                .at_path(secret.path())?;
            secret.path().to_path_buf()
        };

        info!("--> Creating LUKS map");
        Cmd::new("cryptsetup")
            .arg("-q")
            .arg("--key-file")
            .arg_path(&format_key)
            .args(options)
            .arg("luksFormat")
            .arg(&device)
            .error_msg("Failed to format LUKS container")
            .run()?;

        if let Some(path) = keyfile.filter(|_| !passphrase.is_empty()) {
            Cmd::new("cryptsetup")
                .arg("--key-file")
                .arg_path(&format_key)
                .arg("luksAddKey")
                .arg(&device)
                .arg_path(path)
                .error_msg("Failed to add LUKS key file")
                .run()?;
        }

        Cmd::new("cryptsetup")
            .arg("--key-file")
            .arg_path(&format_key)
            .arg("luksOpen")
            .arg(&device)
            .arg(&self.map_name)
            .error_msg("Failed to open LUKS container")
            .run()?;

        self.keyfile = keyfile.map(Path::to_path_buf);
        self.mapped = Some(format!("/dev/mapper/{}", self.map_name));
        Ok(())
    }

    /// Write a crypttab line binding the container by UUID.
    pub fn create_crypttab(&self, path: &Path) -> Result<()> {
        let uuid = block_id(&self.backing.device, "UUID")?;
        let line = match self.keyfile.as_deref().and_then(Path::file_name) {
            Some(name) => format!("luks UUID={} /{}\n", uuid, name.to_string_lossy()),
            None => format!("luks UUID={}\n", uuid),
        };
        fs::write(path, line).at_path(path)
    }

    pub fn backing(&self) -> &MappedDevice {
        &self.backing
    }

    pub fn release(&mut self) -> Result<()> {
        if self.mapped.take().is_none() {
            return Ok(());
        }
        Cmd::new("cryptsetup")
            .arg("luksClose")
            .arg(&self.map_name)
            .error_msg(format!("Failed to close {}", self.map_name))
            .run()?;
        Ok(())
    }
}

/// Fill `path` with random key material.
pub fn create_random_keyfile(path: &Path) -> Result<()> {
    let random = Path::new("/dev/urandom");
    let mut key = vec![0u8; defaults::LUKS_KEY_LENGTH];
    fs::File::open(random)
        .and_then(|mut f| f.read_exact(&mut key))
        .at_path(random)?;
    fs::write(path, key).at_path(path)
}

impl DeviceHandle for LuksDevice {
    fn device(&self) -> &str {
        self.mapped.as_deref().unwrap_or_default()
    }

    fn is_loop(&self) -> bool {
        self.backing.is_loop
    }
}

impl Drop for LuksDevice {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("shutdown of luks map failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    fn backing() -> MappedDevice {
        MappedDevice::new("/dev/mapper/loop0p2", true)
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        let (runner, _guard) = RecordingRunner::install();
        let mut luks = LuksDevice::new(&backing());
        assert!(matches!(
            luks.create_crypto_luks("", None, false, None),
            Err(Error::Luks { .. })
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_unknown_os_rejected() {
        let (_runner, _guard) = RecordingRunner::install();
        let mut luks = LuksDevice::new(&backing());
        assert!(luks.create_crypto_luks("secret", Some("plan9"), false, None).is_err());
    }

    #[test]
    fn test_format_and_open() {
        let (runner, _guard) = RecordingRunner::install();
        let mut luks = LuksDevice::new(&backing());
        luks.create_crypto_luks("secret", Some("sle12"), false, None).unwrap();
        assert_eq!(luks.device(), "/dev/mapper/luksRoot");

        let cmds = runner.commands_for("cryptsetup");
        assert!(cmds[0].contains("--cipher aes-xts-plain64 --key-size 256 --hash sha1 luksFormat /dev/mapper/loop0p2"));
        assert!(cmds[1].ends_with("luksOpen /dev/mapper/loop0p2 luksRoot"));
        luks.release().unwrap();
        assert_eq!(runner.commands().last().unwrap(), "cryptsetup luksClose luksRoot");
    }

    #[test]
    fn test_keyfile_and_crypttab() {
        let tmp = TempDir::new().unwrap();
        let keyfile = tmp.path().join("root.keyfile");
        let (runner, _guard) = RecordingRunner::install();
        runner.respond("blkid", "1111-2222\n");
        runner.respond("blockdev", "104857600\n");
        let mut luks = LuksDevice::new(&backing());
        luks.create_crypto_luks("secret", None, true, Some(&keyfile)).unwrap();
        assert_eq!(fs::metadata(&keyfile).unwrap().len(), 256);
        assert!(runner.commands().iter().any(|c| c.contains("luksAddKey")));
        assert!(runner.commands().iter().any(|c| c.starts_with("dd if=/dev/urandom")));

        let crypttab = tmp.path().join("crypttab");
        luks.create_crypttab(&crypttab).unwrap();
        assert_eq!(
            fs::read_to_string(&crypttab).unwrap(),
            "luks UUID=1111-2222 /root.keyfile\n"
        );
        luks.release().unwrap();
    }
}
