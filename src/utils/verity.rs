//! dm-verity hash trees appended to an image file or device.

use crate::error::{Error, IoContext, Result};
use crate::process::Cmd;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug)]
pub struct VeritySetup {
    image: PathBuf,
    data_blocks: Option<u64>,
    hash_offset: u64,
    info: BTreeMap<String, String>,
}

impl VeritySetup {
    /// The hash tree starts right behind the current end of `image`.
    pub fn new(image: &Path, data_blocks: Option<u64>) -> Result<Self> {
        let hash_offset = fs::metadata(image).at_path(image)?.len();
        Ok(Self {
            image: image.to_path_buf(),
            data_blocks,
            hash_offset,
            info: BTreeMap::new(),
        })
    }

    /// Append the hash tree and return the veritysetup summary with
    /// blanks removed from keys and values.
    pub fn format(&mut self) -> Result<&BTreeMap<String, String>> {
        info!("Creating verity hash tree on {}", self.image.display());
        let mut cmd = Cmd::new("veritysetup")
            .arg("format")
            .arg_path(&self.image)
            .arg_path(&self.image)
            .arg("--no-superblock")
            .arg(format!("--hash-offset={}", self.hash_offset));
        if let Some(blocks) = self.data_blocks {
            cmd = cmd.arg(format!("--data-blocks={}", blocks));
        }
        let out = cmd.error_msg("Failed to create verity hash tree").run()?;
        for line in out.stdout.lines() {
            let compact: String = line.chars().filter(|c| *c != ' ').collect();
            if let Some((key, value)) = compact.split_once(':') {
                self.info.insert(key.to_string(), value.to_string());
            }
        }
        Ok(&self.info)
    }

    pub fn root_hash(&self) -> Option<&str> {
        self.info.get("Roothash").map(String::as_str)
    }

    /// Write everything needed to open the verity device, bound to the
    /// partition it was dumped to.
    pub fn store_credentials(&self, path: &Path, partuuid: &str) -> Result<()> {
        if self.info.is_empty() {
            return Err(Error::Verity {
                message: "hash tree has not been created".to_string(),
            });
        }
        let mut text = String::new();
        for (key, value) in &self.info {
            let _ = writeln!(text, "{}: {}", key, value);
        }
        let _ = writeln!(text, "PARTUUID: {}", partuuid);
        let _ = writeln!(text, "Root hashoffset: {}", self.hash_offset);
        text.push_str("Superblock: --no-superblock\n");
        fs::write(path, text).at_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    const FORMAT_OUTPUT: &str = "VERITY header information for root.img\n\
        UUID:            \n\
        Hash type:       1\n\
        Data blocks:     2048\n\
        Data block size: 4096\n\
        Hash algorithm:  sha256\n\
        Root hash:       5a1f\n";

    #[test]
    fn test_format_appends_behind_data() {
        let tmp = TempDir::new().unwrap();
        let image = tmp.path().join("root.img");
        fs::write(&image, vec![0u8; 8192]).unwrap();
        let (runner, _guard) = RecordingRunner::install();
        runner.respond("veritysetup", FORMAT_OUTPUT);

        let mut verity = VeritySetup::new(&image, Some(2)).unwrap();
        let info = verity.format().unwrap();
        assert_eq!(info.get("Datablocks").map(String::as_str), Some("2048"));
        assert_eq!(verity.root_hash(), Some("5a1f"));
        assert_eq!(
            runner.commands()[0],
            format!(
                "veritysetup format {0} {0} --no-superblock --hash-offset=8192 --data-blocks=2",
                image.display()
            )
        );

        let creds = tmp.path().join("root.verity");
        verity.store_credentials(&creds, "0815-01").unwrap();
        let text = fs::read_to_string(&creds).unwrap();
        assert!(text.contains("Roothash: 5a1f\n"));
        assert!(text.ends_with("PARTUUID: 0815-01\nRoot hashoffset: 8192\nSuperblock: --no-superblock\n"));
    }

    #[test]
    fn test_credentials_need_hash_tree() {
        let tmp = TempDir::new().unwrap();
        let image = tmp.path().join("root.img");
        fs::write(&image, b"data").unwrap();
        let verity = VeritySetup::new(&image, None).unwrap();
        assert!(matches!(
            verity.store_credentials(&tmp.path().join("creds"), "x"),
            Err(Error::Verity { .. })
        ));
    }
}
