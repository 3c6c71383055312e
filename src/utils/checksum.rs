//! Digest files for build artifacts.

use crate::error::{Error, IoContext, Result};
use crate::process::Cmd;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// Hex sha256 of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).at_path(path)?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = r.read(&mut buf).at_path(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Write `<file>.sha256` in `sha256sum -c` format and return its path.
///
/// Only the file name is recorded so the pair can be moved together.
pub fn write_sha256(path: &Path) -> Result<PathBuf> {
    let hash = sha256_file(path)?;
    write_digest_file(path, &hash, "sha256")
}

/// Write `<file>.md5` using the host md5sum.
pub fn write_md5(path: &Path) -> Result<PathBuf> {
    let result = Cmd::new("md5sum")
        .arg_path(path)
        .error_msg("md5sum failed. Install coreutils.")
        .run()?;
    let hash = result
        .stdout
        .split_whitespace()
        .next()
        .ok_or_else(|| Error::Result {
            message: format!("could not parse md5sum output for {}", path.display()),
        })?
        .to_string();
    write_digest_file(path, &hash, "md5")
}

fn write_digest_file(path: &Path, hash: &str, suffix: &str) -> Result<PathBuf> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Result {
            message: format!("no file name in {}", path.display()),
        })?;
    let digest_path = PathBuf::from(format!("{}.{}", path.display(), suffix));
    fs::write(&digest_path, format!("{}  {}\n", hash, filename)).at_path(&digest_path)?;
    Ok(digest_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_of_known_content() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("abc");
        fs::write(&file, b"abc").unwrap();
        assert_eq!(
            sha256_file(&file).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_file_uses_basename() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("disk.raw");
        fs::write(&file, b"abc").unwrap();
        let digest = write_sha256(&file).unwrap();
        let text = fs::read_to_string(digest).unwrap();
        assert!(text.ends_with("  disk.raw\n"));
        assert!(!text.contains(tmp.path().to_str().unwrap()));
    }

    #[test]
    fn test_md5_parses_tool_output() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("disk.raw");
        fs::write(&file, b"abc").unwrap();
        let (runner, _guard) = RecordingRunner::install();
        runner.respond("md5sum", "900150983cd24fb0d6963f7d28e17f72  /x/disk.raw\n");
        let digest = write_md5(&file).unwrap();
        assert_eq!(
            fs::read_to_string(digest).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72  disk.raw\n"
        );
    }
}
