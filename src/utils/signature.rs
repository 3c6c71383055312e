//! Detached openssl signatures appended to metadata blocks.

use crate::error::{IoContext, Result};
use crate::process::Cmd;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Sign `path` with an RSA-PSS/sha256 signature and append it to the file.
pub fn sign_file(path: &Path, signing_key: &Path) -> Result<()> {
    let signature = NamedTempFile::new().at_path(std::env::temp_dir())?;
    Cmd::new("openssl")
        .args(["dgst", "-sha256"])
        .args(["-sigopt", "rsa_padding_mode:pss"])
        .args(["-sigopt", "rsa_pss_saltlen:-1"])
        .args(["-sigopt", "rsa_mgf1_md:sha256"])
        .arg("-sign")
        .arg_path(signing_key)
        .arg("-out")
        .arg_path(signature.path())
        .arg_path(path)
        .error_msg("Failed to sign metadata")
        .run()?;
    let bytes = std::fs::read(signature.path()).at_path(signature.path())?;
    OpenOptions::new()
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(&bytes))
        .at_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    #[test]
    fn test_sign_runs_openssl_on_file() {
        let tmp = TempDir::new().unwrap();
        let meta = tmp.path().join("meta");
        std::fs::write(&meta, b"1 ext4 rw integrity").unwrap();
        let (runner, _guard) = RecordingRunner::install();
        sign_file(&meta, Path::new("/keys/sign.pem")).unwrap();

        let cmd = &runner.commands_for("openssl")[0];
        assert!(cmd.starts_with("openssl dgst -sha256 -sigopt rsa_padding_mode:pss"));
        assert!(cmd.contains("-sign /keys/sign.pem -out "));
        assert!(cmd.ends_with(&meta.display().to_string()));
        assert_eq!(std::fs::read(&meta).unwrap(), b"1 ext4 rw integrity");
    }
}
