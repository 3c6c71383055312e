//! Boot Loader Specification entry naming.

use crate::error::{IoContext, Result};
use std::fs;
use std::path::Path;

/// Entries directory below a system root.
pub const ENTRIES_DIR: &str = "boot/loader/entries";

/// `ID` from `etc/os-release`, `linux` if absent.
pub fn os_release_id(root_dir: &Path) -> Result<String> {
    let path = root_dir.join("etc/os-release");
    if !path.exists() {
        return Ok("linux".to_string());
    }
    let content = fs::read_to_string(&path).at_path(&path)?;
    Ok(content
        .lines()
        .find_map(|line| line.strip_prefix("ID="))
        .map(|id| id.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| "linux".to_string()))
}

/// File name of the entry for `kernel_version`.
///
/// An entry the distribution already installed into the root tree keeps
/// its name; otherwise it is `<os-id>-<kernel-version>.conf`.
pub fn entry_file_name(root_dir: &Path, kernel_version: &str) -> Result<String> {
    let entries = root_dir.join(ENTRIES_DIR);
    if entries.is_dir() {
        let mut existing: Vec<String> = fs::read_dir(&entries)
            .at_path(&entries)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".conf"))
            .collect();
        existing.sort();
        if let Some(name) = existing.into_iter().next() {
            return Ok(name);
        }
    }
    Ok(format!("{}-{}.conf", os_release_id(root_dir)?, kernel_version))
}
