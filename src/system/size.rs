//! Source tree size estimation.

use crate::config::FilesystemKind;
use crate::defaults;
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Virtual filesystem mount points never counted.
const NON_PHYSICAL: &[&str] = &["proc", "sys", "dev"];

/// Measures a source tree.
#[derive(Debug, Clone)]
pub struct SystemSize {
    source_dir: PathBuf,
}

impl SystemSize {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
        }
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Apparent byte size of the tree in whole megabytes.
    ///
    /// `exclude` holds paths relative to the source directory. Hardlinked
    /// files count once.
    pub fn accumulate_mbyte_file_sizes(&self, exclude: &[String]) -> Result<u64> {
        let excluded: Vec<PathBuf> = NON_PHYSICAL
            .iter()
            .map(|p| self.source_dir.join(p))
            .chain(
                exclude
                    .iter()
                    .map(|p| self.source_dir.join(p.trim_start_matches('/'))),
            )
            .collect();

        let mut seen = HashSet::new();
        let mut bytes = 0u64;
        let walker = WalkDir::new(&self.source_dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !excluded.iter().any(|x| e.path() == x));

        for entry in walker {
            let entry = entry.map_err(|e| self.walk_error(e))?;
            let meta = entry.metadata().map_err(|e| self.walk_error(e))?;
            if meta.is_file() && meta.nlink() > 1 && !seen.insert((meta.dev(), meta.ino())) {
                continue;
            }
            bytes += meta.len();
        }
        Ok(bytes / 1_048_576)
    }

    /// Number of entries in the tree, the tree root included.
    pub fn accumulate_files(&self) -> Result<u64> {
        let mut count = 0;
        for entry in WalkDir::new(&self.source_dir).follow_links(false) {
            entry.map_err(|e| self.walk_error(e))?;
            count += 1;
        }
        Ok(count)
    }

    /// Add filesystem overhead to a data size.
    ///
    /// ext filesystems get 50% plus twice the inode table size, btrfs and
    /// xfs get 50%, everything else is returned unchanged.
    pub fn customize(&self, mbytes: u64, filesystem: FilesystemKind) -> Result<u64> {
        let size = match filesystem {
            kind if kind.is_ext() => {
                let file_count = self.accumulate_files()?;
                let inode_mbytes =
                    (file_count * defaults::INODE_SIZE_BYTES) as f64 / 1_048_576.0;
                mbytes as f64 * 1.5 + 2.0 * inode_mbytes
            }
            FilesystemKind::Btrfs | FilesystemKind::Xfs => mbytes as f64 * 1.5,
            _ => mbytes as f64,
        };
        Ok(size as u64)
    }

    fn walk_error(&self, e: walkdir::Error) -> Error {
        let path = e
            .path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.source_dir.clone());
        let source = e
            .into_io_error()
            .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
        Error::io(path, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_mb(path: &Path, mbytes: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![0u8; mbytes * 1_048_576]).unwrap();
    }

    #[test]
    fn test_accumulate_skips_virtual_filesystems() {
        let tmp = TempDir::new().unwrap();
        write_mb(&tmp.path().join("usr/data"), 3);
        write_mb(&tmp.path().join("proc/kcore"), 5);
        write_mb(&tmp.path().join("dev/blob"), 5);

        let size = SystemSize::new(tmp.path());
        assert_eq!(size.accumulate_mbyte_file_sizes(&[]).unwrap(), 3);
    }

    #[test]
    fn test_accumulate_honours_exclude() {
        let tmp = TempDir::new().unwrap();
        write_mb(&tmp.path().join("usr/data"), 2);
        write_mb(&tmp.path().join("var/cache/big"), 4);

        let size = SystemSize::new(tmp.path());
        let exclude = vec!["/var/cache".to_string()];
        assert_eq!(size.accumulate_mbyte_file_sizes(&exclude).unwrap(), 2);
    }

    #[test]
    fn test_hardlinks_count_once() {
        let tmp = TempDir::new().unwrap();
        write_mb(&tmp.path().join("a"), 2);
        fs::hard_link(tmp.path().join("a"), tmp.path().join("b")).unwrap();
        let size = SystemSize::new(tmp.path());
        assert_eq!(size.accumulate_mbyte_file_sizes(&[]).unwrap(), 2);
    }

    #[test]
    fn test_copy_on_write_overhead_is_exact() {
        let tmp = TempDir::new().unwrap();
        for i in 0..50 {
            fs::write(tmp.path().join(format!("f{i}")), b"x").unwrap();
        }
        let size = SystemSize::new(tmp.path());
        assert_eq!(size.customize(100, FilesystemKind::Btrfs).unwrap(), 150);
        assert_eq!(size.customize(100, FilesystemKind::Xfs).unwrap(), 150);
        assert_eq!(size.customize(100, FilesystemKind::Fat32).unwrap(), 100);
    }

    #[test]
    fn test_ext_overhead_grows_with_file_count() {
        let tmp = TempDir::new().unwrap();
        let size = SystemSize::new(tmp.path());
        let before = size.customize(100, FilesystemKind::Ext4).unwrap();
        for i in 0..10_000 {
            fs::write(tmp.path().join(format!("f{i}")), b"").unwrap();
        }
        let after = size.customize(100, FilesystemKind::Ext4).unwrap();
        assert_eq!(before, 150);
        assert!(after > before);
    }

    #[test]
    fn test_missing_source_is_io_error() {
        let size = SystemSize::new("/definitely/not/here");
        assert!(matches!(
            size.accumulate_mbyte_file_sizes(&[]),
            Err(Error::Io { .. })
        ));
    }
}
