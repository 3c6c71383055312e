//! Exclusive build lock on a target directory.

use crate::error::{Error, IoContext, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_FILE_NAME: &str = ".disk-build.lock";

/// Held for the duration of one disk build. The lock goes away with the file
/// handle; the lock file itself is left in place.
#[derive(Debug)]
pub struct BuildLock {
    _file: File,
    path: PathBuf,
}

impl BuildLock {
    pub fn acquire(target_dir: &Path) -> Result<Self> {
        fs::create_dir_all(target_dir).at_path(target_dir)?;
        let path = target_dir.join(LOCK_FILE_NAME);

        // Never unlink a stale lock file: a second process could then lock a
        // fresh inode at the same path while the first still holds the old one.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .at_path(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(Error::precondition(format!(
                "target directory is locked by another build: {}",
                path.display()
            )));
        }
        debug!("acquired build lock {}", path.display());
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
