//! Tree synchronisation via rsync.

use crate::defaults;
use crate::error::{IoContext, Result};
use crate::process::Cmd;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DataSync {
    source_dir: PathBuf,
    target_dir: PathBuf,
}

impl DataSync {
    pub fn new(source_dir: impl Into<PathBuf>, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            target_dir: target_dir.into(),
        }
    }

    /// Copy the contents of the source into the target.
    ///
    /// Each exclude entry is anchored at the source root. The target
    /// directory gets the mode of the source directory afterwards, since
    /// a fresh mountpoint usually differs from the tree root.
    pub fn sync_data(&self, exclude: &[String]) -> Result<()> {
        let mut cmd = Cmd::new("rsync").args(defaults::RSYNC_OPTIONS.iter().copied());
        for item in exclude {
            cmd = cmd
                .arg("--exclude")
                .arg(format!("/{}", item.trim_start_matches('/')));
        }
        cmd.arg(format!("{}/", self.source_dir.display()))
            .arg_path(&self.target_dir)
            .error_msg(format!(
                "Failed to sync {} to {}",
                self.source_dir.display(),
                self.target_dir.display()
            ))
            .run()?;

        restore_mode(&self.source_dir, &self.target_dir)
    }
}

fn restore_mode(source: &Path, target: &Path) -> Result<()> {
    let permissions = fs::metadata(source).at_path(source)?.permissions();
    fs::set_permissions(target, permissions).at_path(target)
}
