//! Directory copies into boot trees.

use crate::error::{IoContext, Result};
use std::fs;
use std::path::Path;

/// Recursively copy a directory, preserving symlinks.
///
/// `dst` is created if missing; existing files are overwritten.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).at_path(dst)?;
    for entry in fs::read_dir(src).at_path(src)? {
        let entry = entry.at_path(src)?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type().at_path(&src_path)?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path).at_path(&src_path)?;
            if dst_path.exists() || dst_path.is_symlink() {
                fs::remove_file(&dst_path).at_path(&dst_path)?;
            }
            std::os::unix::fs::symlink(&target, &dst_path).at_path(&dst_path)?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).at_path(&src_path)?;
        }
    }
    Ok(())
}

/// Copy one file, creating the destination directory.
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).at_path(parent)?;
    }
    fs::copy(src, dst).at_path(src)?;
    Ok(())
}

/// Write `content` to `path`, creating parent directories.
pub fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).at_path(parent)?;
    }
    fs::write(path, content).at_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_keeps_symlinks() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("fonts")).unwrap();
        fs::write(src.join("fonts/ascii.pf2"), "font").unwrap();
        std::os::unix::fs::symlink("fonts/ascii.pf2", src.join("default.pf2")).unwrap();

        let dst = tmp.path().join("dst");
        copy_dir_recursive(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join("fonts/ascii.pf2")).unwrap(), "font");
        assert!(dst.join("default.pf2").is_symlink());
    }
}
