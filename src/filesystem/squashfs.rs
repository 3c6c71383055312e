//! Compressed read-only images.
//!
//! Wraps `mksquashfs` (and `mkclicfs`) for filesystems whose content is
//! fixed at creation time.

use crate::error::Result;
use crate::process::Cmd;
use std::path::Path;
use tracing::info;

/// Options for building a squashfs image.
#[derive(Debug, Clone)]
pub struct SquashfsOptions<'a> {
    /// Compression algorithm (gzip, zstd, xz, lzo, lz4).
    pub compression: &'a str,

    /// Block size passed to `-b`.
    pub block_size: &'a str,

    /// Keep extended attributes.
    pub xattrs: bool,
}

impl Default for SquashfsOptions<'_> {
    fn default() -> Self {
        Self {
            compression: "xz",
            block_size: "1M",
            xattrs: true,
        }
    }
}

/// Build a squashfs image from a directory.
///
/// `exclude` holds wildcard patterns relative to `source_dir`.
///
/// # Example
///
/// ```rust,ignore
/// use disk_image_builder::filesystem::squashfs::{build_squashfs, SquashfsOptions};
/// use std::path::Path;
///
/// let options = SquashfsOptions {
///     compression: "zstd",
///     ..Default::default()
/// };
///
/// build_squashfs(
///     Path::new("root/"),
///     Path::new("build/root.squashfs"),
///     &options,
///     &["var/cache/*".to_string()],
/// )?;
/// ```
pub fn build_squashfs(
    source_dir: &Path,
    output: &Path,
    options: &SquashfsOptions,
    exclude: &[String],
) -> Result<()> {
    info!("--> creating squashfs {}", output.display());
    let mut cmd = Cmd::new("mksquashfs")
        .arg_path(source_dir)
        .arg_path(output)
        .arg("-noappend")
        .arg("-b")
        .arg(options.block_size)
        .arg("-comp")
        .arg(options.compression);
    if !options.xattrs {
        cmd = cmd.arg("-no-xattrs");
    }
    if !exclude.is_empty() {
        cmd = cmd.arg("-wildcards").arg("-e").args(exclude.iter().cloned());
    }
    cmd.error_msg("Failed to create squashfs image").run()?;
    Ok(())
}

/// Build a clicfs image from a directory.
pub fn build_clicfs(source_dir: &Path, output: &Path) -> Result<()> {
    info!("--> creating clicfs {}", output.display());
    Cmd::new("mkclicfs")
        .arg_path(source_dir)
        .arg_path(output)
        .error_msg("Failed to create clicfs image")
        .run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;

    #[test]
    fn test_squashfs_command() {
        let (runner, _guard) = RecordingRunner::install();
        let options = SquashfsOptions {
            compression: "zstd",
            ..Default::default()
        };
        build_squashfs(
            Path::new("/build/root"),
            Path::new("/build/root.squashfs"),
            &options,
            &["boot/*".to_string(), "tmp/*".to_string()],
        )
        .unwrap();
        assert_eq!(
            runner.commands()[0],
            "mksquashfs /build/root /build/root.squashfs -noappend -b 1M -comp zstd -wildcards -e boot/* tmp/*"
        );
    }

    #[test]
    fn test_no_xattrs_flag() {
        let (runner, _guard) = RecordingRunner::install();
        let options = SquashfsOptions {
            xattrs: false,
            ..Default::default()
        };
        build_squashfs(Path::new("/r"), Path::new("/o"), &options, &[]).unwrap();
        assert!(runner.commands()[0].ends_with("-comp xz -no-xattrs"));
    }
}
