//! Raw disk post-processing: format conversion, trailing free space and
//! the size ceiling.

use crate::config::{DiskFormat, PartitionTableType};
use crate::error::{Error, IoContext, Result};
use crate::process::Cmd;
use crate::storage::{Disk, LoopDevice};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::info;

/// Entry count written back when a GPT is relocated.
const GPT_TABLE_ENTRIES: u32 = 128;

/// `<raw without .raw>.<extension>` next to the raw disk.
pub fn disk_format_filename(raw: &Path, format: DiskFormat) -> PathBuf {
    raw.with_extension(format.extension())
}

/// Convert the raw disk with qemu-img.
pub fn convert_disk(raw: &Path, format: DiskFormat, output: &Path) -> Result<()> {
    info!("Creating {} image {}", format.extension(), output.display());
    let mut cmd = Cmd::new("qemu-img")
        .args(["convert", "-f", "raw", "-O", format.qemu_format()]);
    if format == DiskFormat::VhdFixed {
        cmd = cmd.args(["-o", "subformat=fixed"]);
    }
    cmd.arg_path(raw)
        .arg_path(output)
        .error_msg(format!("Failed to convert disk to {}", format.qemu_format()))
        .run()?;
    Ok(())
}

/// Grow the raw file by `bytes` of unpartitioned space.
///
/// A GPT keeps its backup header at the end of the disk, so the table is
/// rewritten through a loop device afterwards.
pub fn append_unpartitioned_space(raw: &Path, bytes: u64, table: PartitionTableType) -> Result<()> {
    info!("Expanding disk with {} bytes of unpartitioned space", bytes);
    let file = OpenOptions::new().write(true).open(raw).at_path(raw)?;
    let size = file.metadata().at_path(raw)?.len();
    file.set_len(size + bytes).at_path(raw)?;
    drop(file);

    if table != PartitionTableType::Gpt {
        return Ok(());
    }
    let mut loop_device = LoopDevice::new(raw, None, None);
    loop_device.create(false)?;
    let resized = Disk::new(table, &loop_device).resize_table(GPT_TABLE_ENTRIES);
    let released = loop_device.release();
    resized?;
    released
}

/// Fail when `path` is larger than `limit` bytes.
pub fn verify_image_size(limit: u64, path: &Path) -> Result<()> {
    let size = fs::metadata(path).at_path(path)?.len();
    if size > limit {
        return Err(Error::ImageSizeExceeded {
            path: path.to_path_buf(),
            size,
            limit,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    fn raw_file(dir: &Path, bytes: u64) -> PathBuf {
        let raw = dir.join("appliance.x86_64-1.0.0.raw");
        fs::File::create(&raw).unwrap().set_len(bytes).unwrap();
        raw
    }

    #[test]
    fn test_format_filenames() {
        let raw = Path::new("/out/appliance.x86_64-1.0.0.raw");
        assert_eq!(
            disk_format_filename(raw, DiskFormat::Qcow2),
            Path::new("/out/appliance.x86_64-1.0.0.qcow2")
        );
        assert_eq!(
            disk_format_filename(raw, DiskFormat::VhdFixed),
            Path::new("/out/appliance.x86_64-1.0.0.vhdfixed")
        );
    }

    #[test]
    fn test_vhd_fixed_subformat() {
        let (runner, _guard) = RecordingRunner::install();
        convert_disk(Path::new("/out/a.raw"), DiskFormat::VhdFixed, Path::new("/out/a.vhdfixed")).unwrap();
        convert_disk(Path::new("/out/a.raw"), DiskFormat::Qcow2, Path::new("/out/a.qcow2")).unwrap();
        assert_eq!(
            runner.commands(),
            vec![
                "qemu-img convert -f raw -O vpc -o subformat=fixed /out/a.raw /out/a.vhdfixed",
                "qemu-img convert -f raw -O qcow2 /out/a.raw /out/a.qcow2",
            ]
        );
    }

    #[test]
    fn test_append_space_on_gpt_resizes_table() {
        let tmp = TempDir::new().unwrap();
        let raw = raw_file(tmp.path(), 1_048_576);
        let (runner, _guard) = RecordingRunner::install();
        runner.respond_when("losetup", "--show", "/dev/loop3\n");

        append_unpartitioned_space(&raw, 4096, PartitionTableType::Gpt).unwrap();

        assert_eq!(fs::metadata(&raw).unwrap().len(), 1_048_576 + 4096);
        assert_eq!(
            runner.commands_for("sgdisk"),
            vec!["sgdisk --resize-table 128 /dev/loop3"]
        );
        assert!(runner
            .commands_for("losetup")
            .contains(&"losetup -d /dev/loop3".to_string()));
    }

    #[test]
    fn test_append_space_on_msdos_only_grows_file() {
        let tmp = TempDir::new().unwrap();
        let raw = raw_file(tmp.path(), 512);
        let (runner, _guard) = RecordingRunner::install();
        append_unpartitioned_space(&raw, 512, PartitionTableType::Msdos).unwrap();
        assert_eq!(fs::metadata(&raw).unwrap().len(), 1024);
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn test_size_ceiling() {
        let tmp = TempDir::new().unwrap();
        let raw = raw_file(tmp.path(), 2048);
        assert!(verify_image_size(2048, &raw).is_ok());
        match verify_image_size(1024, &raw) {
            Err(Error::ImageSizeExceeded { size, limit, .. }) => {
                assert_eq!((size, limit), (2048, 1024));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
