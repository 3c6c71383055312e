//! zstd compression and tar.zst archives.

use crate::error::{IoContext, Result};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

const ZSTD_LEVEL: i32 = 3;

/// Compress `path` to `<path>.zst`, keeping the original.
pub fn compress_file(path: &Path) -> Result<PathBuf> {
    let out_path = PathBuf::from(format!("{}.zst", path.display()));
    let mut input = BufReader::new(File::open(path).at_path(path)?);
    let out = File::create(&out_path).at_path(&out_path)?;
    let mut encoder = zstd::stream::Encoder::new(out, ZSTD_LEVEL).at_path(&out_path)?;
    io::copy(&mut input, &mut encoder).at_path(&out_path)?;
    encoder.finish().at_path(&out_path)?;
    Ok(out_path)
}

/// Archive `src_dir` into a deterministic tar.zst.
///
/// `exclude` holds paths relative to `src_dir`; matching entries and
/// everything below them are skipped.
pub fn create_tar_zst(src_dir: &Path, out_path: &Path, exclude: &[String]) -> Result<()> {
    let excluded: Vec<PathBuf> = exclude
        .iter()
        .map(|p| src_dir.join(p.trim_start_matches('/')))
        .collect();

    let mut entries: Vec<PathBuf> = vec![];
    for ent in WalkDir::new(src_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !excluded.iter().any(|x| e.path() == x))
    {
        let ent = ent.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| src_dir.to_path_buf());
            crate::error::Error::io(path, io::Error::other(e.to_string()))
        })?;
        if ent.path() != src_dir {
            entries.push(ent.path().to_path_buf());
        }
    }
    entries.sort();

    let out = File::create(out_path).at_path(out_path)?;
    let encoder = zstd::stream::Encoder::new(out, ZSTD_LEVEL).at_path(out_path)?;
    let mut builder = TarBuilder::new(encoder);

    for p in entries {
        let rel = p.strip_prefix(src_dir).unwrap_or(&p).to_string_lossy().into_owned();
        append_entry(&mut builder, &p, &rel)?;
    }

    let encoder = builder.into_inner().at_path(out_path)?;
    encoder.finish().at_path(out_path)?;
    Ok(())
}

/// Archive individual files under the given archive names.
pub fn create_tar_zst_from_files(out_path: &Path, files: &[(PathBuf, String)]) -> Result<()> {
    let out = File::create(out_path).at_path(out_path)?;
    let encoder = zstd::stream::Encoder::new(out, ZSTD_LEVEL).at_path(out_path)?;
    let mut builder = TarBuilder::new(encoder);
    for (path, name) in files {
        append_entry(&mut builder, path, name)?;
    }
    let encoder = builder.into_inner().at_path(out_path)?;
    encoder.finish().at_path(out_path)?;
    Ok(())
}

fn append_entry<W: io::Write>(builder: &mut TarBuilder<W>, path: &Path, name: &str) -> Result<()> {
    let md = fs::symlink_metadata(path).at_path(path)?;
    let mut header = tar::Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(md.permissions().mode());

    if md.is_dir() {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_cksum();
        builder.append_data(&mut header, name, io::empty()).at_path(path)?;
    } else if md.file_type().is_symlink() {
        let target = fs::read_link(path).at_path(path)?;
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_link_name(&target).at_path(path)?;
        header.set_cksum();
        builder.append_data(&mut header, name, io::empty()).at_path(path)?;
    } else if md.is_file() {
        let mut f = File::open(path).at_path(path)?;
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(md.len());
        header.set_cksum();
        builder.append_data(&mut header, name, &mut f).at_path(path)?;
    }
    Ok(())
}
