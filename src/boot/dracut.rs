//! Boot image built with dracut inside the system root.

use super::{BootImage, BootNames};
use crate::error::{Error, IoContext, Result};
use crate::process::Cmd;
use crate::system::SystemIdentifier;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Kernel file name prefixes, tried in order.
const KERNEL_PREFIXES: &[&str] = &["vmlinuz", "Image", "zImage", "image", "vmlinux"];

#[derive(Debug)]
pub struct DracutBootImage {
    root_dir: PathBuf,
    included_files: Vec<String>,
    initrd_filename: Option<PathBuf>,
    prepared: bool,
}

impl DracutBootImage {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            included_files: Vec::new(),
            initrd_filename: None,
            prepared: false,
        }
    }

    /// Installed kernel versions, newest last.
    fn kernel_versions(&self) -> Result<Vec<String>> {
        let mut versions = Vec::new();
        for modules in ["lib/modules", "usr/lib/modules"] {
            let dir = self.root_dir.join(modules);
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir).at_path(&dir)? {
                let entry = entry.at_path(&dir)?;
                if entry.path().is_dir() {
                    versions.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
        }
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    fn kernel_file(&self, version: &str) -> Option<String> {
        let boot = self.root_dir.join("boot");
        KERNEL_PREFIXES
            .iter()
            .map(|prefix| format!("{}-{}", prefix, version))
            .find(|name| boot.join(name).exists())
    }
}

impl BootImage for DracutBootImage {
    fn prepare(&mut self) -> Result<()> {
        if !self.root_dir.is_dir() {
            return Err(Error::not_found("boot root directory", &self.root_dir));
        }
        let has_dracut = ["usr/bin/dracut", "usr/sbin/dracut"]
            .iter()
            .any(|tool| self.root_dir.join(tool).exists());
        if !has_dracut {
            warn!("dracut not found in {}", self.root_dir.display());
        }
        self.prepared = true;
        Ok(())
    }

    fn boot_root_directory(&self) -> &Path {
        &self.root_dir
    }

    fn has_initrd_support(&self) -> bool {
        true
    }

    fn get_boot_names(&self) -> Result<BootNames> {
        for version in self.kernel_versions()?.iter().rev() {
            if let Some(kernel_name) = self.kernel_file(version) {
                return Ok(BootNames {
                    kernel_name,
                    initrd_name: format!("initrd-{}", version),
                    kernel_version: version.clone(),
                });
            }
        }
        Err(Error::not_found("kernel", self.root_dir.join("boot")))
    }

    fn create_initrd(&mut self, mbrid: Option<&SystemIdentifier>) -> Result<PathBuf> {
        if !self.prepared {
            self.prepare()?;
        }
        let names = self.get_boot_names()?;
        if let Some(mbrid) = mbrid {
            mbrid.write(&self.root_dir.join("boot/mbrid"))?;
            self.include_file("/boot/mbrid");
        }

        info!("Creating initrd {} with dracut", names.initrd_name);
        let mut cmd = Cmd::new("chroot")
            .arg_path(&self.root_dir)
            .args(["dracut", "--force", "--no-hostonly"]);
        if !self.included_files.is_empty() {
            cmd = cmd.arg("--install").arg(self.included_files.join(" "));
        }
        cmd.arg("--kver")
            .arg(&names.kernel_version)
            .arg(format!("/boot/{}", names.initrd_name))
            .error_msg("Failed to create initrd")
            .run()?;

        let initrd = self.root_dir.join("boot").join(&names.initrd_name);
        self.initrd_filename = Some(initrd.clone());
        Ok(initrd)
    }

    fn include_file(&mut self, path: &str) {
        if !self.included_files.iter().any(|f| f == path) {
            self.included_files.push(path.to_string());
        }
    }

    fn initrd_filename(&self) -> Option<&Path> {
        self.initrd_filename.as_deref()
    }
}
