//! Build result registry.
//!
//! Every builder stage registers the artifacts it produced under a fixed
//! key. The registry is persisted as versioned JSON next to the images so
//! later stages (install media, format conversion) can pick it up.

use crate::error::{Error, IoContext, Result};
use crate::utils::checksum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const RESULT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub key: String,
    pub filename: PathBuf,
    pub use_for_bundle: bool,
    pub compress: bool,
    pub shasum: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    version: u32,
    image_name: String,
    entries: Vec<ResultEntry>,
}

impl BuildResult {
    pub fn new(image_name: &str) -> Self {
        Self {
            version: RESULT_VERSION,
            image_name: image_name.to_string(),
            entries: Vec::new(),
        }
    }

    /// Register an artifact. Re-adding a key replaces its entry in place.
    pub fn add(
        &mut self,
        key: &str,
        filename: impl Into<PathBuf>,
        use_for_bundle: bool,
        compress: bool,
        shasum: bool,
    ) {
        let entry = ResultEntry {
            key: key.to_string(),
            filename: filename.into(),
            use_for_bundle,
            compress,
            shasum,
        };
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ResultEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn entries(&self) -> &[ResultEntry] {
        &self.entries
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    /// Log every registered artifact.
    pub fn print_results(&self) {
        info!("Result files:");
        for entry in &self.entries {
            info!("--> {}: {}", entry.key, entry.filename.display());
        }
    }

    /// Write `<file>.sha256` for every entry that asks for it.
    pub fn write_checksums(&self) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for entry in self.entries.iter().filter(|e| e.shasum) {
            written.push(checksum::write_sha256(&entry.filename)?);
        }
        Ok(written)
    }

    pub fn dump(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| Error::Result {
            message: e.to_string(),
        })?;
        fs::write(path, json).at_path(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).at_path(path)?;
        let result: BuildResult = serde_json::from_str(&text).map_err(|e| Error::Result {
            message: format!("{}: {}", path.display(), e),
        })?;
        if result.version != RESULT_VERSION {
            return Err(Error::Result {
                message: format!(
                    "{}: unsupported result version {}",
                    path.display(),
                    result.version
                ),
            });
        }
        Ok(result)
    }
}
