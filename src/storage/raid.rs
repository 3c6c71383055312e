//! Degraded software RAID on the root partition.

use super::{DeviceHandle, MappedDevice};
use crate::config::RaidLevel;
use crate::error::{Error, IoContext, Result};
use crate::process::Cmd;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MAX_ARRAYS: u32 = 9;

/// A two disk array created with one member missing.
#[derive(Debug)]
pub struct RaidDevice {
    backing: MappedDevice,
    dev_dir: PathBuf,
    array: Option<String>,
}

impl RaidDevice {
    pub fn new(backing: &dyn DeviceHandle) -> Self {
        Self {
            backing: MappedDevice::from_handle(backing),
            dev_dir: PathBuf::from("/dev"),
            array: None,
        }
    }

    /// Look for free `mdN` nodes below `dir` instead of `/dev`.
    pub fn with_dev_dir(mut self, dir: &Path) -> Self {
        self.dev_dir = dir.to_path_buf();
        self
    }

    pub fn create_degraded_raid(&mut self, level: RaidLevel) -> Result<()> {
        let array = (0..MAX_ARRAYS)
            .map(|n| self.dev_dir.join(format!("md{}", n)))
            .find(|p| !p.exists())
            .ok_or_else(|| Error::Raid {
                message: format!("no free raid device in range md0-{}", MAX_ARRAYS - 1),
            })?
            .to_string_lossy()
            .into_owned();

        info!("--> creating raid array in {:?} mode as {}", level, array);
        Cmd::new("mdadm")
            .args(["--create", "--run"])
            .arg(&array)
            .arg("--level")
            .arg(level.mdadm_level())
            .args(["--raid-disks", "2"])
            .arg(&self.backing.device)
            .arg("missing")
            .error_msg("Failed to create raid array")
            .run()?;
        self.array = Some(array);
        Ok(())
    }

    /// Write the `mdadm -Db` scan result to `path`.
    pub fn create_raid_config(&self, path: &Path) -> Result<()> {
        let array = self.require_array()?;
        let out = Cmd::new("mdadm")
            .arg("-Db")
            .arg(array)
            .error_msg("Failed to query raid array")
            .run()?;
        fs::write(path, out.stdout).at_path(path)
    }

    pub fn backing(&self) -> &MappedDevice {
        &self.backing
    }

    pub fn release(&mut self) -> Result<()> {
        let Some(array) = self.array.take() else {
            return Ok(());
        };
        Cmd::new("mdadm")
            .arg("--stop")
            .arg(&array)
            .error_msg(format!("Failed to stop {}", array))
            .run()?;
        Ok(())
    }

    fn require_array(&self) -> Result<&str> {
        self.array.as_deref().ok_or_else(|| Error::Raid {
            message: "raid array not created".to_string(),
        })
    }
}

impl DeviceHandle for RaidDevice {
    fn device(&self) -> &str {
        self.array.as_deref().unwrap_or_default()
    }

    fn is_loop(&self) -> bool {
        self.backing.is_loop
    }
}

impl Drop for RaidDevice {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("shutdown of raid device failed: {}", e);
        }
    }
}
