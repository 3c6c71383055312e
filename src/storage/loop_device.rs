//! File-backed loop devices.

use super::DeviceHandle;
use crate::defaults;
use crate::error::{Error, IoContext, Result};
use crate::process::Cmd;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A sparse image file attached to a loop device.
#[derive(Debug)]
pub struct LoopDevice {
    filename: PathBuf,
    size_mbytes: Option<u64>,
    blocksize: Option<u32>,
    node: Option<String>,
    detach_attempts: u32,
    detach_interval: Duration,
}

impl LoopDevice {
    /// Describe a loop device for `filename`.
    ///
    /// Without a size the file must already exist.
    pub fn new(filename: impl Into<PathBuf>, size_mbytes: Option<u64>, blocksize: Option<u32>) -> Self {
        Self {
            filename: filename.into(),
            size_mbytes,
            blocksize,
            node: None,
            detach_attempts: defaults::LOOP_DETACH_ATTEMPTS,
            detach_interval: Duration::from_millis(defaults::LOOP_DETACH_INTERVAL_MS),
        }
    }

    pub fn with_detach_poll(mut self, attempts: u32, interval: Duration) -> Self {
        self.detach_attempts = attempts;
        self.detach_interval = interval;
        self
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Create the backing file if needed and attach it.
    pub fn create(&mut self, overwrite: bool) -> Result<()> {
        match self.size_mbytes {
            Some(mbytes) if overwrite || !self.filename.exists() => {
                let file = fs::File::create(&self.filename).at_path(&self.filename)?;
                file.set_len(mbytes * 1_048_576).at_path(&self.filename)?;
            }
            None if !self.filename.exists() => {
                return Err(Error::LoopSetup {
                    message: format!(
                        "no size given and {} does not exist",
                        self.filename.display()
                    ),
                });
            }
            _ => {}
        }

        let mut cmd = Cmd::new("losetup");
        if let Some(blocksize) = self.blocksize.filter(|b| *b != 512) {
            cmd = cmd.arg("--sector-size").arg(blocksize.to_string());
        }
        let out = cmd
            .args(["-f", "--show"])
            .arg_path(&self.filename)
            .error_msg("Failed to attach loop device")
            .run()?;
        let node = out.stdout.trim().to_string();
        if node.is_empty() {
            return Err(Error::LoopSetup {
                message: format!("losetup returned no device for {}", self.filename.display()),
            });
        }
        info!("--> attached {} to {}", self.filename.display(), node);
        self.node = Some(node);
        Ok(())
    }

    /// Detach and wait until the kernel released the backing file.
    pub fn release(&mut self) -> Result<()> {
        let Some(node) = self.node.take() else {
            return Ok(());
        };
        Cmd::new("losetup")
            .arg("-d")
            .arg(&node)
            .error_msg(format!("Failed to detach {}", node))
            .run()?;

        for attempt in 1..=self.detach_attempts {
            let out = Cmd::new("losetup")
                .arg("-j")
                .arg_path(&self.filename)
                .allow_fail()
                .run()?;
            if out.stdout.trim().is_empty() {
                return Ok(());
            }
            debug!("{} still referenced (attempt {})", node, attempt);
            if !self.detach_interval.is_zero() {
                thread::sleep(self.detach_interval);
            }
        }
        Err(Error::LoopSetup {
            message: format!(
                "{} still attached to {} after {} checks",
                self.filename.display(),
                node,
                self.detach_attempts
            ),
        })
    }
}

impl DeviceHandle for LoopDevice {
    fn device(&self) -> &str {
        self.node.as_deref().unwrap_or_default()
    }

    fn is_loop(&self) -> bool {
        true
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if self.node.is_some() {
            if let Err(e) = self.release() {
                warn!("loop device release failed: {}", e);
            }
        }
    }
}
