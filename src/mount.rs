//! Mount tracking.
//!
//! [`MountManager`] owns one mount and knows whether it is active, so
//! unmounting twice or unmounting something that never got mounted is a
//! successful no-op. [`MountStack`] keeps several of them in mount order and
//! tears them down in exact reverse order.
//!
//! # Example
//!
//! ```rust,ignore
//! use disk_image_builder::mount::MountStack;
//!
//! let mut mounts = MountStack::new();
//! let root = mounts.mount("/dev/mapper/loop0p2", None, &[])?.to_path_buf();
//! mounts.mount("/dev/mapper/loop0p1", Some(&root.join("boot")), &[])?;
//! mounts.bind_mount("/dev", &root.join("dev"))?;
//! // ...
//! if !mounts.umount() {
//!     // something is still busy
//! }
//! ```

use crate::defaults;
use crate::error::{Error, IoContext, Result};
use crate::process::Cmd;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// How often and how patiently to retry an unmount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
    /// Fall back to a lazy unmount after the last attempt.
    pub lazy_fallback: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: defaults::UMOUNT_ATTEMPTS,
            interval: Duration::from_millis(defaults::UMOUNT_INTERVAL_MS),
            lazy_fallback: true,
        }
    }
}

impl RetryPolicy {
    /// Policy used when tearing down installer mounts.
    pub fn installer() -> Self {
        Self {
            attempts: defaults::INSTALLER_UMOUNT_ATTEMPTS,
            interval: Duration::from_millis(defaults::UMOUNT_INTERVAL_MS),
            lazy_fallback: false,
        }
    }
}

/// One mount with a known state.
#[derive(Debug)]
pub struct MountManager {
    device: String,
    mountpoint: PathBuf,
    owns_mountpoint: bool,
    mounted: bool,
    bind: bool,
    retry: RetryPolicy,
}

impl MountManager {
    /// Track `device` at `mountpoint`, or at a fresh temporary directory
    /// that is removed again after a successful unmount.
    pub fn new(device: impl Into<String>, mountpoint: Option<&Path>) -> Result<Self> {
        let (mountpoint, owns_mountpoint) = match mountpoint {
            Some(path) => (path.to_path_buf(), false),
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("image-mount.")
                    .tempdir()
                    .at_path(std::env::temp_dir())?;
                (dir.into_path(), true)
            }
        };
        Ok(Self {
            device: device.into(),
            mountpoint,
            owns_mountpoint,
            mounted: false,
            bind: false,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn is_bind(&self) -> bool {
        self.bind
    }

    pub fn mount(&mut self, options: &[String]) -> Result<()> {
        if self.mounted {
            return Ok(());
        }
        fs::create_dir_all(&self.mountpoint).at_path(&self.mountpoint)?;
        let mut cmd = Cmd::new("mount");
        if !options.is_empty() {
            cmd = cmd.arg("-o").arg(options.join(","));
        }
        cmd.arg(&self.device)
            .arg_path(&self.mountpoint)
            .error_msg(format!("Failed to mount {}", self.device))
            .run()?;
        self.mounted = true;
        self.bind = false;
        Ok(())
    }

    pub fn bind_mount(&mut self) -> Result<()> {
        if self.mounted {
            return Ok(());
        }
        fs::create_dir_all(&self.mountpoint).at_path(&self.mountpoint)?;
        Cmd::new("mount")
            .args(["-n", "--bind"])
            .arg(&self.device)
            .arg_path(&self.mountpoint)
            .error_msg(format!("Failed to bind mount {}", self.device))
            .run()?;
        self.mounted = true;
        self.bind = true;
        Ok(())
    }

    /// Unmount with retries. Returns false if the target stays busy.
    ///
    /// Not mounted is success.
    pub fn umount(&mut self) -> bool {
        if !self.mounted {
            return true;
        }
        for attempt in 1..=self.retry.attempts {
            let result = Cmd::new("umount").arg_path(&self.mountpoint).allow_fail().run();
            if matches!(result, Ok(ref out) if out.success()) {
                self.mounted = false;
                return true;
            }
            debug!(
                "umount {} busy (attempt {}/{})",
                self.mountpoint.display(),
                attempt,
                self.retry.attempts
            );
            if attempt < self.retry.attempts && !self.retry.interval.is_zero() {
                thread::sleep(self.retry.interval);
            }
        }

        if self.retry.lazy_fallback {
            let lazy = Cmd::new("umount")
                .arg("-l")
                .arg_path(&self.mountpoint)
                .allow_fail()
                .run();
            if matches!(lazy, Ok(ref out) if out.success()) {
                warn!("{} was unmounted lazily", self.mountpoint.display());
                self.mounted = false;
                return true;
            }
        }

        warn!("{} still busy at {}", self.device, self.mountpoint.display());
        false
    }

    /// Unmount and remove an owned mountpoint directory.
    ///
    /// The directory is kept when the unmount failed.
    pub fn release(&mut self) -> bool {
        if !self.umount() {
            return false;
        }
        if self.owns_mountpoint && self.mountpoint.exists() {
            if let Err(e) = fs::remove_dir(&self.mountpoint) {
                warn!("could not remove {}: {}", self.mountpoint.display(), e);
            }
            self.owns_mountpoint = false;
        }
        true
    }
}

impl Drop for MountManager {
    fn drop(&mut self) {
        if self.mounted || self.owns_mountpoint {
            if self.mounted {
                warn!(
                    "{} still mounted at drop, releasing",
                    self.mountpoint.display()
                );
            }
            self.release();
        }
    }
}

/// Mounts in mount order, released in reverse.
#[derive(Debug, Default)]
pub struct MountStack {
    mounts: Vec<MountManager>,
    retry: Option<RetryPolicy>,
}

impl MountStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry policy for every mount created from here on.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    fn manager(&self, device: &str, mountpoint: Option<&Path>) -> Result<MountManager> {
        let manager = MountManager::new(device, mountpoint)?;
        Ok(match self.retry {
            Some(retry) => manager.with_retry(retry),
            None => manager,
        })
    }

    /// Mount `device` and return the mountpoint in use.
    pub fn mount(
        &mut self,
        device: &str,
        mountpoint: Option<&Path>,
        options: &[String],
    ) -> Result<&Path> {
        let mut manager = self.manager(device, mountpoint)?;
        self.ensure_free(manager.mountpoint())?;
        manager.mount(options)?;
        self.mounts.push(manager);
        Ok(self.last_mountpoint())
    }

    pub fn bind_mount(&mut self, device: &str, mountpoint: &Path) -> Result<&Path> {
        let mut manager = self.manager(device, Some(mountpoint))?;
        self.ensure_free(mountpoint)?;
        manager.bind_mount()?;
        self.mounts.push(manager);
        Ok(self.last_mountpoint())
    }

    /// Take ownership of an already mounted manager.
    pub fn push(&mut self, manager: MountManager) -> Result<()> {
        self.ensure_free(manager.mountpoint())?;
        self.mounts.push(manager);
        Ok(())
    }

    pub fn is_mounted(&self, mountpoint: &Path) -> bool {
        self.mounts
            .iter()
            .any(|m| m.is_mounted() && m.mountpoint() == mountpoint)
    }

    pub fn mountpoints(&self) -> Vec<PathBuf> {
        self.mounts
            .iter()
            .filter(|m| m.is_mounted())
            .map(|m| m.mountpoint().to_path_buf())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.iter().all(|m| !m.is_mounted())
    }

    /// Unmount everything in reverse mount order.
    ///
    /// A failing entry does not stop the remaining ones from being tried.
    /// Entries that unmounted are dropped from the stack, busy ones stay.
    pub fn umount(&mut self) -> bool {
        let mut all_ok = true;
        let mut kept = Vec::new();
        while let Some(mut manager) = self.mounts.pop() {
            if manager.release() {
                continue;
            }
            all_ok = false;
            kept.push(manager);
        }
        kept.reverse();
        self.mounts = kept;
        all_ok
    }

    fn ensure_free(&self, mountpoint: &Path) -> Result<()> {
        if self.is_mounted(mountpoint) {
            return Err(Error::precondition(format!(
                "{} is already an active mountpoint",
                mountpoint.display()
            )));
        }
        Ok(())
    }

    fn last_mountpoint(&self) -> &Path {
        self.mounts
            .last()
            .map(MountManager::mountpoint)
            .unwrap_or_else(|| Path::new("/"))
    }
}

impl Drop for MountStack {
    fn drop(&mut self) {
        if !self.is_empty() && !self.umount() {
            warn!("mounts still busy at teardown: {:?}", self.mountpoints());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            attempts: 5,
            interval: Duration::ZERO,
            lazy_fallback: true,
        }
    }

    #[test]
    fn test_umount_twice_runs_one_umount() {
        let tmp = TempDir::new().unwrap();
        let (runner, _guard) = RecordingRunner::install();
        let mut m = MountManager::new("/dev/loop0p1", Some(tmp.path()))
            .unwrap()
            .with_retry(quick());
        m.mount(&[]).unwrap();
        assert!(m.umount());
        assert!(m.umount());
        assert_eq!(runner.commands_for("umount").len(), 1);
    }

    #[test]
    fn test_umount_of_never_mounted_is_noop() {
        let tmp = TempDir::new().unwrap();
        let (runner, _guard) = RecordingRunner::install();
        let mut m = MountManager::new("/dev/loop0p1", Some(tmp.path())).unwrap();
        assert!(m.umount());
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn test_mount_options_joined() {
        let tmp = TempDir::new().unwrap();
        let (runner, _guard) = RecordingRunner::install();
        let mut m = MountManager::new("/dev/sda2", Some(tmp.path())).unwrap();
        m.mount(&["subvol=@".to_string(), "ro".to_string()]).unwrap();
        assert_eq!(
            runner.commands()[0],
            format!("mount -o subvol=@,ro /dev/sda2 {}", tmp.path().display())
        );
        m.umount();
    }

    #[test]
    fn test_busy_umount_falls_back_to_lazy() {
        let tmp = TempDir::new().unwrap();
        let (runner, _guard) = RecordingRunner::install();
        let mp = tmp.path().display().to_string();
        runner.fail_when("umount", &format!("umount {}", mp));
        let mut m = MountManager::new("/dev/sda2", Some(tmp.path()))
            .unwrap()
            .with_retry(quick());
        m.mount(&[]).unwrap();
        assert!(m.umount());
        let umounts = runner.commands_for("umount");
        assert_eq!(umounts.len(), 6);
        assert_eq!(umounts[5], format!("umount -l {}", mp));
    }

    #[test]
    fn test_owned_mountpoint_removed_after_release() {
        let (_runner, _guard) = RecordingRunner::install();
        let mut m = MountManager::new("/dev/sda2", None).unwrap();
        let mp = m.mountpoint().to_path_buf();
        m.mount(&[]).unwrap();
        assert!(m.release());
        assert!(!mp.exists());
    }

    #[test]
    fn test_stack_unmounts_in_reverse_order() {
        let tmp = TempDir::new().unwrap();
        let (runner, _guard) = RecordingRunner::install();
        let root = tmp.path().join("root");
        let mut stack = MountStack::new();
        stack.mount("/dev/root", Some(&root), &[]).unwrap();
        stack.mount("/dev/boot", Some(&root.join("boot")), &[]).unwrap();
        stack.bind_mount("/dev", &root.join("dev")).unwrap();
        stack.bind_mount("/proc", &root.join("proc")).unwrap();
        assert!(stack.umount());

        let umounts = runner.commands_for("umount");
        assert_eq!(
            umounts,
            vec![
                format!("umount {}", root.join("proc").display()),
                format!("umount {}", root.join("dev").display()),
                format!("umount {}", root.join("boot").display()),
                format!("umount {}", root.display()),
            ]
        );
        assert!(stack.is_empty());
    }

    #[test]
    fn test_stack_continues_after_failure() {
        let tmp = TempDir::new().unwrap();
        let (runner, _guard) = RecordingRunner::install();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        let c = tmp.path().join("c");
        let mut stack = MountStack::new();
        for mp in [&a, &b, &c] {
            stack.mount("/dev/x", Some(mp), &[]).unwrap();
        }
        stack.mounts[1].retry = RetryPolicy {
            attempts: 1,
            interval: Duration::ZERO,
            lazy_fallback: false,
        };
        runner.fail_when("umount", &b.display().to_string());

        assert!(!stack.umount());
        let umounts = runner.commands_for("umount");
        assert_eq!(umounts.last().unwrap(), &format!("umount {}", a.display()));
        assert_eq!(stack.mountpoints(), vec![b.clone()]);

        // leave the stack clean for Drop
        stack.mounts[0].mounted = false;
    }

    #[test]
    fn test_duplicate_active_mountpoint_rejected() {
        let tmp = TempDir::new().unwrap();
        let (_runner, _guard) = RecordingRunner::install();
        let mut stack = MountStack::new();
        stack.mount("/dev/a", Some(tmp.path()), &[]).unwrap();
        assert!(stack.mount("/dev/b", Some(tmp.path()), &[]).is_err());
        assert!(stack.umount());
    }
}
