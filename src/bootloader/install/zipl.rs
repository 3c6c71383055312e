//! zipl install from the rendered config on the boot partition.

use super::{BootLoaderInstall, InstallDevices};
use crate::error::Result;
use crate::mount::{MountStack, RetryPolicy};
use crate::process::Cmd;
use tracing::{info, warn};

#[derive(Debug)]
pub struct ZiplInstall {
    devices: InstallDevices,
}

impl ZiplInstall {
    pub fn new(devices: InstallDevices) -> Self {
        Self { devices }
    }

    fn install_mounted(&self, mounts: &mut MountStack) -> Result<()> {
        let boot_mount = mounts
            .mount(self.devices.boot_device(), None, &[])?
            .to_path_buf();
        let mount = boot_mount.display();
        info!("Installing zipl on {}", self.devices.disk_device);
        Cmd::new("bash")
            .arg("-c")
            .arg(format!("cd {} && zipl -V -c {}/config -m menu", mount, mount))
            .error_msg("Failed to install zipl")
            .run()?;
        Ok(())
    }
}

impl BootLoaderInstall for ZiplInstall {
    fn install_required(&self) -> bool {
        true
    }

    fn install(&mut self) -> Result<()> {
        let mut mounts = MountStack::new().with_retry(RetryPolicy::installer());
        let result = self.install_mounted(&mut mounts);
        if !mounts.umount() {
            warn!("zipl install mounts still busy: {:?}", mounts.mountpoints());
        }
        result
    }
}
