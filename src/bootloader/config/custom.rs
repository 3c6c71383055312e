//! Opt-out family: the image brings its own bootloader setup.

use super::{BootLoaderConfig, BootParams, BootTarget, BootloaderState};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct CustomBootLoaderConfig;

fn not_implemented(what: &str) -> Error {
    Error::NotImplemented {
        what: format!("custom bootloader {}", what),
    }
}

impl BootLoaderConfig for CustomBootLoaderConfig {
    fn setup_boot_images(&mut self, _target: BootTarget, _params: &BootParams) -> Result<()> {
        Err(not_implemented("boot images"))
    }

    fn setup_image_config(&mut self, _target: BootTarget, _params: &BootParams) -> Result<()> {
        Err(not_implemented("image config"))
    }

    fn write(&mut self) -> Result<()> {
        Err(not_implemented("write"))
    }

    fn state(&self) -> BootloaderState {
        BootloaderState::Unconfigured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_operation_fails() {
        let mut config = CustomBootLoaderConfig;
        let params = BootParams::default();
        assert!(matches!(
            config.setup_disk_boot_images(&params),
            Err(Error::NotImplemented { .. })
        ));
        assert!(matches!(
            config.setup_live_image_config(&params),
            Err(Error::NotImplemented { .. })
        ));
        assert!(matches!(config.write(), Err(Error::NotImplemented { .. })));
    }
}
