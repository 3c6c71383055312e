//! Bootloader configuration, templates and installation.
//!
//! ```text
//! new_bootloader_config ──> setup_*_boot_images ──> setup_*_image_config ──> write
//! new_bootloader_install ──> install
//! ```

pub mod config;
pub mod install;
pub mod template;

pub use config::{new_bootloader_config, BootLoaderConfig, BootParams, BootTarget, BootloaderState};
pub use install::{new_bootloader_install, BootLoaderInstall, InstallDevices};
