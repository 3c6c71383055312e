//! Image builders.
//!
//! ```text
//! DiskBuilder::create_disk ──> <stem>.raw, <stem>.boot.json, <stem>.verity
//!     ├── create_install_media ──> <stem>.install.iso, <stem>.install.tar.zst
//!     └── create_disk_format ──> <stem>.<qcow2|vmdk|vhd|vhdfixed>
//! ```
//!
//! Every step registers its artifacts in a [`BuildResult`](crate::system::BuildResult).

pub mod disk;
pub mod format;
pub mod install;
pub mod lock;

pub use disk::DiskBuilder;
pub use format::{append_unpartitioned_space, verify_image_size};
pub use install::InstallImageBuilder;
pub use lock::BuildLock;

/// Keys of the registered artifacts.
pub mod result_key {
    pub const DISK_IMAGE: &str = "disk_image";
    pub const DISK_FORMAT_IMAGE: &str = "disk_format_image";
    pub const INSTALLATION_IMAGE: &str = "installation_image";
    pub const INSTALLATION_PXE_ARCHIVE: &str = "installation_pxe_archive";
    pub const VERITY_CREDENTIALS: &str = "verity_credentials";
}
