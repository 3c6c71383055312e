//! Bootable disk image assembly from a prepared root tree.
//!
//! Takes a system root directory and an image configuration and writes a
//! raw disk with partition table, filesystems, boot metadata and an
//! installed bootloader. Optional follow-up steps convert the disk to a VM
//! format or wrap it in installation media.
//!
//! # Architecture
//!
//! ```text
//! config ──> firmware ──> storage::DiskSetup (sizes)
//!                              │
//! builder::DiskBuilder ────────┤
//!     ├── storage      loop device, partition table, RAID, LUKS
//!     ├── volume_manager   btrfs subvolumes or LVM volumes
//!     ├── filesystem   mkfs and rsync of the root tree
//!     ├── boot         initrd through dracut, boot snapshot
//!     ├── bootloader   config rendering and install
//!     └── system       disk identifier, build result
//! ```
//!
//! Every external tool runs through [`process::Cmd`], so whole builds can
//! be replayed in tests against a recording runner without touching host
//! devices.
//!
//! # Example
//!
//! ```rust,ignore
//! use disk_image_builder::builder::DiskBuilder;
//! use disk_image_builder::config::ImageConfiguration;
//! use std::path::Path;
//!
//! let config = ImageConfiguration::load(Path::new("appliance.toml"))?;
//! let mut builder = DiskBuilder::new(config, Path::new("/build/root"), Path::new("/build/out"))?;
//! let mut result = builder.create_disk()?;
//! builder.create_disk_format(&mut result)?;
//! ```

pub mod boot;
pub mod bootloader;
pub mod builder;
pub mod config;
pub mod defaults;
pub mod error;
pub mod filesystem;
pub mod firmware;
pub mod mount;
pub mod preflight;
pub mod process;
pub mod storage;
pub mod system;
pub mod utils;
pub mod volume_manager;

pub use builder::DiskBuilder;
pub use config::ImageConfiguration;
pub use error::{Error, Result};
