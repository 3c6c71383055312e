//! Image description.
//!
//! An [`ImageConfiguration`] is read once from a TOML file and stays
//! immutable for the whole build. Every enum is closed; unknown names are
//! rejected by serde before the pipeline starts.
//!
//! # Example
//!
//! ```toml
//! image_name = "appliance"
//! filesystem = "ext4"
//! firmware = "efi"
//! volume_manager = "lvm"
//!
//! [[volumes]]
//! name = "home"
//! path = "home"
//! size = "500"
//!
//! [partitions.var]
//! mbytes = 300
//! filesystem = "xfs"
//! mountpoint = "/var"
//! ```

use crate::defaults;
use crate::error::{Error, IoContext, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Boot firmware interface of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareMode {
    Bios,
    Efi,
    /// EFI with secure boot
    Uefi,
    Vboot,
    Ofw,
    Opal,
    Ec2,
    Ec2Hvm,
}

impl FirmwareMode {
    pub fn efi_capable(self) -> bool {
        matches!(self, FirmwareMode::Efi | FirmwareMode::Uefi | FirmwareMode::Vboot)
    }

    pub fn ec2_capable(self) -> bool {
        matches!(self, FirmwareMode::Ec2 | FirmwareMode::Ec2Hvm)
    }

    pub fn name(self) -> &'static str {
        match self {
            FirmwareMode::Bios => "bios",
            FirmwareMode::Efi => "efi",
            FirmwareMode::Uefi => "uefi",
            FirmwareMode::Vboot => "vboot",
            FirmwareMode::Ofw => "ofw",
            FirmwareMode::Opal => "opal",
            FirmwareMode::Ec2 => "ec2",
            FirmwareMode::Ec2Hvm => "ec2hvm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemKind {
    Ext2,
    Ext3,
    Ext4,
    Btrfs,
    Xfs,
    Fat16,
    Fat32,
    Squashfs,
    Swap,
    Clicfs,
}

impl FilesystemKind {
    pub fn name(self) -> &'static str {
        match self {
            FilesystemKind::Ext2 => "ext2",
            FilesystemKind::Ext3 => "ext3",
            FilesystemKind::Ext4 => "ext4",
            FilesystemKind::Btrfs => "btrfs",
            FilesystemKind::Xfs => "xfs",
            FilesystemKind::Fat16 => "fat16",
            FilesystemKind::Fat32 => "fat32",
            FilesystemKind::Squashfs => "squashfs",
            FilesystemKind::Swap => "swap",
            FilesystemKind::Clicfs => "clicfs",
        }
    }

    /// Name used in fstab and mount -t.
    pub fn fstab_type(self) -> &'static str {
        match self {
            FilesystemKind::Fat16 | FilesystemKind::Fat32 => "vfat",
            other => other.name(),
        }
    }

    pub fn is_ext(self) -> bool {
        matches!(
            self,
            FilesystemKind::Ext2 | FilesystemKind::Ext3 | FilesystemKind::Ext4
        )
    }

    /// Content is fixed at creation and cannot be synced later.
    pub fn is_read_only_image(self) -> bool {
        matches!(self, FilesystemKind::Squashfs | FilesystemKind::Clicfs)
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeManagerKind {
    Btrfs,
    Lvm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootloaderKind {
    Grub2,
    SystemdBoot,
    Zipl,
    Isolinux,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidLevel {
    Mirroring,
    Striping,
}

impl RaidLevel {
    /// Level argument for mdadm.
    pub fn mdadm_level(self) -> &'static str {
        match self {
            RaidLevel::Mirroring => "1",
            RaidLevel::Striping => "0",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTableType {
    Msdos,
    Gpt,
    Dasd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiskFormat {
    Qcow2,
    Vmdk,
    Vhd,
    VhdFixed,
}

impl DiskFormat {
    /// Output format name for qemu-img.
    pub fn qemu_format(self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vhd | DiskFormat::VhdFixed => "vpc",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vhd => "vhd",
            DiskFormat::VhdFixed => "vhdfixed",
        }
    }
}

/// How fstab entries identify their device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Persistency {
    #[default]
    ByUuid,
    ByLabel,
    ByPartuuid,
}

impl Persistency {
    /// blkid tag and fstab prefix.
    pub fn blkid_type(self) -> &'static str {
        match self {
            Persistency::ByUuid => "UUID",
            Persistency::ByLabel => "LABEL",
            Persistency::ByPartuuid => "PARTUUID",
        }
    }
}

/// Build type. Installation media are only produced for `oem` images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    #[default]
    Disk,
    Oem,
}

/// Requested size of a volume.
///
/// Parsed from `"all"`, `"freespace:<mbytes>"` or `"<mbytes>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum VolumeSize {
    /// Fill the remaining space of the container.
    All,
    /// Data size plus this many megabytes.
    Freespace(u64),
    /// Exactly this many megabytes.
    Fixed(u64),
}

impl Default for VolumeSize {
    fn default() -> Self {
        VolumeSize::Freespace(0)
    }
}

impl TryFrom<String> for VolumeSize {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let value = value.trim();
        if value == "all" {
            return Ok(VolumeSize::All);
        }
        if let Some(free) = value.strip_prefix("freespace:") {
            return parse_mbytes(free).map(VolumeSize::Freespace);
        }
        parse_mbytes(value).map(VolumeSize::Fixed)
    }
}

/// Parse `NNN`, `NNNM` or `NNNG` into megabytes.
pub fn parse_mbytes(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim();
    let (digits, factor) = if let Some(v) = value.strip_suffix('G') {
        (v, 1024)
    } else if let Some(v) = value.strip_suffix('M') {
        (v, 1)
    } else {
        (value, 1)
    };
    digits
        .parse::<u64>()
        .map(|n| n * factor)
        .map_err(|_| format!("invalid size '{}'", value))
}

/// One btrfs subvolume or LVM logical volume.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeSpec {
    pub name: String,
    /// Mount-relative path without leading slash. Defaults to the name.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub size: VolumeSize,
    /// This volume holds `/` itself.
    #[serde(default)]
    pub root: bool,
    /// Disable copy-on-write for the volume.
    #[serde(default)]
    pub nocow: bool,
    #[serde(default)]
    pub label: Option<String>,
}

impl VolumeSpec {
    /// Normalised relative path, `""` for the root volume.
    pub fn realpath(&self) -> String {
        if self.root {
            return String::new();
        }
        normalize_path(self.path.as_deref().unwrap_or(&self.name))
    }
}

fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomPartition {
    pub mbytes: u64,
    pub filesystem: FilesystemKind,
    #[serde(default)]
    pub mountpoint: Option<String>,
}

/// User override of the computed disk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SizeOverride {
    pub mbytes: u64,
    /// Add to the computed size instead of replacing it.
    #[serde(default)]
    pub additive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LuksConfig {
    #[serde(default)]
    pub passphrase: String,
    /// Distribution hint selecting cipher parameters.
    #[serde(default)]
    pub os: Option<String>,
    /// Fill the partition with random data before formatting.
    #[serde(default)]
    pub randomize: bool,
    /// Name of an extra random key file placed in the root of the system.
    #[serde(default)]
    pub keyfile: Option<String>,
}

/// Standalone dm-integrity layer below the root filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntegrityConfig {
    /// Keyed hmac instead of a plain checksum.
    #[serde(default)]
    pub keyfile: Option<PathBuf>,
    /// Kernel keyring description of the hmac key, used in metadata.
    #[serde(default)]
    pub key_description: Option<String>,
    #[serde(default)]
    pub legacy_hmac: bool,
    /// Write a signed metadata block into the last bytes of the root
    /// partition.
    #[serde(default)]
    pub embed_metadata: bool,
}

/// Data blocks covered by a dm-verity hash tree.
///
/// Parsed from `"all"` or a block count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum VerityBlocks {
    All,
    Count(u64),
}

impl VerityBlocks {
    pub fn count(self) -> Option<u64> {
        match self {
            VerityBlocks::All => None,
            VerityBlocks::Count(n) => Some(n),
        }
    }
}

impl TryFrom<String> for VerityBlocks {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.trim() {
            "all" => Ok(VerityBlocks::All),
            other => other
                .parse::<u64>()
                .map(VerityBlocks::Count)
                .map_err(|_| format!("invalid verity block count '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpareConfig {
    pub mbytes: u64,
    #[serde(default)]
    pub filesystem: Option<FilesystemKind>,
    #[serde(default)]
    pub mountpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZiplConfig {
    /// DASD target type (`CDL`, `LDL`, `FBA`, `SCSI`).
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub target_blocksize: Option<u32>,
    /// Host key documents enabling a secure execution image.
    #[serde(default)]
    pub host_key_certificates: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootloaderConfig {
    #[serde(default)]
    pub timeout: Option<u32>,
    /// `gfxterm`, `serial` or `console`.
    #[serde(default)]
    pub console: Option<String>,
    #[serde(default)]
    pub serial_line: Option<String>,
    /// VESA mode code or `WxH`.
    #[serde(default)]
    pub gfxmode: Option<String>,
    #[serde(default)]
    pub theme: Option<String>,
    /// Menu title. Defaults to the image name.
    #[serde(default)]
    pub title: Option<String>,
    /// Xen domain: `dom0` or `domU`.
    #[serde(default)]
    pub hypervisor_domain: Option<String>,
    #[serde(default)]
    pub failsafe: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageConfiguration {
    pub image_name: String,
    #[serde(default = "default_image_version")]
    pub image_version: String,
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default)]
    pub image_type: ImageType,
    pub filesystem: FilesystemKind,
    /// Unset picks the architecture default.
    #[serde(default)]
    pub firmware: Option<FirmwareMode>,
    /// Keep a BIOS boot partition next to EFI on x86.
    #[serde(default = "default_true")]
    pub efi_csm: bool,
    #[serde(default)]
    pub efi_partition_mbytes: Option<u64>,
    #[serde(default)]
    pub gpt_hybrid_mbr: bool,
    #[serde(default)]
    pub force_mbr: bool,
    #[serde(default)]
    pub volume_manager: Option<VolumeManagerKind>,
    #[serde(default)]
    pub volume_group_name: Option<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub btrfs_root_is_snapshot: bool,
    #[serde(default)]
    pub btrfs_root_is_readonly_snapshot: bool,
    #[serde(default)]
    pub btrfs_quota_groups: bool,
    #[serde(default)]
    pub boot_partition: Option<bool>,
    #[serde(default)]
    pub boot_partition_mbytes: Option<u64>,
    #[serde(default)]
    pub boot_filesystem: Option<FilesystemKind>,
    #[serde(default)]
    pub raid: Option<RaidLevel>,
    #[serde(default)]
    pub luks: Option<LuksConfig>,
    #[serde(default)]
    pub integrity: Option<IntegrityConfig>,
    #[serde(default)]
    pub overlay_root: bool,
    #[serde(default)]
    pub squashfs_compression: Option<String>,
    /// Hash tree over the read-only root image.
    #[serde(default)]
    pub verity_blocks: Option<VerityBlocks>,
    /// Private key signing embedded verification metadata.
    #[serde(default)]
    pub signing_key_file: Option<PathBuf>,
    #[serde(default)]
    pub partitions: BTreeMap<String, CustomPartition>,
    #[serde(default)]
    pub spare: Option<SpareConfig>,
    #[serde(default)]
    pub swap_mbytes: Option<u64>,
    #[serde(default)]
    pub unpartitioned_bytes: Option<u64>,
    #[serde(default)]
    pub size: Option<SizeOverride>,
    #[serde(default)]
    pub root_clone_count: u32,
    #[serde(default)]
    pub boot_clone_count: u32,
    #[serde(default)]
    pub root_label: Option<String>,
    #[serde(default)]
    pub persistency: Persistency,
    #[serde(default)]
    pub fs_mount_options: Option<String>,
    #[serde(default)]
    pub target_blocksize: Option<u32>,
    #[serde(default = "default_bootloader")]
    pub bootloader: BootloaderKind,
    #[serde(default)]
    pub bootloader_settings: BootloaderConfig,
    #[serde(default)]
    pub kernel_cmdline: String,
    #[serde(default)]
    pub zipl: ZiplConfig,
    #[serde(default)]
    pub recovery: bool,
    #[serde(default)]
    pub inplace_recovery: bool,
    #[serde(default)]
    pub disk_format: Option<DiskFormat>,
    #[serde(default)]
    pub install_iso: bool,
    #[serde(default)]
    pub install_stick: bool,
    #[serde(default)]
    pub install_pxe: bool,
    /// Largest acceptable raw image in bytes.
    #[serde(default)]
    pub image_size_limit: Option<u64>,
}

fn default_image_version() -> String {
    "1.0.0".to_string()
}

fn default_arch() -> String {
    std::env::consts::ARCH.to_string()
}

fn default_true() -> bool {
    true
}

fn default_bootloader() -> BootloaderKind {
    BootloaderKind::Grub2
}

impl ImageConfiguration {
    /// Read and validate an image description file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).at_path(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ImageConfiguration =
            toml::from_str(content).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.image_name.trim().is_empty() {
            return Err(Error::config("image_name must not be empty"));
        }
        validate_volumes(&self.volumes)?;

        for name in self.partitions.keys() {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(Error::config(format!(
                    "invalid custom partition name '{}'",
                    name
                )));
            }
        }

        if let Some(luks) = &self.luks {
            if luks.passphrase.is_empty() && luks.keyfile.is_none() {
                return Err(Error::config(
                    "luks requires a passphrase or a key file",
                ));
            }
        }

        if self.btrfs_root_is_readonly_snapshot && !self.btrfs_root_is_snapshot {
            return Err(Error::config(
                "btrfs_root_is_readonly_snapshot requires btrfs_root_is_snapshot",
            ));
        }

        if self.verity_blocks.is_some() && !self.overlay_root {
            return Err(Error::config("verity_blocks requires overlay_root"));
        }
        if self.integrity.as_ref().is_some_and(|i| i.embed_metadata)
            && self.signing_key_file.is_none()
        {
            return Err(Error::config(
                "embedded integrity metadata requires signing_key_file",
            ));
        }
        if self.integrity.as_ref().is_some_and(|i| i.embed_metadata)
            && (!self.filesystem.is_ext() || self.volume_manager.is_some())
        {
            return Err(Error::config(
                "embedded integrity metadata needs a flat ext root filesystem",
            ));
        }

        if let Some(spare) = &self.spare {
            if spare.mbytes == 0 {
                return Err(Error::config("spare partition size must be positive"));
            }
        }
        Ok(())
    }

    pub fn volume_group_name(&self) -> &str {
        self.volume_group_name
            .as_deref()
            .unwrap_or(defaults::VOLUME_GROUP_NAME)
    }

    pub fn root_label(&self) -> &str {
        self.root_label.as_deref().unwrap_or(defaults::ROOT_LABEL)
    }

    pub fn boot_filesystem(&self) -> FilesystemKind {
        self.boot_filesystem.unwrap_or(FilesystemKind::Ext3)
    }

    pub fn bootloader_timeout(&self) -> u32 {
        self.bootloader_settings
            .timeout
            .unwrap_or(defaults::BOOT_TIMEOUT_SECONDS)
    }

    pub fn menu_title(&self) -> &str {
        self.bootloader_settings
            .title
            .as_deref()
            .unwrap_or(&self.image_name)
    }

    pub fn squashfs_compression(&self) -> &str {
        self.squashfs_compression.as_deref().unwrap_or("xz")
    }

    /// Root is a read-only btrfs snapshot.
    pub fn root_is_readonly_snapshot(&self) -> bool {
        self.volume_manager == Some(VolumeManagerKind::Btrfs)
            && self.btrfs_root_is_snapshot
            && self.btrfs_root_is_readonly_snapshot
    }

    /// Output file stem, e.g. `appliance.x86_64-1.0.0`.
    pub fn image_stem(&self) -> String {
        format!("{}.{}-{}", self.image_name, self.arch, self.image_version)
    }
}

/// Root uniqueness and unique, well-formed volume paths.
pub fn validate_volumes(volumes: &[VolumeSpec]) -> Result<()> {
    let roots = volumes.iter().filter(|v| v.root).count();
    if roots > 1 {
        return Err(Error::VolumeSetup {
            message: format!("{} volumes are flagged as root, only one is allowed", roots),
        });
    }

    let mut names = BTreeSet::new();
    let mut paths = BTreeSet::new();
    for volume in volumes {
        if !names.insert(volume.name.as_str()) {
            return Err(Error::VolumeSetup {
                message: format!("duplicate volume name '{}'", volume.name),
            });
        }
        if volume.root {
            continue;
        }
        let path = volume.realpath();
        if path.is_empty() {
            return Err(Error::VolumeSetup {
                message: format!("volume '{}' maps to / but is not the root volume", volume.name),
            });
        }
        if path.split('/').any(|c| c == "..") {
            return Err(Error::VolumeSetup {
                message: format!("volume path '{}' leaves the root tree", path),
            });
        }
        if !paths.insert(path.clone()) {
            return Err(Error::VolumeSetup {
                message: format!("volume path '{}' is used more than once", path),
            });
        }
    }
    Ok(())
}
