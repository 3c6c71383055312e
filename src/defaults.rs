//! Built-in sizes, names and tool settings.

/// EFI system partition size in MB.
pub const EFI_PARTITION_MBYTES: u64 = 20;

/// Dedicated boot partition size in MB.
pub const BOOT_PARTITION_MBYTES: u64 = 300;

/// BIOS boot partition kept next to EFI on x86.
pub const LEGACY_BIOS_PARTITION_MBYTES: u64 = 2;

pub const PREP_PARTITION_MBYTES: u64 = 8;

/// Fixed overhead of an LVM volume group in MB.
pub const LVM_OVERHEAD_MBYTES: u64 = 80;

pub const MIN_VOLUME_MBYTES: u64 = 30;

pub const INODE_SIZE_BYTES: u64 = 256;

pub const BOOT_TIMEOUT_SECONDS: u32 = 10;

pub const VOLUME_GROUP_NAME: &str = "systemVG";

/// Safety factor applied to the compressed recovery archive.
pub const INPLACE_RECOVERY_FACTOR: f64 = 1.7;

/// Slack added to fixed-size root partitions.
pub const MIN_PARTITION_SLACK_MBYTES: u64 = 10;

pub const LUKS_KEY_LENGTH: usize = 256;

pub const LOOP_DETACH_ATTEMPTS: u32 = 20;
pub const LOOP_DETACH_INTERVAL_MS: u64 = 250;

pub const UMOUNT_ATTEMPTS: u32 = 5;
pub const UMOUNT_INTERVAL_MS: u64 = 1000;

pub const INSTALLER_UMOUNT_ATTEMPTS: u32 = 3;

pub const S390_DISK_BLOCK_SIZE: u32 = 4096;
pub const S390_DISK_TYPE: &str = "CDL";

pub const ROOT_LABEL: &str = "ROOT";
pub const BOOT_LABEL: &str = "BOOT";
pub const EFI_LABEL: &str = "EFI";
pub const SPARE_LABEL: &str = "SPARE";
pub const SWAP_LABEL: &str = "SWAP";

/// Name of the LUKS mapping for the root partition.
pub const LUKS_MAP_NAME: &str = "luksRoot";

pub const INTEGRITY_MAP_NAME: &str = "integrityRoot";
pub const INTEGRITY_ALGORITHM: &str = "sha256";
pub const INTEGRITY_KEY_ALGORITHM: &str = "hmac-sha256";
pub const INTEGRITY_SECTOR_SIZE: u32 = 512;

/// Verification metadata lives in the last bytes of a partition.
pub const DM_METADATA_OFFSET: u64 = 4096;
pub const DM_METADATA_FORMAT_VERSION: &str = "1";

/// Result file written next to the images.
pub const RESULT_FILE_NAME: &str = "build.result.json";

pub const RECOVERY_ARCHIVE_NAME: &str = "recovery.tar.zst";

/// Build-time files that never belong in the synced system.
pub const EXCLUDE_LIST: &[&str] = &[
    "image",
    ".profile",
    ".kconfig",
    ".buildenv",
    "var/cache/image-builder",
];

/// Contents of virtual filesystems and scratch directories.
pub const EXCLUDE_CONTENTS: &[&str] = &["run/*", "tmp/*", "proc/*", "sys/*", "dev/*"];

/// Options passed to every rsync run.
pub const RSYNC_OPTIONS: &[&str] = &[
    "-a",
    "-H",
    "-X",
    "-A",
    "--one-file-system",
    "--inplace",
];

/// Kernel options appended for the failsafe boot entry.
pub const FAILSAFE_KERNEL_OPTIONS: &str = "ide=nodma apm=off noresume edd=off \
    powersaved=off nohz=off highres=off processsor.max+cstate=1 nomodeset x11failsafe";

/// Modules baked into the GRUB EFI image.
pub const GRUB_EFI_MODULES: &[&str] = &[
    "ext2", "iso9660", "linux", "echo", "configfile", "search_label", "search_fs_file",
    "search", "search_fs_uuid", "ls", "normal", "gzio", "png", "fat", "gettext", "font",
    "minicmd", "gfxterm", "gfxmenu", "all_video", "xfs", "btrfs", "lvm", "luks",
    "gcry_rijndael", "gcry_sha256", "gcry_sha512", "crypto", "cryptodisk", "test", "true",
    "loadenv", "part_gpt", "part_msdos", "efi_gop", "efi_uga", "multiboot2",
];

/// Modules grub2-install puts into the BIOS core image.
pub const GRUB_BIOS_MODULES: &[&str] = &[
    "ext2", "iso9660", "linux", "echo", "configfile", "search_label", "search_fs_file",
    "search", "search_fs_uuid", "ls", "normal", "gzio", "png", "fat", "gettext", "font",
    "minicmd", "gfxterm", "gfxmenu", "all_video", "xfs", "btrfs", "lvm", "luks",
    "gcry_rijndael", "gcry_sha256", "gcry_sha512", "crypto", "cryptodisk", "test", "true",
    "loadenv", "part_gpt", "part_msdos", "biosdisk", "vga", "vbe", "chain", "boot", "multiboot",
];

/// Modules for the PReP core image.
pub const GRUB_OFW_MODULES: &[&str] = &[
    "ext2", "iso9660", "linux", "echo", "configfile", "search_label", "search_fs_file",
    "search", "search_fs_uuid", "ls", "normal", "gzio", "fat", "gettext", "font", "minicmd",
    "xfs", "btrfs", "lvm", "part_gpt", "part_msdos", "boot",
];

/// Architectures with a legacy BIOS.
pub const X86_ARCHES: &[&str] = &["x86_64", "i586", "i686"];

/// Default firmware for an architecture, `None` where no firmware applies.
pub fn default_firmware(arch: &str) -> Option<crate::config::FirmwareMode> {
    use crate::config::FirmwareMode;
    match arch {
        "x86_64" | "i586" | "i686" => Some(FirmwareMode::Bios),
        "ppc" | "ppc64" | "ppc64le" => Some(FirmwareMode::Ofw),
        a if a.starts_with("arm") || a == "aarch64" => Some(FirmwareMode::Efi),
        _ => None,
    }
}

/// Firmware modes an architecture supports.
pub fn supported_firmware(arch: &str) -> &'static [crate::config::FirmwareMode] {
    use crate::config::FirmwareMode::*;
    match arch {
        "x86_64" => &[Efi, Uefi, Bios, Ec2Hvm, Ec2],
        "i586" | "i686" => &[Bios],
        "ppc" => &[Ofw],
        "ppc64" | "ppc64le" => &[Ofw, Opal],
        a if a.starts_with("arm") || a == "aarch64" => &[Efi, Uefi, Vboot],
        _ => &[],
    }
}

/// GRUB EFI target for an architecture.
pub fn efi_module_directory_name(arch: &str) -> Option<&'static str> {
    match arch {
        "x86_64" => Some("x86_64-efi"),
        "aarch64" | "arm64" => Some("arm64-efi"),
        a if a.starts_with("armv") => Some("arm-efi"),
        _ => None,
    }
}

/// Removable-media EFI image name for an architecture.
pub fn efi_image_name(arch: &str) -> Option<&'static str> {
    match arch {
        "x86_64" => Some("bootx64.efi"),
        "aarch64" | "arm64" => Some("bootaa64.efi"),
        a if a.starts_with("armv") => Some("bootarm.efi"),
        _ => None,
    }
}
