//! Firmware dependent disk parameters.

use crate::config::{FirmwareMode, ImageConfiguration, PartitionTableType};
use crate::defaults;
use crate::error::{Error, Result};

/// Resolved firmware of one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    arch: String,
    mode: Option<FirmwareMode>,
    zipl_target_type: Option<String>,
    efi_csm: bool,
    efi_partition_mbytes: Option<u64>,
}

impl Firmware {
    /// Resolve the configured firmware, falling back to the arch default.
    ///
    /// Fails when the architecture does not support the requested mode.
    pub fn new(config: &ImageConfiguration) -> Result<Self> {
        let mode = config.firmware.or_else(|| defaults::default_firmware(&config.arch));
        if let Some(mode) = mode {
            if !defaults::supported_firmware(&config.arch).contains(&mode) {
                return Err(Error::NotImplemented {
                    what: format!(
                        "support for firmware {} on arch {}",
                        mode.name(),
                        config.arch
                    ),
                });
            }
        }
        Ok(Self {
            arch: config.arch.clone(),
            mode,
            zipl_target_type: config.zipl.target_type.clone(),
            efi_csm: config.efi_csm,
            efi_partition_mbytes: config.efi_partition_mbytes,
        })
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn mode(&self) -> Option<FirmwareMode> {
        self.mode
    }

    pub fn is_x86(&self) -> bool {
        defaults::X86_ARCHES.contains(&self.arch.as_str())
    }

    pub fn is_s390(&self) -> bool {
        self.arch.starts_with("s390")
    }

    /// EFI-capable mode, if any.
    pub fn efi_mode(&self) -> Option<FirmwareMode> {
        self.mode.filter(|m| m.efi_capable())
    }

    pub fn secure_boot(&self) -> bool {
        self.mode == Some(FirmwareMode::Uefi)
    }

    pub fn ec2_mode(&self) -> Option<FirmwareMode> {
        self.mode.filter(|m| m.ec2_capable())
    }

    pub fn bios_mode(&self) -> bool {
        self.mode == Some(FirmwareMode::Bios)
    }

    pub fn ofw_mode(&self) -> bool {
        self.mode == Some(FirmwareMode::Ofw)
    }

    pub fn opal_mode(&self) -> bool {
        self.mode == Some(FirmwareMode::Opal)
    }

    /// A legacy BIOS boot path co-exists with EFI.
    ///
    /// True on x86 with EFI-capable firmware unless disabled in the
    /// configuration.
    pub fn legacy_bios_mode(&self) -> bool {
        self.efi_csm && self.is_x86() && self.efi_mode().is_some()
    }

    /// Firmware that boots through a BIOS-style boot sector.
    pub fn needs_bios_boot_sector(&self) -> bool {
        self.bios_mode() || self.ec2_mode().is_some() || self.legacy_bios_mode()
    }

    pub fn partition_table_type(&self) -> PartitionTableType {
        if self.is_s390() {
            match self.zipl_target_type.as_deref() {
                Some(t) if t.contains("CDL") || t.contains("LDL") => PartitionTableType::Dasd,
                _ => PartitionTableType::Msdos,
            }
        } else if self.efi_mode().is_some() {
            PartitionTableType::Gpt
        } else {
            PartitionTableType::Msdos
        }
    }

    pub fn legacy_bios_partition_mbytes(&self) -> u64 {
        if self.legacy_bios_mode() {
            defaults::LEGACY_BIOS_PARTITION_MBYTES
        } else {
            0
        }
    }

    pub fn efi_partition_mbytes(&self) -> u64 {
        if self.efi_mode().is_some() {
            self.efi_partition_mbytes
                .unwrap_or(defaults::EFI_PARTITION_MBYTES)
        } else {
            0
        }
    }

    pub fn prep_partition_mbytes(&self) -> u64 {
        if self.ofw_mode() {
            defaults::PREP_PARTITION_MBYTES
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn firmware(extra: &str) -> Result<Firmware> {
        let config = ImageConfiguration::from_toml_str(&format!(
            "image_name = \"t\"\nfilesystem = \"ext4\"\n{}",
            extra
        ))?;
        Firmware::new(&config)
    }

    #[test]
    fn test_efi_on_x86_has_legacy_bios() {
        let fw = firmware("arch = \"x86_64\"\nfirmware = \"efi\"").unwrap();
        assert!(fw.legacy_bios_mode());
        assert_eq!(fw.partition_table_type(), PartitionTableType::Gpt);
        assert_eq!(fw.efi_partition_mbytes(), 20);
        assert_eq!(fw.legacy_bios_partition_mbytes(), 2);
    }

    #[test]
    fn test_efi_on_arm_has_no_legacy_bios() {
        let fw = firmware("arch = \"aarch64\"").unwrap();
        assert_eq!(fw.mode(), Some(FirmwareMode::Efi));
        assert!(!fw.legacy_bios_mode());
        assert_eq!(fw.legacy_bios_partition_mbytes(), 0);
    }

    #[test]
    fn test_csm_can_be_disabled() {
        let fw = firmware("arch = \"x86_64\"\nfirmware = \"uefi\"\nefi_csm = false").unwrap();
        assert!(!fw.legacy_bios_mode());
        assert!(fw.secure_boot());
    }

    #[test]
    fn test_bios_is_msdos() {
        let fw = firmware("arch = \"x86_64\"").unwrap();
        assert!(fw.bios_mode());
        assert_eq!(fw.partition_table_type(), PartitionTableType::Msdos);
        assert_eq!(fw.efi_partition_mbytes(), 0);
    }

    #[test]
    fn test_ofw_prep_size() {
        let fw = firmware("arch = \"ppc64le\"").unwrap();
        assert_eq!(fw.prep_partition_mbytes(), 8);
    }

    #[test]
    fn test_s390_dasd_table() {
        let fw = firmware("arch = \"s390x\"\n[zipl]\ntarget_type = \"CDL\"").unwrap();
        assert_eq!(fw.mode(), None);
        assert_eq!(fw.partition_table_type(), PartitionTableType::Dasd);
        let fw = firmware("arch = \"s390x\"\n[zipl]\ntarget_type = \"SCSI\"").unwrap();
        assert_eq!(fw.partition_table_type(), PartitionTableType::Msdos);
    }

    #[test]
    fn test_unsupported_firmware_rejected() {
        let err = firmware("arch = \"i686\"\nfirmware = \"efi\"").unwrap_err();
        assert!(matches!(err, Error::NotImplemented { .. }));
    }

    #[test]
    fn test_efi_size_override() {
        let fw = firmware("arch = \"x86_64\"\nfirmware = \"efi\"\nefi_partition_mbytes = 64").unwrap();
        assert_eq!(fw.efi_partition_mbytes(), 64);
    }
}
