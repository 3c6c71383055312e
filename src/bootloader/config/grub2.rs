//! GRUB2 configuration and EFI boot images.

use super::{BootLoaderBase, BootLoaderConfig, BootParams, BootTarget, BootloaderState};
use crate::bootloader::template::grub2::{self as templates, EntryStyle, Terminal};
use crate::bootloader::template::Values;
use crate::defaults;
use crate::error::{Error, IoContext, Result};
use crate::process::Cmd;
use crate::utils::fs::{copy_dir_recursive, copy_file, write_file};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// GRUB installation found in the system tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrubData {
    /// Tool prefix, `grub2` or `grub`.
    pub name: &'static str,
    /// Module root, e.g. `usr/lib/grub2`.
    pub lib_dir: PathBuf,
}

impl GrubData {
    pub fn lookup(root_dir: &Path) -> Result<Self> {
        for name in ["grub2", "grub"] {
            let lib_dir = root_dir.join("usr/lib").join(name);
            if lib_dir.is_dir() {
                return Ok(Self { name, lib_dir });
            }
        }
        Err(Error::not_found("grub2 data directory", root_dir.join("usr/lib/grub2")))
    }

    pub fn tool(&self, suffix: &str) -> String {
        format!("{}-{}", self.name, suffix)
    }
}

#[derive(Debug)]
pub struct Grub2BootLoaderConfig {
    base: BootLoaderBase,
    terminal: Terminal,
    theme: Option<String>,
    config: Option<(PathBuf, String)>,
}

impl Grub2BootLoaderConfig {
    pub fn new(base: BootLoaderBase) -> Self {
        let terminal = Terminal::from_name(base.settings.console.as_deref());
        let theme = base.settings.theme.clone();
        Self {
            base,
            terminal,
            theme,
            config: None,
        }
    }

    pub fn terminal(&self) -> Terminal {
        self.terminal
    }

    /// Directory holding grub.cfg and the modules in the boot tree.
    fn grub_dir(&self, target: BootTarget) -> PathBuf {
        if target.is_iso() {
            self.base
                .boot_dir
                .join(format!("boot/{}/loader/grub2", self.base.arch()))
        } else {
            self.base.boot_dir.join("boot/grub2")
        }
    }

    fn module_formats(&self) -> Vec<&'static str> {
        let firmware = &self.base.firmware;
        let mut formats = Vec::new();
        if firmware.needs_bios_boot_sector() {
            formats.push("i386-pc");
        }
        if firmware.efi_mode().is_some() {
            formats.push(self.efi_format());
        }
        if firmware.ofw_mode() {
            formats.push("powerpc-ieee1275");
        }
        formats
    }

    fn efi_format(&self) -> &'static str {
        defaults::efi_module_directory_name(self.base.arch()).unwrap_or_else(|| {
            warn!(
                "No EFI module format known for {}, using x86_64-efi",
                self.base.arch()
            );
            "x86_64-efi"
        })
    }

    fn efi_image_name(&self) -> &'static str {
        defaults::efi_image_name(self.base.arch()).unwrap_or("bootx64.efi")
    }

    fn copy_modules(&self, data: &GrubData, grub_dir: &Path) -> Result<()> {
        for format in self.module_formats() {
            let source = data.lib_dir.join(format);
            if !source.is_dir() {
                return Err(Error::not_found(format!("grub2 {} modules", format), source));
            }
            info!("--> copying {} modules", format);
            copy_dir_recursive(&source, &grub_dir.join(format))?;
        }
        Ok(())
    }

    /// Copy the configured theme, or fall back to a console menu.
    fn copy_theme(&mut self, grub_dir: &Path) -> Result<()> {
        let Some(theme) = self.theme.clone() else {
            return Ok(());
        };
        let themes = self.base.root_dir.join("usr/share/grub2/themes");
        let source = themes.join(&theme);
        if !source.is_dir() {
            warn!(
                "Theme {} not found in {}, switching to console terminal",
                theme,
                themes.display()
            );
            self.theme = None;
            self.terminal = Terminal::Console;
            return Ok(());
        }
        copy_dir_recursive(&source, &grub_dir.join("themes").join(&theme))?;
        let font = self.base.root_dir.join("usr/share/grub2/unicode.pf2");
        if font.exists() {
            if let Some(boot_path_dir) = grub_dir.parent() {
                copy_file(&font, &boot_path_dir.join("unicode.pf2"))?;
            }
        }
        Ok(())
    }

    fn search_params(&self, target: BootTarget, params: &BootParams) -> Result<String> {
        if target.is_iso() {
            let mbrid = params
                .mbrid
                .ok_or_else(|| Error::bootloader("disk identifier required for ISO boot"))?;
            Ok(format!("--file --set=root /boot/{}", mbrid.get_id()))
        } else {
            let uuid = params
                .boot_uuid
                .as_deref()
                .ok_or_else(|| Error::bootloader("boot device UUID required for disk boot"))?;
            Ok(format!("--fs-uuid --set=root {}", uuid))
        }
    }

    fn earlyboot(&self, target: BootTarget, params: &BootParams, boot_path: &str) -> Result<String> {
        let mut values = Values::new();
        values.insert("search_params", self.search_params(target, params)?);
        values.insert("bootpath", boot_path.trim_end_matches('/').to_string());
        BootLoaderBase::render(&templates::earlyboot_template(), &values)
    }

    fn setup_efi_image(&self, data: &GrubData, target: BootTarget, params: &BootParams, boot_path: &str) -> Result<()> {
        let efi_path = self.base.create_efi_path(target)?;
        let image = efi_path.join(self.efi_image_name());
        let earlyboot = self.earlyboot(target, params, boot_path)?;

        if self.base.firmware.secure_boot() {
            let signed = self.base.root_dir.join("usr/share/efi").join(self.base.arch());
            let shim = signed.join("shim.efi");
            let grub = signed.join("grub.efi");
            if !shim.exists() {
                return Err(Error::not_found("signed shim loader", shim));
            }
            if !grub.exists() {
                return Err(Error::not_found("signed grub loader", grub));
            }
            info!("--> using signed shim/grub chain for secure boot");
            copy_file(&shim, &image)?;
            copy_file(&grub, &efi_path.join("grub.efi"))?;
            return write_file(&efi_path.join("grub.cfg"), &earlyboot);
        }

        let format = self.efi_format();
        let module_dir = data.lib_dir.join(format);
        if !module_dir.is_dir() {
            return Err(Error::not_found(format!("grub2 {} modules", format), module_dir));
        }
        let earlyboot_file = self.grub_dir(target).join("earlyboot.cfg");
        write_file(&earlyboot_file, &earlyboot)?;

        info!("--> creating EFI image {}", image.display());
        Cmd::new(data.tool("mkimage"))
            .arg("-O")
            .arg(format)
            .arg("-o")
            .arg_path(&image)
            .arg("-c")
            .arg_path(&earlyboot_file)
            .arg("-p")
            .arg(BootLoaderBase::boot_file(boot_path, "grub2"))
            .arg("-d")
            .arg_path(&module_dir)
            .args(defaults::GRUB_EFI_MODULES.iter().copied())
            .error_msg("Failed to create EFI boot image")
            .run()?;
        Ok(())
    }

    fn entry_style(&self) -> EntryStyle {
        match self.base.settings.hypervisor_domain.as_deref() {
            Some("dom0") => EntryStyle::Multiboot,
            Some("domU") => EntryStyle::Plain,
            _ => EntryStyle::Hybrid,
        }
    }
}

impl BootLoaderConfig for Grub2BootLoaderConfig {
    fn setup_boot_images(&mut self, target: BootTarget, params: &BootParams) -> Result<()> {
        info!("Setting up grub2 boot images for {}", target);
        let data = GrubData::lookup(&self.base.root_dir)?;
        let boot_path = self.base.get_boot_path(target)?;
        let grub_dir = self.grub_dir(target);
        fs::create_dir_all(&grub_dir).at_path(&grub_dir)?;

        self.copy_modules(&data, &grub_dir)?;
        self.copy_theme(&grub_dir)?;
        if self.base.firmware.efi_mode().is_some() {
            self.setup_efi_image(&data, target, params, &boot_path)?;
        }
        self.base.advance(BootloaderState::BootImagesWritten)
    }

    fn setup_image_config(&mut self, target: BootTarget, params: &BootParams) -> Result<()> {
        info!("Rendering grub2 config for {}", target);
        let boot_path = self.base.get_boot_path(target)?;
        let style = self.entry_style();
        let failsafe = self.base.failsafe_requested();
        let theme = self.theme.is_some() && self.terminal == Terminal::Gfxterm;

        let template = match target {
            BootTarget::Disk => templates::disk_template(style, failsafe, self.terminal, theme),
            BootTarget::LiveIso => templates::live_template(style, failsafe, self.terminal, theme),
            BootTarget::InstallIso => templates::install_template(style, failsafe, self.terminal, theme),
        };

        let mut values = Values::new();
        values.insert("search_params", self.search_params(target, params)?);
        values.insert("default_boot", "0".to_string());
        values.insert("boot_timeout", self.base.timeout().to_string());
        values.insert("gfxmode", self.base.gfxmode());
        values.insert("theme", self.theme.clone().unwrap_or_default());
        values.insert("bootpath", boot_path.trim_end_matches('/').to_string());
        values.insert("title", self.base.title().replace('"', "'"));
        values.insert("kernel_file", params.kernel.clone());
        values.insert("initrd_file", params.initrd.clone());
        values.insert(
            "hypervisor",
            params.hypervisor.clone().unwrap_or_else(|| "xen.gz".to_string()),
        );
        values.insert("boot_options", self.base.get_boot_cmdline(params));
        values.insert("failsafe_boot_options", self.base.get_failsafe_cmdline(params));

        let text = BootLoaderBase::render(&template, &values)?;
        self.base.advance(BootloaderState::ConfigRendered)?;
        self.config = Some((self.grub_dir(target).join("grub.cfg"), text));
        Ok(())
    }

    fn write(&mut self) -> Result<()> {
        let (path, text) = self
            .config
            .as_ref()
            .ok_or_else(|| Error::bootloader("no grub2 configuration rendered"))?;
        info!("Writing grub2 config {}", path.display());
        write_file(path, text)?;
        self.base.advance(BootloaderState::Written)
    }

    fn state(&self) -> BootloaderState {
        self.base.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::config::tests::{base, params};
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    fn grub_root(formats: &[&str]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for format in formats {
            let dir = tmp.path().join("usr/lib/grub2").join(format);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("normal.mod"), "mod").unwrap();
        }
        tmp
    }

    #[test]
    fn test_bios_disk_config() {
        let root = grub_root(&["i386-pc"]);
        let (runner, _guard) = RecordingRunner::install();
        let mut grub = Grub2BootLoaderConfig::new(base("", root.path()));

        grub.setup_disk_boot_images(&params()).unwrap();
        assert!(runner.commands().is_empty());
        assert!(root.path().join("boot/grub2/i386-pc/normal.mod").exists());

        grub.setup_disk_image_config(&params()).unwrap();
        grub.write().unwrap();
        assert_eq!(grub.state(), BootloaderState::Written);

        let text = fs::read_to_string(root.path().join("boot/grub2/grub.cfg")).unwrap();
        assert!(text.contains("search --fs-uuid --set=root 1111-2222\n"));
        assert!(text.contains("$linux ($root)/boot/vmlinuz root=UUID=3333-4444\n"));
        assert!(text.contains("set timeout=10\n"));
    }

    #[test]
    fn test_efi_image_and_boot_partition_prefix() {
        let root = grub_root(&["x86_64-efi"]);
        let (runner, _guard) = RecordingRunner::install();
        let mut grub = Grub2BootLoaderConfig::new(base(
            "firmware = \"efi\"\nefi_csm = false\nboot_partition = true",
            root.path(),
        ));
        grub.setup_disk_boot_images(&params()).unwrap();

        let calls = runner.commands_for("grub2-mkimage");
        assert_eq!(calls.len(), 1);
        let efi = root.path().join("boot/efi/EFI/BOOT/bootx64.efi");
        assert!(calls[0].starts_with(&format!("grub2-mkimage -O x86_64-efi -o {} -c ", efi.display())));
        assert!(calls[0].contains(" -p /grub2 -d "));
        let earlyboot = fs::read_to_string(root.path().join("boot/grub2/earlyboot.cfg")).unwrap();
        assert!(earlyboot.contains("set prefix=($root)/grub2\n"));
    }

    #[test]
    fn test_secure_boot_requires_signed_loaders() {
        let root = grub_root(&["x86_64-efi"]);
        let (_runner, _guard) = RecordingRunner::install();
        let mut grub = Grub2BootLoaderConfig::new(base("firmware = \"uefi\"\nefi_csm = false", root.path()));
        assert!(matches!(
            grub.setup_disk_boot_images(&params()),
            Err(Error::ResourceNotFound { .. })
        ));

        let signed = root.path().join("usr/share/efi/x86_64");
        fs::create_dir_all(&signed).unwrap();
        fs::write(signed.join("shim.efi"), "shim").unwrap();
        fs::write(signed.join("grub.efi"), "grub").unwrap();
        grub.setup_disk_boot_images(&params()).unwrap();
        let efi = root.path().join("boot/efi/EFI/BOOT");
        assert_eq!(fs::read_to_string(efi.join("bootx64.efi")).unwrap(), "shim");
        assert_eq!(fs::read_to_string(efi.join("grub.efi")).unwrap(), "grub");
    }

    #[test]
    fn test_missing_theme_falls_back_to_console() {
        let root = grub_root(&["i386-pc"]);
        let (_runner, _guard) = RecordingRunner::install();
        let mut grub = Grub2BootLoaderConfig::new(base(
            "[bootloader_settings]\ntheme = \"starfield\"",
            root.path(),
        ));
        grub.setup_disk_boot_images(&params()).unwrap();
        assert_eq!(grub.terminal(), Terminal::Console);
        grub.setup_disk_image_config(&params()).unwrap();
        grub.write().unwrap();
        let text = fs::read_to_string(root.path().join("boot/grub2/grub.cfg")).unwrap();
        assert!(text.contains("terminal_output console\n"));
        assert!(!text.contains("theme.txt"));
    }

    #[test]
    fn test_iso_search_and_multiboot() {
        let root = grub_root(&["i386-pc"]);
        let (_runner, _guard) = RecordingRunner::install();
        let mut grub = Grub2BootLoaderConfig::new(base(
            "[bootloader_settings]\nhypervisor_domain = \"dom0\"",
            root.path(),
        ));
        grub.setup_install_boot_images(&params()).unwrap();
        grub.setup_install_image_config(&params()).unwrap();
        grub.write().unwrap();
        let text = fs::read_to_string(root.path().join("boot/x86_64/loader/grub2/grub.cfg")).unwrap();
        assert!(text.contains("search --file --set=root /boot/0x0a1b2c3d\n"));
        assert!(text.contains("multiboot /boot/x86_64/loader/xen.gz dummy"));
        assert!(text.contains("cdinst=1"));
    }

    #[test]
    fn test_write_without_config_fails() {
        let root = grub_root(&["i386-pc"]);
        let mut grub = Grub2BootLoaderConfig::new(base("", root.path()));
        assert!(matches!(grub.write(), Err(Error::Bootloader { .. })));
    }

    #[test]
    fn test_missing_grub_data() {
        let root = TempDir::new().unwrap();
        let mut grub = Grub2BootLoaderConfig::new(base("", root.path()));
        assert!(matches!(
            grub.setup_disk_boot_images(&params()),
            Err(Error::ResourceNotFound { .. })
        ));
    }
}
