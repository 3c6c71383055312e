//! isolinux.cfg and boot message fragments for BIOS booted ISOs.

use super::Template;

const HEADER: &str = "\
default ${default_boot}
implicit 1
prompt 1
timeout ${boot_timeout}
display isolinux.msg
";

const UI_GFX: &str = "ui gfxboot bootlogo isolinux.msg\n";
const UI_MENU: &str = "ui menu.c32\n";

const ENTRY_HARDDISK: &str = "\
label harddisk
  localboot 0x80
";

fn entry(label: &str, multiboot: bool, options: &str) -> String {
    if multiboot {
        format!(
            "label {label}\n\
             \x20 kernel mboot.c32\n\
             \x20 append ${{hypervisor}} --- ${{kernel_file}} {options} --- ${{initrd_file}} showopts\n"
        )
    } else {
        format!(
            "label {label}\n\
             \x20 kernel ${{kernel_file}}\n\
             \x20 append initrd=${{initrd_file}} {options} showopts\n"
        )
    }
}

fn header(with_theme: bool) -> Template {
    let mut template = Template::new(HEADER);
    template.push(if with_theme { UI_GFX } else { UI_MENU });
    template
}

/// Live ISO menu. `mediacheck` adds an entry that verifies the medium.
pub fn live_template(multiboot: bool, failsafe: bool, mediacheck: bool, with_theme: bool) -> Template {
    let mut template = header(with_theme);
    template.push(&entry("${title}", multiboot, "${boot_options}"));
    if failsafe {
        template.push(&entry("Failsafe_--_${title}", multiboot, "${failsafe_boot_options}"));
    }
    if mediacheck {
        template.push(&entry("mediacheck", multiboot, "${boot_options} mediacheck=1 plymouth.enable=0"));
    }
    template.push(ENTRY_HARDDISK);
    template
}

/// Install ISO menu, defaulting to the local disk.
pub fn install_template(multiboot: bool, failsafe: bool, with_theme: bool) -> Template {
    let mut template = header(with_theme);
    template.push(ENTRY_HARDDISK);
    template.push(&entry("Install_${title}", multiboot, "cdinst=1 ${boot_options}"));
    if failsafe {
        template.push(&entry(
            "Failsafe_--_Install_${title}",
            multiboot,
            "cdinst=1 ${failsafe_boot_options}",
        ));
    }
    template
}

/// Text shown by `display`.
pub fn message_template(install: bool) -> Template {
    if install {
        Template::new(
            "Welcome to ${title}\n\n\
             Press <Enter> to boot from hard disk.\n\
             Enter Install_${title} to install the image.\n",
        )
    } else {
        Template::new(
            "Welcome to ${title}\n\n\
             Press <Enter> to boot the live system.\n\
             Enter harddisk to boot from the local disk.\n",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::template::Values;

    fn values() -> Values<'static> {
        [
            ("default_boot", "harddisk"),
            ("boot_timeout", "100"),
            ("title", "appliance"),
            ("kernel_file", "linux"),
            ("initrd_file", "initrd"),
            ("hypervisor", "xen.gz"),
            ("boot_options", "quiet"),
            ("failsafe_boot_options", "quiet nomodeset"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect()
    }

    #[test]
    fn test_live_with_mediacheck() {
        let text = live_template(false, true, true, false).substitute(&values()).unwrap();
        assert!(text.contains("ui menu.c32\n"));
        assert!(text.contains("label appliance\n  kernel linux\n  append initrd=initrd quiet showopts\n"));
        assert!(text.contains("label Failsafe_--_appliance\n"));
        assert!(text.contains("mediacheck=1"));
        assert!(text.ends_with("label harddisk\n  localboot 0x80\n"));
    }

    #[test]
    fn test_multiboot_install() {
        let text = install_template(true, false, true).substitute(&values()).unwrap();
        assert!(text.contains("ui gfxboot bootlogo isolinux.msg\n"));
        assert!(text.contains("  kernel mboot.c32\n  append xen.gz --- linux cdinst=1 quiet --- initrd showopts\n"));
        assert!(text.find("label harddisk").unwrap() < text.find("Install_appliance").unwrap());
    }

    #[test]
    fn test_message() {
        let text = message_template(true).substitute(&values()).unwrap();
        assert!(text.starts_with("Welcome to appliance\n"));
        assert!(text.contains("Install_appliance"));
    }
}
