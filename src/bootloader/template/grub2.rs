//! grub.cfg fragments.

use super::Template;

/// Output terminal of the boot menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Gfxterm,
    Serial,
    Console,
}

impl Terminal {
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("serial") => Terminal::Serial,
            Some("console") => Terminal::Console,
            _ => Terminal::Gfxterm,
        }
    }
}

/// Menu entry flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStyle {
    /// `linux`/`linuxefi` picked at boot time.
    Hybrid,
    /// Hypervisor loaded via multiboot, kernel and initrd as modules.
    Multiboot,
    Plain,
}

const HEADER: &str = "\
# generated one time grub2 config file
search ${search_params}
set default=${default_boot}
set timeout=${boot_timeout}
";

const HEADER_HYBRID: &str = "\
set linux=linux
set initrd=initrd
if [ \"$${grub_cpu}\" = \"x86_64\" -o \"$${grub_cpu}\" = \"i386\" ]; then
    if [ \"$${grub_platform}\" = \"efi\" ]; then
        set linux=linuxefi
        set initrd=initrdefi
    fi
fi
";

const HEADER_GFXTERM: &str = "\
set gfxmode=${gfxmode}
insmod all_video
insmod gfxterm
terminal_output gfxterm
";

const HEADER_SERIAL: &str = "\
serial --speed=9600 --unit=0 --word=8 --parity=no --stop=1
terminal_input serial
terminal_output serial
";

const HEADER_CONSOLE: &str = "terminal_output console\n";

const HEADER_THEME: &str = "\
set font=($$root)${bootpath}/unicode.pf2
if loadfont ($$root)${bootpath}/grub2/themes/${theme}/ascii.pf2; then
    set theme=($$root)${bootpath}/grub2/themes/${theme}/theme.txt
fi
";

const ENTRY_CONSOLE_SWITCH: &str = "\
if [ \"$${grub_platform}\" = \"efi\" ]; then
    hiddenentry \"Text mode\" --hotkey \"t\" {
        set textmode=true
        terminal_output console
    }
fi
";

const ENTRY_HARDDISK: &str = "\
menuentry \"Boot from Hard Disk\" --class os --unrestricted {
    search --set=root --label EFI
    chainloader ($${root})/EFI/BOOT/bootx64.efi
}
";

/// One menu entry. `prefix` goes before the title, `extra` before the
/// boot options.
fn menu_entry(style: EntryStyle, prefix: &str, extra: &str, options: &str) -> String {
    let title = format!("{}${{title}}", prefix);
    match style {
        EntryStyle::Multiboot => format!(
            "menuentry \"{title}\" --class os --unrestricted {{\n\
             \x20   echo Loading hypervisor...\n\
             \x20   multiboot ${{bootpath}}/${{hypervisor}} dummy\n\
             \x20   echo Loading kernel...\n\
             \x20   set gfxpayload=keep\n\
             \x20   module ${{bootpath}}/${{kernel_file}} dummy {extra}${{{options}}}\n\
             \x20   echo Loading initrd...\n\
             \x20   module ${{bootpath}}/${{initrd_file}} dummy\n\
             }}\n"
        ),
        EntryStyle::Hybrid | EntryStyle::Plain => {
            let (linux, initrd) = if style == EntryStyle::Hybrid {
                ("$$linux", "$$initrd")
            } else {
                ("linux", "initrd")
            };
            format!(
                "menuentry \"{title}\" --class os --unrestricted {{\n\
                 \x20   echo Loading kernel...\n\
                 \x20   set gfxpayload=keep\n\
                 \x20   {linux} ($$root)${{bootpath}}/${{kernel_file}} {extra}${{{options}}}\n\
                 \x20   echo Loading initrd...\n\
                 \x20   {initrd} ($$root)${{bootpath}}/${{initrd_file}}\n\
                 }}\n"
            )
        }
    }
}

fn header(style: EntryStyle, terminal: Terminal, theme: bool) -> Template {
    let mut template = Template::new(HEADER);
    if style == EntryStyle::Hybrid {
        template.push(HEADER_HYBRID);
    }
    template.push(match terminal {
        Terminal::Gfxterm => HEADER_GFXTERM,
        Terminal::Serial => HEADER_SERIAL,
        Terminal::Console => HEADER_CONSOLE,
    });
    if theme {
        template.push(HEADER_THEME);
    }
    template
}

fn footer(template: &mut Template, terminal: Terminal) {
    if terminal == Terminal::Gfxterm {
        template.push(ENTRY_CONSOLE_SWITCH);
    }
}

/// Template for booting an installed disk.
pub fn disk_template(style: EntryStyle, failsafe: bool, terminal: Terminal, theme: bool) -> Template {
    let mut template = header(style, terminal, theme);
    template.push(&menu_entry(style, "", "", "boot_options"));
    if failsafe {
        template.push(&menu_entry(style, "Failsafe -- ", "", "failsafe_boot_options"));
    }
    footer(&mut template, terminal);
    template
}

/// Template for a live ISO.
pub fn live_template(style: EntryStyle, failsafe: bool, terminal: Terminal, theme: bool) -> Template {
    let mut template = header(style, terminal, theme);
    template.push(&menu_entry(style, "", "", "boot_options"));
    if failsafe {
        template.push(&menu_entry(style, "Failsafe -- ", "", "failsafe_boot_options"));
    }
    template.push(ENTRY_HARDDISK);
    footer(&mut template, terminal);
    template
}

/// Template for install media. Hard disk boot comes first.
pub fn install_template(style: EntryStyle, failsafe: bool, terminal: Terminal, theme: bool) -> Template {
    let mut template = header(style, terminal, theme);
    template.push(ENTRY_HARDDISK);
    template.push(&menu_entry(style, "Install ", "cdinst=1 ", "boot_options"));
    if failsafe {
        template.push(&menu_entry(
            style,
            "Failsafe -- Install ",
            "cdinst=1 ",
            "failsafe_boot_options",
        ));
    }
    footer(&mut template, terminal);
    template
}

/// Early config embedded into the EFI image.
pub fn earlyboot_template() -> Template {
    Template::new(
        "search ${search_params}\n\
         set prefix=($$root)${bootpath}/grub2\n\
         configfile ($$root)${bootpath}/grub2/grub.cfg\n",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::template::Values;

    fn values() -> Values<'static> {
        [
            ("search_params", "--fs-uuid --set=root 1234"),
            ("default_boot", "0"),
            ("boot_timeout", "10"),
            ("gfxmode", "auto"),
            ("theme", "openSUSE"),
            ("bootpath", "/boot"),
            ("title", "appliance"),
            ("kernel_file", "vmlinuz"),
            ("initrd_file", "initrd"),
            ("hypervisor", "xen.gz"),
            ("boot_options", "root=UUID=abcd"),
            ("failsafe_boot_options", "root=UUID=abcd nomodeset"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect()
    }

    #[test]
    fn test_hybrid_disk_entry() {
        let text = disk_template(EntryStyle::Hybrid, true, Terminal::Gfxterm, false)
            .substitute(&values())
            .unwrap();
        assert!(text.starts_with("# generated one time grub2 config file\nsearch --fs-uuid --set=root 1234\n"));
        assert!(text.contains("set linux=linuxefi"));
        assert!(text.contains("    $linux ($root)/boot/vmlinuz root=UUID=abcd\n"));
        assert!(text.contains("menuentry \"Failsafe -- appliance\""));
        assert!(text.contains("hiddenentry \"Text mode\""));
        assert!(!text.contains("theme.txt"));
    }

    #[test]
    fn test_multiboot_install_entry() {
        let text = install_template(EntryStyle::Multiboot, false, Terminal::Serial, true)
            .substitute(&values())
            .unwrap();
        assert!(text.contains("terminal_input serial"));
        assert!(text.contains("multiboot /boot/xen.gz dummy"));
        assert!(text.contains("module /boot/vmlinuz dummy cdinst=1 root=UUID=abcd"));
        assert!(text.contains("themes/openSUSE/theme.txt"));
        let harddisk = text.find("Boot from Hard Disk").unwrap();
        let install = text.find("Install appliance").unwrap();
        assert!(harddisk < install);
        assert!(!text.contains("Failsafe"));
    }

    #[test]
    fn test_plain_console() {
        let text = disk_template(EntryStyle::Plain, false, Terminal::Console, false)
            .substitute(&values())
            .unwrap();
        assert!(text.contains("terminal_output console\n"));
        assert!(text.contains("    linux ($root)/boot/vmlinuz root=UUID=abcd\n"));
        assert!(!text.contains("hiddenentry"));
    }
}
