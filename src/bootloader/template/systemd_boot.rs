//! loader.conf and entry fragments for systemd-boot.

use super::Template;

pub fn loader_template() -> Template {
    Template::new("timeout ${boot_timeout}\ndefault ${default_entry}\n")
}

pub fn entry_template() -> Template {
    Template::new(
        "title ${title}\n\
         linux ${kernel_file}\n\
         initrd ${initrd_file}\n\
         options ${boot_options}\n",
    )
}
