//! zipl config and BLS entry fragments for s390.

use super::Template;

const CONFIG_HEADER: &str = "\
[defaultboot]
defaultmenu = menu

:menu
    default = 1
    prompt = 1
    target = ${target_directory}
    timeout = ${boot_timeout}
";

const TARGET_GEOMETRY: &str = "\
    targetbase = ${targetbase}
    targettype = ${targettype}
    targetblocksize = ${targetblocksize}
    targetoffset = ${targetoffset}
";

const TARGET_CYLINDERS: &str = "    targetgeometry = ${targetgeometry}\n";

const BLS_ENTRY: &str = "\
title ${title}
version ${kernel_version}
linux ${kernel_file}
initrd ${initrd_file}
options ${boot_options}
";

const BLS_ENTRY_SECURE: &str = "\
title ${title}
version ${kernel_version}
linux ${secure_image_file}
options ${boot_options}
";

/// `boot/zipl/config`. The geometry line only applies to DASD and
/// FBA targets that report cylinders.
pub fn config_template(with_geometry: bool) -> Template {
    let mut template = Template::new(CONFIG_HEADER);
    template.push(TARGET_GEOMETRY);
    if with_geometry {
        template.push(TARGET_CYLINDERS);
    }
    template
}

/// One BLS entry. The secure variant points at the signed composite image.
pub fn entry_template(secure: bool) -> Template {
    Template::new(if secure { BLS_ENTRY_SECURE } else { BLS_ENTRY })
}
