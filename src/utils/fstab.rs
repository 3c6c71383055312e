//! fstab generation.

use crate::error::{Error, IoContext, Result};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    /// `UUID=...`, `LABEL=...`, `PARTUUID=...` or a device path.
    pub device_spec: String,
    pub mountpoint: String,
    pub fstype: String,
    pub options: Vec<String>,
    pub dump: u8,
    pub pass: u8,
}

impl FstabEntry {
    pub fn new(device_spec: &str, mountpoint: &str, fstype: &str, options: &[&str], pass: u8) -> Self {
        let options = if options.is_empty() {
            vec!["defaults".to_string()]
        } else {
            options.iter().map(|o| o.to_string()).collect()
        };
        Self {
            device_spec: device_spec.to_string(),
            mountpoint: mountpoint.to_string(),
            fstype: fstype.to_string(),
            options,
            dump: 0,
            pass,
        }
    }

    /// Parse one whitespace separated fstab line.
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(Error::config(format!("malformed fstab line '{}'", line)));
        }
        let number = |idx: usize| -> Result<u8> {
            fields
                .get(idx)
                .map(|v| {
                    v.parse::<u8>()
                        .map_err(|_| Error::config(format!("malformed fstab line '{}'", line)))
                })
                .unwrap_or(Ok(0))
        };
        Ok(Self {
            device_spec: fields[0].to_string(),
            mountpoint: fields[1].to_string(),
            fstype: fields[2].to_string(),
            options: fields[3].split(',').map(str::to_string).collect(),
            dump: number(4)?,
            pass: number(5)?,
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.device_spec,
            self.mountpoint,
            self.fstype,
            self.options.join(","),
            self.dump,
            self.pass
        )
    }

    fn depth(&self) -> usize {
        if self.mountpoint == "/" {
            0
        } else {
            self.mountpoint.split('/').filter(|c| !c.is_empty()).count()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fstab {
    entries: Vec<FstabEntry>,
}

impl Fstab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: FstabEntry) {
        self.entries.push(entry);
    }

    pub fn add_line(&mut self, line: &str) -> Result<()> {
        self.add(FstabEntry::parse(line)?);
        Ok(())
    }

    pub fn entries(&self) -> &[FstabEntry] {
        &self.entries
    }

    /// Entries with the root first, then parents before children.
    pub fn canonical_entries(&self) -> Vec<&FstabEntry> {
        let mut sorted: Vec<&FstabEntry> = self.entries.iter().collect();
        sorted.sort_by_key(|e| e.depth());
        sorted
    }

    /// Write the table. Lines from a sibling `fstab.append` file follow the
    /// generated entries and the append file is consumed.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut text = String::new();
        for entry in self.canonical_entries() {
            text.push_str(&entry.to_line());
            text.push('\n');
        }

        let append = path.with_file_name("fstab.append");
        if append.exists() {
            let extra = fs::read_to_string(&append).at_path(&append)?;
            for line in extra.lines().filter(|l| !l.trim().is_empty()) {
                text.push_str(line);
                text.push('\n');
            }
            fs::remove_file(&append).at_path(&append)?;
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).at_path(parent)?;
        }
        fs::write(path, text).at_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_root_first_then_depth() {
        let mut fstab = Fstab::new();
        fstab.add(FstabEntry::new("UUID=e", "/boot/efi", "vfat", &[], 0));
        fstab.add(FstabEntry::new("UUID=b", "/boot", "ext3", &[], 0));
        fstab.add(FstabEntry::new("UUID=r", "/", "ext4", &[], 1));
        let order: Vec<_> = fstab
            .canonical_entries()
            .iter()
            .map(|e| e.mountpoint.clone())
            .collect();
        assert_eq!(order, vec!["/", "/boot", "/boot/efi"]);
    }

    #[test]
    fn test_parse_roundtrip_line() {
        let line = "UUID=abc / btrfs ro,subvol=@ 0 0";
        assert_eq!(FstabEntry::parse(line).unwrap().to_line(), line);
        assert!(FstabEntry::parse("UUID=abc /").is_err());
    }

    #[test]
    fn test_write_appends_extras() {
        let tmp = TempDir::new().unwrap();
        let etc = tmp.path().join("etc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(etc.join("fstab.append"), "tmpfs /tmp tmpfs defaults 0 0\n").unwrap();

        let mut fstab = Fstab::new();
        fstab.add(FstabEntry::new("LABEL=ROOT", "/", "ext4", &[], 1));
        fstab.write(&etc.join("fstab")).unwrap();

        assert_eq!(
            fs::read_to_string(etc.join("fstab")).unwrap(),
            "LABEL=ROOT / ext4 defaults 0 1\ntmpfs /tmp tmpfs defaults 0 0\n"
        );
        assert!(!etc.join("fstab.append").exists());
    }
}
