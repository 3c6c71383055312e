//! Partition table backends: msdos (sfdisk), gpt (sgdisk), dasd (fdasd).

use crate::config::PartitionTableType;
use crate::error::{Error, Result};
use crate::process::Cmd;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSize {
    Mbytes(u64),
    /// Everything up to the end of the disk.
    AllFree,
}

impl std::fmt::Display for PartitionSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionSize::Mbytes(n) => write!(f, "{}MB", n),
            PartitionSize::AllFree => f.write_str("all_free"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    Linux,
    Lvm,
    Raid,
    Efi,
    /// BIOS boot partition next to EFI.
    Csm,
    Prep,
    Swap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionFlag {
    Active,
}

/// One created partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRecord {
    pub number: u32,
    pub name: String,
    pub size: PartitionSize,
    pub partition_type: PartitionType,
}

/// Operations every partition table backend supports.
pub trait Partitioner {
    fn table_type(&self) -> PartitionTableType;

    /// Append a partition after the last one.
    fn create(&mut self, name: &str, size: PartitionSize, partition_type: PartitionType) -> Result<u32>;

    fn set_flag(&mut self, number: u32, flag: PartitionFlag) -> Result<()>;

    /// Embed up to three GPT partitions in a protective MBR.
    fn set_hybrid_mbr(&mut self) -> Result<()> {
        warn!("hybrid MBR ignored on {:?} table", self.table_type());
        Ok(())
    }

    /// Convert the table to plain MBR.
    fn set_mbr(&mut self) -> Result<()> {
        warn!("MBR conversion ignored on {:?} table", self.table_type());
        Ok(())
    }

    fn resize_table(&mut self, _entries: u32) -> Result<()> {
        Ok(())
    }

    /// Remove any existing table.
    fn wipe(&mut self) -> Result<()>;

    /// Number of the last created partition.
    fn get_id(&self) -> u32;

    /// Partitions in creation order.
    fn records(&self) -> &[PartitionRecord];
}

/// Backend for the given table type.
pub fn new_partitioner(table: PartitionTableType, device: &str) -> Box<dyn Partitioner> {
    match table {
        PartitionTableType::Msdos => Box::new(MsDosPartitioner::new(device)),
        PartitionTableType::Gpt => Box::new(GptPartitioner::new(device)),
        PartitionTableType::Dasd => Box::new(DasdPartitioner::new(device)),
    }
}

fn partitioner_error(device: &str, detail: impl std::fmt::Display) -> Error {
    Error::Partitioner {
        message: format!("{}: {}", device, detail),
    }
}

#[derive(Debug)]
pub struct MsDosPartitioner {
    device: String,
    records: Vec<PartitionRecord>,
}

impl MsDosPartitioner {
    const MAX_PRIMARY: u32 = 4;

    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            records: Vec::new(),
        }
    }

    fn type_code(partition_type: PartitionType) -> Option<&'static str> {
        match partition_type {
            PartitionType::Linux => Some("83"),
            PartitionType::Lvm => Some("8e"),
            PartitionType::Raid => Some("fd"),
            PartitionType::Prep => Some("41"),
            PartitionType::Swap => Some("82"),
            PartitionType::Efi | PartitionType::Csm => None,
        }
    }
}

impl Partitioner for MsDosPartitioner {
    fn table_type(&self) -> PartitionTableType {
        PartitionTableType::Msdos
    }

    fn create(&mut self, name: &str, size: PartitionSize, partition_type: PartitionType) -> Result<u32> {
        let number = self.get_id() + 1;
        if number > Self::MAX_PRIMARY {
            return Err(partitioner_error(
                &self.device,
                format!("msdos table supports {} partitions, '{}' would be #{}", Self::MAX_PRIMARY, name, number),
            ));
        }
        let code = Self::type_code(partition_type).unwrap_or_else(|| {
            warn!("partition type {:?} ignored on msdos", partition_type);
            "83"
        });
        let script = match size {
            PartitionSize::Mbytes(n) => format!(",+{}M,{}\n", n, code),
            PartitionSize::AllFree => format!(",,{}\n", code),
        };
        debug!("{}: sfdisk #{} {}", name, number, size);
        Cmd::new("sfdisk")
            .arg("--append")
            .arg(&self.device)
            .stdin(script)
            .error_msg(format!("Failed to create partition {}", name))
            .run()?;
        self.records.push(PartitionRecord {
            number,
            name: name.to_string(),
            size,
            partition_type,
        });
        Ok(number)
    }

    fn set_flag(&mut self, number: u32, flag: PartitionFlag) -> Result<()> {
        match flag {
            PartitionFlag::Active => {
                Cmd::new("sfdisk")
                    .arg("--activate")
                    .arg(&self.device)
                    .arg(number.to_string())
                    .error_msg("Failed to set active flag")
                    .run()?;
            }
        }
        Ok(())
    }

    fn wipe(&mut self) -> Result<()> {
        Cmd::new("sgdisk")
            .arg("--zap-all")
            .arg(&self.device)
            .error_msg("Failed to wipe partition table")
            .run()?;
        Cmd::new("sfdisk")
            .arg(&self.device)
            .stdin("label: dos\n")
            .error_msg("Failed to create msdos label")
            .run()?;
        self.records.clear();
        Ok(())
    }

    fn get_id(&self) -> u32 {
        self.records.last().map_or(0, |r| r.number)
    }

    fn records(&self) -> &[PartitionRecord] {
        &self.records
    }
}

#[derive(Debug)]
pub struct GptPartitioner {
    device: String,
    records: Vec<PartitionRecord>,
}

impl GptPartitioner {
    const HYBRID_MAX: u32 = 3;

    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            records: Vec::new(),
        }
    }

    fn type_code(partition_type: PartitionType) -> &'static str {
        match partition_type {
            PartitionType::Csm => "EF02",
            PartitionType::Efi => "EF00",
            PartitionType::Linux => "8300",
            PartitionType::Lvm => "8E00",
            PartitionType::Raid => "FD00",
            PartitionType::Prep => "4100",
            PartitionType::Swap => "8200",
        }
    }

    fn id_list(count: u32) -> String {
        (1..=count)
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl Partitioner for GptPartitioner {
    fn table_type(&self) -> PartitionTableType {
        PartitionTableType::Gpt
    }

    fn create(&mut self, name: &str, size: PartitionSize, partition_type: PartitionType) -> Result<u32> {
        let number = self.get_id() + 1;
        let end = match size {
            PartitionSize::Mbytes(n) => format!("+{}M", n),
            PartitionSize::AllFree => "0".to_string(),
        };
        Cmd::new("sgdisk")
            .arg("-n")
            .arg(format!("{}:0:{}", number, end))
            .arg("-c")
            .arg(format!("{}:{}", number, name))
            .arg(&self.device)
            .error_msg(format!("Failed to create partition {}", name))
            .run()?;
        Cmd::new("sgdisk")
            .arg("-t")
            .arg(format!("{}:{}", number, Self::type_code(partition_type)))
            .arg(&self.device)
            .error_msg(format!("Failed to set type of partition {}", name))
            .run()?;
        self.records.push(PartitionRecord {
            number,
            name: name.to_string(),
            size,
            partition_type,
        });
        Ok(number)
    }

    fn set_flag(&mut self, _number: u32, flag: PartitionFlag) -> Result<()> {
        warn!("flag {:?} ignored on GPT", flag);
        Ok(())
    }

    fn set_hybrid_mbr(&mut self) -> Result<()> {
        let count = self.get_id().min(Self::HYBRID_MAX);
        if count == 0 {
            return Err(partitioner_error(&self.device, "no partitions to embed in hybrid MBR"));
        }
        Cmd::new("sgdisk")
            .arg("-h")
            .arg(Self::id_list(count))
            .arg(&self.device)
            .error_msg("Failed to create hybrid MBR")
            .run()?;
        Ok(())
    }

    fn set_mbr(&mut self) -> Result<()> {
        let efi = self
            .records
            .iter()
            .find(|r| r.partition_type == PartitionType::Efi)
            .map(|r| r.number);
        Cmd::new("sgdisk")
            .arg("-m")
            .arg(Self::id_list(self.get_id()))
            .arg(&self.device)
            .error_msg("Failed to convert table to MBR")
            .run()?;
        if let Some(number) = efi {
            Cmd::new("sfdisk")
                .arg("--part-type")
                .arg(&self.device)
                .arg(number.to_string())
                .arg("83")
                .error_msg("Failed to reset EFI partition type")
                .run()?;
        }
        Ok(())
    }

    fn resize_table(&mut self, entries: u32) -> Result<()> {
        Cmd::new("sgdisk")
            .arg("--resize-table")
            .arg(entries.to_string())
            .arg(&self.device)
            .error_msg("Failed to resize partition table")
            .run()?;
        Ok(())
    }

    fn wipe(&mut self) -> Result<()> {
        Cmd::new("sgdisk")
            .arg("--zap-all")
            .arg(&self.device)
            .error_msg("Failed to wipe partition table")
            .run()?;
        self.records.clear();
        Ok(())
    }

    fn get_id(&self) -> u32 {
        self.records.last().map_or(0, |r| r.number)
    }

    fn records(&self) -> &[PartitionRecord] {
        &self.records
    }
}

#[derive(Debug)]
pub struct DasdPartitioner {
    device: String,
    records: Vec<PartitionRecord>,
}

impl DasdPartitioner {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            records: Vec::new(),
        }
    }
}

impl Partitioner for DasdPartitioner {
    fn table_type(&self) -> PartitionTableType {
        PartitionTableType::Dasd
    }

    fn create(&mut self, name: &str, size: PartitionSize, partition_type: PartitionType) -> Result<u32> {
        let number = self.get_id() + 1;
        let script = match size {
            PartitionSize::Mbytes(n) => format!("n\np\n\n+{}M\nw\nq\n", n),
            PartitionSize::AllFree => "n\np\n\n\nw\nq\n".to_string(),
        };
        debug!("{}: fdasd #{} {}", name, number, size);
        Cmd::new("fdasd")
            .arg("-f")
            .arg(&self.device)
            .stdin(script)
            .error_msg(format!("Failed to create partition {}", name))
            .run()?;
        self.records.push(PartitionRecord {
            number,
            name: name.to_string(),
            size,
            partition_type,
        });
        Ok(number)
    }

    fn set_flag(&mut self, _number: u32, _flag: PartitionFlag) -> Result<()> {
        Ok(())
    }

    fn wipe(&mut self) -> Result<()> {
        // a fresh VTOC replaces every partition
        Cmd::new("fdasd")
            .args(["-f", "-a"])
            .arg(&self.device)
            .error_msg("Failed to write new VTOC")
            .run()?;
        Cmd::new("fdasd")
            .args(["-f"])
            .arg(&self.device)
            .stdin("d\n1\nw\nq\n")
            .error_msg("Failed to clear VTOC")
            .run()?;
        self.records.clear();
        Ok(())
    }

    fn get_id(&self) -> u32 {
        self.records.last().map_or(0, |r| r.number)
    }

    fn records(&self) -> &[PartitionRecord] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;

    #[test]
    fn test_msdos_sfdisk_scripts() {
        let (runner, _guard) = RecordingRunner::install();
        let mut p = MsDosPartitioner::new("/dev/loop0");
        assert_eq!(p.create("p.lxboot", PartitionSize::Mbytes(300), PartitionType::Linux).unwrap(), 1);
        assert_eq!(p.create("p.lxroot", PartitionSize::AllFree, PartitionType::Lvm).unwrap(), 2);
        p.set_flag(1, PartitionFlag::Active).unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0].stdin.as_deref(), Some(",+300M,83\n"));
        assert_eq!(calls[1].stdin.as_deref(), Some(",,8e\n"));
        assert_eq!(calls[2].command_line(), "sfdisk --activate /dev/loop0 1");
    }

    #[test]
    fn test_msdos_rejects_fifth_partition() {
        let (_runner, _guard) = RecordingRunner::install();
        let mut p = MsDosPartitioner::new("/dev/loop0");
        for i in 0..4 {
            p.create(&format!("p{}", i), PartitionSize::Mbytes(1), PartitionType::Linux).unwrap();
        }
        assert!(matches!(
            p.create("p5", PartitionSize::AllFree, PartitionType::Linux),
            Err(Error::Partitioner { .. })
        ));
    }

    #[test]
    fn test_gpt_create_and_type() {
        let (runner, _guard) = RecordingRunner::install();
        let mut p = GptPartitioner::new("/dev/loop0");
        p.create("p.UEFI", PartitionSize::Mbytes(20), PartitionType::Efi).unwrap();
        p.create("p.lxroot", PartitionSize::AllFree, PartitionType::Linux).unwrap();
        assert_eq!(
            runner.commands(),
            vec![
                "sgdisk -n 1:0:+20M -c 1:p.UEFI /dev/loop0",
                "sgdisk -t 1:EF00 /dev/loop0",
                "sgdisk -n 2:0:0 -c 2:p.lxroot /dev/loop0",
                "sgdisk -t 2:8300 /dev/loop0",
            ]
        );
    }

    #[test]
    fn test_gpt_hybrid_caps_at_three() {
        let (runner, _guard) = RecordingRunner::install();
        let mut p = GptPartitioner::new("/dev/loop0");
        for i in 0..5 {
            p.create(&format!("p{}", i), PartitionSize::Mbytes(1), PartitionType::Linux).unwrap();
        }
        p.set_hybrid_mbr().unwrap();
        assert_eq!(runner.commands().last().unwrap(), "sgdisk -h 1:2:3 /dev/loop0");
    }

    #[test]
    fn test_gpt_mbr_resets_efi_type() {
        let (runner, _guard) = RecordingRunner::install();
        let mut p = GptPartitioner::new("/dev/loop0");
        p.create("p.legacy", PartitionSize::Mbytes(2), PartitionType::Csm).unwrap();
        p.create("p.UEFI", PartitionSize::Mbytes(20), PartitionType::Efi).unwrap();
        p.set_mbr().unwrap();
        let cmds = runner.commands();
        assert_eq!(cmds[cmds.len() - 2], "sgdisk -m 1:2 /dev/loop0");
        assert_eq!(cmds[cmds.len() - 1], "sfdisk --part-type /dev/loop0 2 83");
    }

    #[test]
    fn test_dasd_script_and_noop_flags() {
        let (runner, _guard) = RecordingRunner::install();
        let mut p = DasdPartitioner::new("/dev/dasda");
        p.create("p.lxroot", PartitionSize::Mbytes(100), PartitionType::Linux).unwrap();
        p.set_flag(1, PartitionFlag::Active).unwrap();
        p.resize_table(128).unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].stdin.as_deref(), Some("n\np\n\n+100M\nw\nq\n"));
    }

    #[test]
    fn test_partition_failure_is_fatal() {
        let (runner, _guard) = RecordingRunner::install();
        runner.fail_when("sgdisk", "-n");
        let mut p = GptPartitioner::new("/dev/loop0");
        assert!(p.create("p.lxroot", PartitionSize::AllFree, PartitionType::Linux).is_err());
        assert_eq!(p.get_id(), 0);
    }
}
