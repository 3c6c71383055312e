//! Raw disk builder.
//!
//! One build runs these phases against a loop device backed by
//! `<target>/<stem>.raw`:
//!
//! ```text
//! size -> partition -> RAID/LUKS -> mkfs -> metadata -> initrd
//!      -> bootloader config -> sync -> root clones -> umount
//!      -> bootloader install -> teardown
//! ```
//!
//! Every device, mapping and mount the build acquires lives in a
//! [`DiskStack`] and is released in reverse acquisition order, on success
//! and on error alike.

use super::format::{append_unpartitioned_space, convert_disk, disk_format_filename, verify_image_size};
use super::install::InstallImageBuilder;
use super::lock::BuildLock;
use super::result_key;
use crate::boot::{BootImage, BootImageSnapshot, BootNames, DracutBootImage};
use crate::bootloader::{new_bootloader_config, new_bootloader_install, BootParams, InstallDevices};
use crate::config::{BootloaderKind, FilesystemKind, ImageConfiguration, ImageType, VolumeManagerKind};
use crate::defaults;
use crate::error::{Error, IoContext, Result};
use crate::filesystem::{FileSystem, FilesystemArgs};
use crate::firmware::Firmware;
use crate::process::Cmd;
use crate::storage::{
    block_id, require, role, DeviceMap, Disk, DiskSetup, IntegrityDevice, LoopDevice, LuksDevice,
    MappedDevice, PartitionPlan, PartitionTableBuilder, RaidDevice,
};
use crate::system::{BuildResult, SystemIdentifier};
use crate::utils::compress::create_tar_zst;
use crate::utils::fs::{copy_file, write_file};
use crate::utils::verity::VeritySetup;
use crate::utils::{Fstab, FstabEntry};
use crate::volume_manager::btrfs::default_volume_name;
use crate::volume_manager::{new_volume_manager, VolumeManager, VolumeManagerArgs};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// Everything a build holds open.
#[derive(Default)]
struct DiskStack {
    loop_device: Option<LoopDevice>,
    disk: Option<Disk>,
    raid: Option<RaidDevice>,
    integrity: Option<IntegrityDevice>,
    luks: Option<LuksDevice>,
    volume_manager: Option<Box<dyn VolumeManager>>,
    root: Option<FileSystem>,
    boot: Option<FileSystem>,
    efi: Option<FileSystem>,
    spare: Option<FileSystem>,
    custom: Vec<FileSystem>,
}

impl DiskStack {
    /// Unmount every sync mount, false when one stays busy.
    fn umount_filesystems(&mut self) -> bool {
        let mut done = true;
        if let Some(vm) = self.volume_manager.as_mut() {
            done &= vm.umount_volumes();
        }
        for fs in [self.root.as_mut(), self.boot.as_mut(), self.efi.as_mut()]
            .into_iter()
            .flatten()
        {
            done &= fs.umount();
        }
        for fs in self.custom.iter_mut().rev() {
            done &= fs.umount();
        }
        if let Some(spare) = self.spare.as_mut() {
            done &= spare.umount();
        }
        done
    }

    /// Release in reverse acquisition order. Every step runs; the first
    /// failure is returned.
    fn teardown(&mut self) -> Result<()> {
        if !self.umount_filesystems() {
            warn!("Some filesystems are still busy at teardown");
        }
        if let Some(mut vm) = self.volume_manager.take() {
            if !vm.release() {
                warn!("Volume manager still busy at teardown");
            }
        }
        self.root = None;
        self.boot = None;
        self.efi = None;
        self.spare = None;
        self.custom.clear();

        let mut first_error: Option<Error> = None;
        let mut record = |what: &str, result: Result<()>| {
            if let Err(e) = result {
                warn!("Releasing {} failed: {}", what, e);
                first_error.get_or_insert(e);
            }
        };
        if let Some(mut luks) = self.luks.take() {
            record("LUKS container", luks.release());
        }
        if let Some(mut integrity) = self.integrity.take() {
            record("integrity map", integrity.release());
        }
        if let Some(mut raid) = self.raid.take() {
            record("RAID array", raid.release());
        }
        if let Some(mut disk) = self.disk.take() {
            record("partition mappings", disk.release());
        }
        if let Some(mut loop_device) = self.loop_device.take() {
            record("loop device", loop_device.release());
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// What a finished build hands back for verification and registration.
struct BuiltSystem {
    mbrid: SystemIdentifier,
    verity_credentials: Option<PathBuf>,
}

pub struct DiskBuilder {
    config: ImageConfiguration,
    firmware: Firmware,
    root_dir: PathBuf,
    target_dir: PathBuf,
    boot_image: Box<dyn BootImage>,
    diskname: PathBuf,
}

impl DiskBuilder {
    pub fn new(config: ImageConfiguration, root_dir: &Path, target_dir: &Path) -> Result<Self> {
        config.validate()?;
        let firmware = Firmware::new(&config)?;
        let diskname = target_dir.join(format!("{}.raw", config.image_stem()));
        Ok(Self {
            boot_image: Box::new(DracutBootImage::new(root_dir)),
            config,
            firmware,
            root_dir: root_dir.to_path_buf(),
            target_dir: target_dir.to_path_buf(),
            diskname,
        })
    }

    pub fn with_boot_image(mut self, boot_image: Box<dyn BootImage>) -> Self {
        self.boot_image = boot_image;
        self
    }

    pub fn config(&self) -> &ImageConfiguration {
        &self.config
    }

    pub fn firmware(&self) -> &Firmware {
        &self.firmware
    }

    /// `<target>/<stem>.raw`
    pub fn diskname(&self) -> &Path {
        &self.diskname
    }

    fn boot_snapshot_path(&self) -> PathBuf {
        BootImageSnapshot::path_for(&self.target_dir, &self.config.image_stem())
    }

    fn wants_install_media(&self) -> bool {
        self.config.install_iso || self.config.install_stick || self.config.install_pxe
    }

    fn check_preconditions(&self) -> Result<()> {
        if !self.root_dir.is_dir() {
            return Err(Error::not_found("root directory", &self.root_dir));
        }
        if self.wants_install_media() && self.config.image_type != ImageType::Oem {
            return Err(Error::precondition(
                "installation media can only be built for image_type = \"oem\"",
            ));
        }
        if self.config.overlay_root && self.config.volume_manager.is_some() {
            return Err(Error::precondition(
                "overlay_root cannot be combined with a volume manager",
            ));
        }
        Ok(())
    }

    /// Build the raw disk and register it as `disk_image`.
    pub fn create_disk(&mut self) -> Result<BuildResult> {
        self.check_preconditions()?;
        let _lock = BuildLock::acquire(&self.target_dir)?;
        let mut result = BuildResult::new(&self.config.image_name);

        if self.config.recovery || self.config.inplace_recovery {
            self.create_recovery_archive()?;
        }
        if self.boot_image.has_initrd_support() {
            info!("Preparing boot system");
            self.boot_image.prepare()?;
        }

        let mut stack = DiskStack::default();
        let built = self.build_main_system(&mut stack);
        let released = stack.teardown();
        let built = match built {
            Ok(built) => built,
            Err(e) => {
                if let Err(cleanup) = released {
                    warn!("Cleanup after failed build also failed: {}", cleanup);
                }
                return Err(e);
            }
        };
        released?;
        self.verify_disk_identifier(&built.mbrid)?;

        if let Some(bytes) = self.config.unpartitioned_bytes {
            append_unpartitioned_space(&self.diskname, bytes, self.firmware.partition_table_type())?;
        }
        BootImageSnapshot::from_boot_image(&*self.boot_image)?.dump(&self.boot_snapshot_path())?;
        if let Some(limit) = self.config.image_size_limit {
            verify_image_size(limit, &self.diskname)?;
        }

        result.add(result_key::DISK_IMAGE, &self.diskname, true, true, true);
        if let Some(credentials) = built.verity_credentials {
            result.add(result_key::VERITY_CREDENTIALS, credentials, true, false, false);
        }
        Ok(result)
    }

    /// The disk identifier must survive bootloader installation.
    fn verify_disk_identifier(&self, expected: &SystemIdentifier) -> Result<()> {
        let found = SystemIdentifier::read_from_disk(&self.diskname)?;
        if found != *expected {
            return Err(Error::Partitioner {
                message: format!(
                    "disk identifier of {} is {}, expected {}",
                    self.diskname.display(),
                    found.get_id(),
                    expected.get_id()
                ),
            });
        }
        Ok(())
    }

    fn create_recovery_archive(&self) -> Result<()> {
        info!("Creating recovery archive");
        let mut exclude: Vec<String> = defaults::EXCLUDE_LIST.iter().map(|s| s.to_string()).collect();
        exclude.extend(["run", "tmp", "proc", "sys", "dev"].map(String::from));
        exclude.push(defaults::RECOVERY_ARCHIVE_NAME.to_string());
        let archive = self.root_dir.join(defaults::RECOVERY_ARCHIVE_NAME);
        create_tar_zst(&self.root_dir, &archive, &exclude)
    }

    /// Everything between loop attach and teardown. Acquired resources go
    /// into `stack` as soon as they exist.
    fn build_main_system(&mut self, stack: &mut DiskStack) -> Result<BuiltSystem> {
        let setup = DiskSetup::new(&self.config, &self.firmware, &self.root_dir);
        let exclude = self.root_exclude_list(setup.need_boot_partition());

        let (readonly_image, verity) = if self.config.overlay_root {
            let (image, verity) = self.build_readonly_root(&exclude)?;
            (Some(image), verity)
        } else {
            (None, None)
        };
        let readonly_mbytes = match &readonly_image {
            Some(image) => {
                let bytes = fs::metadata(image.path()).at_path(image.path())?.len();
                Some(bytes / 1_048_576 + defaults::MIN_PARTITION_SLACK_MBYTES)
            }
            None => None,
        };

        let disk_mbytes = setup.get_disksize_mbytes()?;
        let root_clone_mbytes = (self.config.root_clone_count > 0)
            .then(|| setup.root_clone_mbytes(disk_mbytes, self.fixed_partitions_mbytes(&setup, readonly_mbytes)));

        info!("Creating raw disk image {}", self.diskname.display());
        let mut loop_device = LoopDevice::new(&self.diskname, Some(disk_mbytes), self.config.target_blocksize);
        loop_device.create(true)?;
        let disk_node = MappedDevice::from_handle(&loop_device);
        stack.loop_device = Some(loop_device);

        let table = PartitionTableBuilder::new(&self.config, &self.firmware, &setup);
        let disk = stack
            .disk
            .insert(Disk::new(self.firmware.partition_table_type(), &disk_node));
        let mut device_map = table.build(disk, &PartitionPlan {
            readonly_mbytes,
            root_clone_mbytes,
        })?;
        let mut partition_ids = disk.get_public_partition_id_map();

        self.wrap_root(stack, &mut device_map, &mut partition_ids)?;
        self.create_filesystems(stack, &mut device_map)?;

        let mbrid = SystemIdentifier::calculate();
        self.write_metadata(stack, &device_map, &partition_ids, &mbrid)?;

        if self.boot_image.has_initrd_support() {
            info!("Creating initrd");
            self.boot_image.create_initrd(Some(&mbrid))?;
        }
        let names = self.boot_image.get_boot_names()?;
        self.copy_first_boot_files(&names)?;

        let params = self.boot_params(&device_map, &disk_node, &mbrid, &names)?;
        self.write_boot_options(&params)?;
        if self.config.bootloader == BootloaderKind::Custom {
            info!("Custom bootloader, skipping bootloader setup");
        } else {
            let mut bootloader = new_bootloader_config(
                self.config.bootloader,
                &self.config,
                &self.firmware,
                &self.root_dir,
                &self.root_dir,
            )?;
            bootloader.setup_disk_boot_images(&params)?;
            bootloader.setup_disk_image_config(&params)?;
            bootloader.write()?;
        }
        mbrid.write_to_disk(Path::new(&disk_node.device))?;

        self.sync_system_data(stack, &device_map, &exclude, readonly_image.as_ref().map(NamedTempFile::path))?;
        let verity_credentials = match &verity {
            Some(verity) => Some(self.store_verity_credentials(verity, &device_map)?),
            None => None,
        };
        self.clone_root(stack, &device_map)?;
        self.embed_integrity_metadata(stack)?;

        if !stack.umount_filesystems() {
            return Err(Error::VolumeSetup {
                message: "filesystems still busy before bootloader install".to_string(),
            });
        }
        self.install_bootloader(&device_map, &disk_node)?;

        if self.config.root_is_readonly_snapshot() {
            if let Some(vm) = stack.volume_manager.as_mut() {
                vm.mount_volumes()?;
                vm.set_property_readonly_root()?;
            }
        }
        Ok(BuiltSystem {
            mbrid,
            verity_credentials,
        })
    }

    /// Paths kept out of the root filesystem sync.
    fn root_exclude_list(&self, has_boot_partition: bool) -> Vec<String> {
        let mut exclude: Vec<String> = defaults::EXCLUDE_LIST
            .iter()
            .chain(defaults::EXCLUDE_CONTENTS)
            .map(|s| s.to_string())
            .collect();
        if has_boot_partition {
            exclude.push(self.boot_source_relative().to_string() + "/*");
        }
        if self.firmware.efi_mode().is_some() {
            exclude.push("boot/efi/*".to_string());
        }
        if let Some(mountpoint) = self.config.spare.as_ref().and_then(|s| s.mountpoint.as_deref()) {
            exclude.push(format!("{}/*", mountpoint.trim_matches('/')));
        }
        for part in self.config.partitions.values() {
            if let Some(mountpoint) = &part.mountpoint {
                exclude.push(format!("{}/*", mountpoint.trim_matches('/')));
            }
        }
        exclude
    }

    /// Tree holding the boot partition contents, relative to the root.
    fn boot_source_relative(&self) -> &'static str {
        if self.config.bootloader == BootloaderKind::Zipl {
            "boot/zipl"
        } else {
            "boot"
        }
    }

    /// Space taken by everything except root and its clones.
    fn fixed_partitions_mbytes(&self, setup: &DiskSetup, readonly_mbytes: Option<u64>) -> u64 {
        let mut used = self.firmware.legacy_bios_partition_mbytes()
            + self.firmware.efi_partition_mbytes()
            + self.firmware.prep_partition_mbytes()
            + setup.boot_partitions_mbytes();
        if self.config.volume_manager != Some(VolumeManagerKind::Lvm) {
            used += self.config.swap_mbytes.unwrap_or(0);
        }
        used += self.config.partitions.values().map(|p| p.mbytes).sum::<u64>();
        used += self.config.spare.as_ref().map_or(0, |s| s.mbytes);
        used + readonly_mbytes.unwrap_or(0)
    }

    /// Squashfs of the root tree for an overlay root, with a verity hash
    /// tree appended when configured.
    fn build_readonly_root(&self, exclude: &[String]) -> Result<(NamedTempFile, Option<VeritySetup>)> {
        info!("Creating read-only root image");
        let image = NamedTempFile::new_in(&self.target_dir).at_path(&self.target_dir)?;
        let squashfs = FileSystem::new(
            FilesystemKind::Squashfs,
            None,
            &self.root_dir,
            FilesystemArgs {
                compression: Some(self.config.squashfs_compression().to_string()),
                ..Default::default()
            },
        );
        squashfs.create_on_file(image.path(), None, exclude, None)?;
        let verity = match self.config.verity_blocks {
            Some(blocks) => {
                let mut verity = VeritySetup::new(image.path(), blocks.count())?;
                verity.format()?;
                Some(verity)
            }
            None => None,
        };
        Ok((image, verity))
    }

    /// `<stem>.verity` next to the disk, bound to the read-only partition.
    fn store_verity_credentials(&self, verity: &VeritySetup, device_map: &DeviceMap) -> Result<PathBuf> {
        let readonly = require(device_map, role::READONLY)?;
        let partuuid = block_id(&readonly.device, "PARTUUID")?;
        let path = self
            .target_dir
            .join(format!("{}.verity", self.config.image_stem()));
        verity.store_credentials(&path, &partuuid)?;
        Ok(path)
    }

    fn embed_integrity_metadata(&self, stack: &mut DiskStack) -> Result<()> {
        if !self.embeds_integrity_metadata() {
            return Ok(());
        }
        let Some(integrity) = stack.integrity.as_mut() else {
            return Ok(());
        };
        let signing_key = self
            .config
            .signing_key_file
            .as_deref()
            .ok_or_else(|| Error::precondition("embedded integrity metadata needs a signing key"))?;
        info!("--> creating integrity metadata");
        integrity.create_integrity_metadata()?;
        info!("--> signing integrity metadata");
        integrity.sign_integrity_metadata(signing_key)?;
        integrity.write_integrity_metadata()
    }

    fn wrap_root(
        &self,
        stack: &mut DiskStack,
        device_map: &mut DeviceMap,
        partition_ids: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        if let Some(level) = self.config.raid {
            let partition = require(device_map, role::ROOT)?.clone();
            let raid = stack.raid.insert(RaidDevice::new(&partition));
            raid.create_degraded_raid(level)?;
            let array = MappedDevice::from_handle(&*raid);
            partition_ids.insert("RAID_DEV".to_string(), array.device.clone());
            device_map.insert(role::ROOT_PARTITION.to_string(), partition);
            device_map.insert(role::ROOT.to_string(), array);
        }
        if let Some(integrity_config) = &self.config.integrity {
            let backing = require(device_map, role::ROOT)?.clone();
            let integrity = stack
                .integrity
                .insert(IntegrityDevice::new(&backing, integrity_config));
            integrity.create_dm_integrity()?;
            let mapped = MappedDevice::from_handle(&*integrity);
            device_map
                .entry(role::ROOT_PARTITION.to_string())
                .or_insert(backing);
            device_map.insert(role::ROOT.to_string(), mapped);
        }
        if let Some(luks_config) = &self.config.luks {
            let backing = require(device_map, role::ROOT)?.clone();
            let keyfile = luks_config.keyfile.as_ref().map(|name| self.root_dir.join(name.trim_start_matches('/')));
            let luks = stack.luks.insert(LuksDevice::new(&backing));
            luks.create_crypto_luks(
                &luks_config.passphrase,
                luks_config.os.as_deref(),
                luks_config.randomize,
                keyfile.as_deref(),
            )?;
            let mapped = MappedDevice::from_handle(&*luks);
            device_map
                .entry(role::ROOT_PARTITION.to_string())
                .or_insert(backing);
            device_map.insert(role::ROOT.to_string(), mapped);
        }
        Ok(())
    }

    fn embeds_integrity_metadata(&self) -> bool {
        self.config.integrity.as_ref().is_some_and(|i| i.embed_metadata)
    }

    fn root_filesystem_args(&self) -> FilesystemArgs {
        let create_options = if self.embeds_integrity_metadata() {
            vec!["-b".to_string(), ROOT_BLOCK_SIZE.to_string()]
        } else {
            Vec::new()
        };
        FilesystemArgs {
            create_options,
            mount_options: self.mount_options(),
            ..Default::default()
        }
    }

    /// Root filesystem size in blocks, leaving room for the metadata block
    /// at the end of the device.
    fn root_size_blocks(&self, root: &MappedDevice) -> Result<Option<u64>> {
        if !self.embeds_integrity_metadata() {
            return Ok(None);
        }
        let out = Cmd::new("blockdev")
            .arg("--getsize64")
            .arg(&root.device)
            .error_msg("Failed to read root device size")
            .run()?;
        let bytes: u64 = out.stdout.trim().parse().map_err(|_| Error::Integrity {
            message: format!("unexpected size '{}' for {}", out.stdout.trim(), root.device),
        })?;
        Ok(Some(bytes.saturating_sub(defaults::DM_METADATA_OFFSET) / ROOT_BLOCK_SIZE))
    }

    fn mount_options(&self) -> Vec<String> {
        self.config
            .fs_mount_options
            .as_deref()
            .map(|o| o.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Filesystem of the writable root. An overlay root keeps its data in
    /// the read-only image, the write layer needs a regular filesystem.
    fn root_write_filesystem(&self) -> FilesystemKind {
        if self.config.overlay_root && self.config.filesystem.is_read_only_image() {
            FilesystemKind::Ext4
        } else {
            self.config.filesystem
        }
    }

    fn source_dir(&self, mountpoint: &str) -> Result<PathBuf> {
        let dir = self.root_dir.join(mountpoint.trim_start_matches('/'));
        fs::create_dir_all(&dir).at_path(&dir)?;
        Ok(dir)
    }

    fn create_filesystems(&self, stack: &mut DiskStack, device_map: &mut DeviceMap) -> Result<()> {
        info!("Creating filesystems");
        if let Some(efi) = device_map.get(role::EFI) {
            let fs = FileSystem::new(
                FilesystemKind::Fat16,
                Some(efi),
                &self.source_dir("boot/efi")?,
                FilesystemArgs::default(),
            );
            fs.create_on_device(Some(defaults::EFI_LABEL), None, None)?;
            stack.efi = Some(fs);
        }
        if let Some(boot) = device_map.get(role::BOOT) {
            let fs = FileSystem::new(
                self.config.boot_filesystem(),
                Some(boot),
                &self.source_dir(self.boot_source_relative())?,
                FilesystemArgs::default(),
            );
            fs.create_on_device(Some(defaults::BOOT_LABEL), None, None)?;
            stack.boot = Some(fs);
        }
        if let (Some(spare), Some(device)) = (&self.config.spare, device_map.get(role::SPARE)) {
            if let Some(kind) = spare.filesystem {
                let source = match &spare.mountpoint {
                    Some(mountpoint) => self.source_dir(mountpoint)?,
                    None => self.root_dir.clone(),
                };
                let fs = FileSystem::new(kind, Some(device), &source, FilesystemArgs::default());
                fs.create_on_device(Some(defaults::SPARE_LABEL), None, None)?;
                if spare.mountpoint.is_some() {
                    stack.spare = Some(fs);
                }
            }
        }
        for (name, part) in &self.config.partitions {
            if part.filesystem.is_read_only_image() {
                continue;
            }
            let device = require(device_map, name)?;
            let source = match &part.mountpoint {
                Some(mountpoint) => self.source_dir(mountpoint)?,
                None => self.root_dir.clone(),
            };
            let fs = FileSystem::new(part.filesystem, Some(device), &source, FilesystemArgs::default());
            fs.create_on_device(Some(&name.to_uppercase()), None, None)?;
            if part.mountpoint.is_some() {
                stack.custom.push(fs);
            }
        }

        if let Some(kind) = self.config.volume_manager {
            let root = require(device_map, role::ROOT)?.clone();
            let manager = stack.volume_manager.insert(new_volume_manager(
                kind,
                &root,
                &self.root_dir,
                &self.config.volumes,
                VolumeManagerArgs::from_config(&self.config),
            )?);
            manager.setup()?;
            manager.create_volumes(self.config.filesystem)?;
            device_map.extend(manager.get_device());
        } else {
            let root = require(device_map, role::ROOT)?;
            let fs = FileSystem::new(self.root_write_filesystem(), Some(root), &self.root_dir, self.root_filesystem_args());
            fs.create_on_device(Some(self.config.root_label()), self.root_size_blocks(root)?, None)?;
            stack.root = Some(fs);
        }

        if let Some(swap) = device_map.get(role::SWAP) {
            FileSystem::new(FilesystemKind::Swap, Some(swap), &self.root_dir, FilesystemArgs::default())
                .create_on_device(Some(defaults::SWAP_LABEL), None, None)?;
        }
        Ok(())
    }

    /// Trees that receive boot metadata: the boot image root, and the
    /// system root when they differ.
    fn metadata_trees(&self) -> Vec<PathBuf> {
        let boot_root = self.boot_image.boot_root_directory().to_path_buf();
        if boot_root == self.root_dir {
            vec![boot_root]
        } else {
            vec![boot_root, self.root_dir.clone()]
        }
    }

    fn write_metadata(
        &mut self,
        stack: &DiskStack,
        device_map: &DeviceMap,
        partition_ids: &BTreeMap<String, String>,
        mbrid: &SystemIdentifier,
    ) -> Result<()> {
        let trees = self.metadata_trees();

        info!("--> writing partition id map");
        let partids: String = partition_ids
            .iter()
            .map(|(key, value)| format!("{}=\"{}\"\n", key, value))
            .collect();
        for tree in &trees {
            write_file(&tree.join("config.partids"), &partids)?;
        }
        self.boot_image.include_file("/config.partids");

        if let Some(raid) = &stack.raid {
            info!("--> writing RAID config");
            self.write_to_trees(&trees, "etc/mdadm.conf", |path| raid.create_raid_config(path))?;
            self.boot_image.include_file("/etc/mdadm.conf");
        }
        if let Some(integrity) = &stack.integrity {
            info!("--> writing integritytab");
            self.write_to_trees(&trees, "etc/integritytab", |path| integrity.create_integritytab(path))?;
            self.boot_image.include_file("/etc/integritytab");
        }
        if let Some(luks) = &stack.luks {
            info!("--> writing crypttab");
            self.write_to_trees(&trees, "etc/crypttab", |path| luks.create_crypttab(path))?;
            self.boot_image.include_file("/etc/crypttab");
        }

        mbrid.write(&self.root_dir.join("boot/mbrid"))?;

        info!("--> writing fstab");
        let fstab = self.build_fstab(stack, device_map)?;
        for tree in &trees {
            fstab.write(&tree.join("etc/fstab"))?;
        }
        Ok(())
    }

    /// Produce `relative` in the first tree, copy it to the others.
    fn write_to_trees<F>(&self, trees: &[PathBuf], relative: &str, produce: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let Some((first, rest)) = trees.split_first() else {
            return Ok(());
        };
        let source = first.join(relative);
        if let Some(parent) = source.parent() {
            fs::create_dir_all(parent).at_path(parent)?;
        }
        produce(&source)?;
        for tree in rest {
            copy_file(&source, &tree.join(relative))?;
        }
        Ok(())
    }

    /// `<TAG>=<value>` for a device, PARTUUID for read-only images.
    fn device_spec(&self, device: &MappedDevice, kind: FilesystemKind) -> Result<String> {
        let tag = if kind.is_read_only_image() {
            "PARTUUID"
        } else {
            self.config.persistency.blkid_type()
        };
        Ok(format!("{}={}", tag, block_id(&device.device, tag)?))
    }

    fn build_fstab(&self, stack: &DiskStack, device_map: &DeviceMap) -> Result<Fstab> {
        let mut fstab = Fstab::new();
        let lvm = self.config.volume_manager == Some(VolumeManagerKind::Lvm);

        if !self.config.overlay_root {
            let root = require(device_map, role::ROOT)?;
            let spec = if lvm {
                root.device.clone()
            } else {
                self.device_spec(root, self.config.filesystem)?
            };
            let mut options = self.mount_options();
            if options.is_empty() {
                options.push("defaults".to_string());
            }
            let pass = if self.config.root_is_readonly_snapshot() {
                options.push("ro".to_string());
                0
            } else {
                1
            };
            let options: Vec<&str> = options.iter().map(String::as_str).collect();
            fstab.add(FstabEntry::new(&spec, "/", self.config.filesystem.fstab_type(), &options, pass));
        }
        if let Some(boot) = device_map.get(role::BOOT) {
            let kind = self.config.boot_filesystem();
            let mountpoint = format!("/{}", self.boot_source_relative());
            fstab.add(FstabEntry::new(&self.device_spec(boot, kind)?, &mountpoint, kind.fstab_type(), &["defaults"], 0));
        }
        if let Some(efi) = device_map.get(role::EFI) {
            let kind = FilesystemKind::Fat16;
            fstab.add(FstabEntry::new(&self.device_spec(efi, kind)?, "/boot/efi", kind.fstab_type(), &["defaults"], 0));
        }
        if let Some(vm) = &stack.volume_manager {
            for entry in vm.get_fstab(self.config.persistency, self.config.filesystem)? {
                fstab.add(entry);
            }
        }
        if let (Some(spare), Some(device)) = (&self.config.spare, device_map.get(role::SPARE)) {
            if let (Some(kind), Some(mountpoint)) = (spare.filesystem, &spare.mountpoint) {
                fstab.add(FstabEntry::new(&self.device_spec(device, kind)?, mountpoint, kind.fstab_type(), &["defaults"], 0));
            }
        }
        if let Some(swap) = device_map.get(role::SWAP) {
            let spec = if lvm {
                swap.device.clone()
            } else {
                self.device_spec(swap, FilesystemKind::Swap)?
            };
            fstab.add(FstabEntry::new(&spec, "swap", "swap", &["defaults"], 0));
        }
        for (name, part) in &self.config.partitions {
            if let Some(mountpoint) = &part.mountpoint {
                let device = require(device_map, name)?;
                let spec = self.device_spec(device, part.filesystem)?;
                fstab.add(FstabEntry::new(&spec, mountpoint, part.filesystem.fstab_type(), &["defaults"], 0));
            }
        }
        Ok(fstab)
    }

    /// Kernel, initrd and hypervisor go into the system when the boot image
    /// was built elsewhere.
    fn copy_first_boot_files(&self, names: &BootNames) -> Result<()> {
        let boot_root = self.boot_image.boot_root_directory();
        if boot_root == self.root_dir {
            return Ok(());
        }
        info!("Copying first boot files");
        let source = boot_root.join("boot");
        let target = self.root_dir.join("boot");
        copy_file(&source.join(&names.kernel_name), &target.join(&names.kernel_name))?;
        match self.boot_image.initrd_filename() {
            Some(initrd) => copy_file(initrd, &target.join(&names.initrd_name))?,
            None => copy_file(&source.join(&names.initrd_name), &target.join(&names.initrd_name))?,
        }
        let xen = source.join("xen.gz");
        if xen.exists() {
            copy_file(&xen, &target.join("xen.gz"))?;
        }
        Ok(())
    }

    fn boot_params(
        &self,
        device_map: &DeviceMap,
        disk_node: &MappedDevice,
        mbrid: &SystemIdentifier,
        names: &BootNames,
    ) -> Result<BootParams> {
        let root = require(device_map, role::ROOT)?;
        let root_uuid = block_id(&root.device, "UUID")?;
        let boot_uuid = match device_map.get(role::BOOT) {
            Some(boot) => block_id(&boot.device, "UUID")?,
            None => root_uuid.clone(),
        };

        let mut options = Vec::new();
        if self.config.overlay_root {
            let readonly = require(device_map, role::READONLY)?;
            options.push(format!("root=overlay:PARTUUID={}", block_id(&readonly.device, "PARTUUID")?));
        } else if self.config.volume_manager == Some(VolumeManagerKind::Lvm) {
            options.push(format!("root={}", root.device));
        } else {
            options.push(format!("root=UUID={}", root_uuid));
        }
        if self.config.raid.is_some() {
            options.push("rd.auto".to_string());
        }

        let hypervisor = self
            .root_dir
            .join("boot/xen.gz")
            .exists()
            .then(|| "xen.gz".to_string());
        Ok(BootParams {
            boot_uuid: Some(boot_uuid),
            root_uuid: Some(root_uuid),
            mbrid: Some(*mbrid),
            kernel: names.kernel_name.clone(),
            initrd: names.initrd_name.clone(),
            kernel_version: names.kernel_version.clone(),
            hypervisor,
            boot_options: options.join(" "),
            target_device: Some(disk_node.device.clone()),
        })
    }

    /// `config.bootoptions`: the kernel command line of the built disk.
    fn write_boot_options(&self, params: &BootParams) -> Result<()> {
        let line = format!("{} {}", self.config.kernel_cmdline, params.boot_options);
        let line = line.trim().to_string() + "\n";
        for tree in self.metadata_trees() {
            write_file(&tree.join("config.bootoptions"), &line)?;
        }
        Ok(())
    }

    fn sync_system_data(
        &self,
        stack: &mut DiskStack,
        device_map: &DeviceMap,
        exclude: &[String],
        readonly_image: Option<&Path>,
    ) -> Result<()> {
        info!("Syncing system to image");
        if let Some(spare) = stack.spare.as_mut() {
            info!("--> syncing spare partition data");
            spare.sync_data(&[])?;
        }
        for fs in stack.custom.iter_mut() {
            fs.sync_data(&[])?;
        }
        for (name, part) in &self.config.partitions {
            if part.filesystem.is_read_only_image() {
                self.write_readonly_partition(name, part.filesystem, part.mountpoint.as_deref(), device_map)?;
            }
        }
        if let Some(efi) = stack.efi.as_mut() {
            info!("--> syncing EFI partition data");
            efi.sync_data(&[])?;
        }
        if let Some(boot) = stack.boot.as_mut() {
            info!("--> syncing boot partition data");
            boot.sync_data(&["efi/*".to_string()])?;
            if self.config.boot_clone_count > 0 {
                self.clone_boot(boot, device_map)?;
            }
        }

        if let Some(image) = readonly_image {
            info!("--> dumping read-only root image");
            let device = require(device_map, role::READONLY)?;
            dd(&image.to_string_lossy(), &device.device)?;
        } else if let Some(vm) = stack.volume_manager.as_mut() {
            info!("--> syncing root volumes");
            vm.mount_volumes()?;
            vm.sync_data(exclude)?;
        } else if let Some(root) = stack.root.as_mut() {
            info!("--> syncing root filesystem");
            root.sync_data(exclude)?;
        }
        Ok(())
    }

    fn write_readonly_partition(
        &self,
        name: &str,
        kind: FilesystemKind,
        mountpoint: Option<&str>,
        device_map: &DeviceMap,
    ) -> Result<()> {
        let Some(mountpoint) = mountpoint else {
            warn!("{} partition '{}' has no mountpoint, left empty", kind, name);
            return Ok(());
        };
        info!("--> creating {} image for partition '{}'", kind, name);
        let device = require(device_map, name)?;
        let image = NamedTempFile::new_in(&self.target_dir).at_path(&self.target_dir)?;
        let fs = FileSystem::new(
            kind,
            None,
            &self.source_dir(mountpoint)?,
            FilesystemArgs {
                compression: Some(self.config.squashfs_compression().to_string()),
                ..Default::default()
            },
        );
        fs.create_on_file(image.path(), Some(name), &[], None)?;
        dd(&image.path().to_string_lossy(), &device.device)
    }

    fn clone_boot(&self, boot: &mut FileSystem, device_map: &DeviceMap) -> Result<()> {
        if !boot.umount() {
            return Err(Error::VolumeSetup {
                message: "boot partition still busy before cloning".to_string(),
            });
        }
        let source = require(device_map, role::BOOT)?;
        for n in 1..=self.config.boot_clone_count {
            let clone = require(device_map, &role::bootclone(n))?;
            info!("--> cloning boot to {}", clone.device);
            dd(&source.device, &clone.device)?;
            FileSystem::new(self.config.boot_filesystem(), Some(clone), &self.root_dir, FilesystemArgs::default())
                .set_uuid()?;
        }
        Ok(())
    }

    fn clone_root(&self, stack: &mut DiskStack, device_map: &DeviceMap) -> Result<()> {
        let count = self.config.root_clone_count;
        if count == 0 {
            return Ok(());
        }
        let busy = match (stack.volume_manager.as_mut(), stack.root.as_mut()) {
            (Some(vm), _) => !vm.umount_volumes(),
            (None, Some(root)) => !root.umount(),
            (None, None) => false,
        };
        if busy {
            return Err(Error::VolumeSetup {
                message: "root still busy before cloning".to_string(),
            });
        }

        let source = device_map
            .get(role::ROOT_PARTITION)
            .map_or_else(|| require(device_map, role::ROOT), Ok)?;
        let plain = self.config.volume_manager.is_none()
            && self.config.raid.is_none()
            && self.config.integrity.is_none()
            && self.config.luks.is_none()
            && !self.config.overlay_root;
        for n in 1..=count {
            let clone = require(device_map, &role::rootclone(n))?;
            info!("--> cloning root to {}", clone.device);
            dd(&source.device, &clone.device)?;
            if plain {
                FileSystem::new(self.config.filesystem, Some(clone), &self.root_dir, FilesystemArgs::default())
                    .set_uuid()?;
            }
        }
        Ok(())
    }

    fn install_bootloader(&self, device_map: &DeviceMap, disk_node: &MappedDevice) -> Result<()> {
        if self.config.bootloader == BootloaderKind::Custom {
            return Ok(());
        }
        let root = require(device_map, role::ROOT)?;
        let btrfs = self.config.volume_manager == Some(VolumeManagerKind::Btrfs);
        let volumes = if btrfs {
            self.config
                .volumes
                .iter()
                .filter(|v| !v.root)
                .map(|v| {
                    let path = v.realpath();
                    let options = vec![format!("subvol=@/{}", path)];
                    (path, root.device.clone(), options)
                })
                .collect()
        } else {
            Vec::new()
        };
        let devices = InstallDevices {
            disk_device: disk_node.device.clone(),
            root_device: root.device.clone(),
            boot_device: device_map.get(role::BOOT).map(|d| d.device.clone()),
            efi_device: device_map.get(role::EFI).map(|d| d.device.clone()),
            prep_device: device_map.get(role::PREP).map(|d| d.device.clone()),
            root_volume_name: btrfs.then(|| default_volume_name(self.config.btrfs_root_is_snapshot).to_string()),
            volumes,
        };
        let mut install = new_bootloader_install(self.config.bootloader, &self.firmware, &self.root_dir, devices)?;
        if install.install_required() {
            info!("Installing bootloader");
            install.install()?;
        }
        Ok(())
    }

    /// Install ISO, stick image and PXE archive, as configured. Needs the
    /// raw disk and boot snapshot of an earlier [`DiskBuilder::create_disk`].
    pub fn create_install_media(&self, result: &mut BuildResult) -> Result<()> {
        if !self.wants_install_media() {
            return Ok(());
        }
        if self.config.image_type != ImageType::Oem {
            return Err(Error::precondition(
                "installation media can only be built for image_type = \"oem\"",
            ));
        }
        let snapshot = BootImageSnapshot::load(&self.boot_snapshot_path())?;
        let installer = InstallImageBuilder::new(
            &self.config,
            &self.firmware,
            &self.root_dir,
            &self.target_dir,
            snapshot,
        );
        if self.config.install_iso || self.config.install_stick {
            let iso = installer.create_install_iso(&self.diskname)?;
            result.add(result_key::INSTALLATION_IMAGE, iso, true, false, true);
        }
        if self.config.install_pxe {
            let archive = installer.create_install_pxe_archive(&self.diskname)?;
            result.add(result_key::INSTALLATION_PXE_ARCHIVE, archive, true, false, true);
        }
        Ok(())
    }

    /// Convert the raw disk to the configured format.
    pub fn create_disk_format(&self, result: &mut BuildResult) -> Result<()> {
        let Some(format) = self.config.disk_format else {
            return Ok(());
        };
        let output = disk_format_filename(&self.diskname, format);
        convert_disk(&self.diskname, format, &output)?;
        if let Some(limit) = self.config.image_size_limit {
            verify_image_size(limit, &output)?;
        }
        result.add(result_key::DISK_FORMAT_IMAGE, output, true, true, true);
        Ok(())
    }
}

/// Block size of a root filesystem that leaves room for trailing metadata.
const ROOT_BLOCK_SIZE: u64 = 4096;

/// Copy `source` onto a block device.
fn dd(source: &str, device: &str) -> Result<()> {
    Cmd::new("dd")
        .arg(format!("if={}", source))
        .arg(format!("of={}", device))
        .args(["bs=1M", "conv=fsync"])
        .error_msg(format!("Failed to write {}", device))
        .run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::lock::LOCK_FILE_NAME;
    use crate::process::testing::RecordingRunner;
    use crate::system::identifier::MBR_ID_OFFSET;
    use std::io::{Read, Seek, SeekFrom};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        target: PathBuf,
        loop_node: PathBuf,
    }

    impl Fixture {
        fn node(&self) -> String {
            self.loop_node.display().to_string()
        }
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let target = tmp.path().join("target");
        fs::create_dir_all(root.join("lib/modules/6.4.0")).unwrap();
        fs::create_dir_all(root.join("boot")).unwrap();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("boot/vmlinuz-6.4.0"), "kernel").unwrap();
        fs::write(root.join("etc/os-release"), "NAME=test\n").unwrap();
        // stands in for the attached loop node, backed by the raw disk file
        let loop_node = tmp.path().join("dev/loop0");
        fs::create_dir_all(loop_node.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink(target.join("appliance.x86_64-1.0.0.raw"), &loop_node).unwrap();
        Fixture {
            _tmp: tmp,
            root,
            target,
            loop_node,
        }
    }

    fn builder(fixture: &Fixture, extra: &str) -> DiskBuilder {
        let config = ImageConfiguration::from_toml_str(&format!(
            "image_name = \"appliance\"\narch = \"x86_64\"\nsize = \"64\"\n{}",
            extra
        ))
        .unwrap();
        DiskBuilder::new(config, &fixture.root, &fixture.target).unwrap()
    }

    fn runner(fixture: &Fixture) -> (std::rc::Rc<RecordingRunner>, crate::process::RunnerGuard) {
        let (runner, guard) = RecordingRunner::install();
        runner.respond_when("losetup", "--show", &format!("{}\n", fixture.node()));
        runner.respond_when("blkid", "UUID", "1111-2222\n");
        runner.respond_when("blkid", "LABEL", "ROOT\n");
        (runner, guard)
    }

    fn read_mbr_id(path: &Path) -> u32 {
        let mut file = fs::File::open(path).unwrap();
        file.seek(SeekFrom::Start(MBR_ID_OFFSET)).unwrap();
        let mut bytes = [0u8; 4];
        file.read_exact(&mut bytes).unwrap();
        u32::from_le_bytes(bytes)
    }

    #[test]
    fn test_flat_ext4_bios_disk() {
        let fixture = fixture();
        let (runner, _guard) = runner(&fixture);
        let mut builder = builder(&fixture, "filesystem = \"ext4\"\nbootloader = \"custom\"");

        let result = builder.create_disk().unwrap();
        let entry = result.get(result_key::DISK_IMAGE).unwrap();
        assert_eq!(entry.filename, fixture.target.join("appliance.x86_64-1.0.0.raw"));
        assert!(entry.use_for_bundle && entry.compress && entry.shasum);

        let mkfs = runner.commands_for("mkfs.ext4");
        assert_eq!(mkfs.len(), 1);
        assert!(mkfs[0].starts_with("mkfs.ext4 -F -L ROOT /dev/mapper/loop0p"));

        let rsync = runner.commands_for("rsync");
        assert_eq!(rsync.len(), 1);
        assert!(rsync[0].contains("--exclude /image"));

        let fstab = fs::read_to_string(fixture.root.join("etc/fstab")).unwrap();
        let root_line = fstab.lines().next().unwrap();
        assert!(root_line.starts_with("UUID=1111-2222 / ext4 defaults 0 1"));

        let partids = fs::read_to_string(fixture.root.join("config.partids")).unwrap();
        assert!(partids.contains("ROOT_PART=\""));

        let options = fs::read_to_string(fixture.root.join("config.bootoptions")).unwrap();
        assert_eq!(options, "root=UUID=1111-2222\n");

        let mbrid = fs::read_to_string(fixture.root.join("boot/mbrid")).unwrap();
        let written = read_mbr_id(&builder.diskname);
        assert_eq!(mbrid.trim(), format!("0x{:08x}", written));

        assert!(fixture.target.join("appliance.x86_64-1.0.0.boot.json").exists());
        assert!(runner.commands().contains(&format!("kpartx -s -d {}", fixture.node())));
        assert!(runner.commands().contains(&format!("losetup -d {}", fixture.node())));
    }

    #[test]
    fn test_teardown_order() {
        let fixture = fixture();
        let (runner, _guard) = runner(&fixture);
        let mut builder = builder(&fixture, "filesystem = \"ext4\"\nbootloader = \"custom\"");
        builder.create_disk().unwrap();

        let commands = runner.commands();
        let position = |needle: &str| {
            commands
                .iter()
                .rposition(|c| c.starts_with(needle))
                .unwrap_or_else(|| panic!("missing {}", needle))
        };
        assert!(position("umount") < position("kpartx -s -d"));
        assert!(position("kpartx -s -d") < position("losetup -d"));
    }

    #[test]
    fn test_failure_still_releases_devices() {
        let fixture = fixture();
        let (runner, _guard) = runner(&fixture);
        runner.fail_when("rsync", "--exclude");
        let mut builder = builder(&fixture, "filesystem = \"ext4\"\nbootloader = \"custom\"");

        assert!(builder.create_disk().is_err());
        assert!(runner.commands().contains(&format!("kpartx -s -d {}", fixture.node())));
        assert!(runner.commands().contains(&format!("losetup -d {}", fixture.node())));
    }

    #[test]
    fn test_boot_partition_excluded_from_root_sync() {
        let fixture = fixture();
        let (runner, _guard) = runner(&fixture);
        let mut builder = builder(
            &fixture,
            "filesystem = \"ext4\"\nbootloader = \"custom\"\nboot_partition = true",
        );
        builder.create_disk().unwrap();

        assert_eq!(runner.commands_for("mkfs.ext3").len(), 1);
        let rsync = runner.commands_for("rsync");
        assert_eq!(rsync.len(), 2);
        assert!(rsync[0].contains("--exclude /efi/*"));
        assert!(rsync[1].contains("--exclude /boot/*"));

        let fstab = fs::read_to_string(fixture.root.join("etc/fstab")).unwrap();
        assert!(fstab.contains(" /boot ext3 defaults 0 0"));
    }

    #[test]
    fn test_custom_partition_gets_own_filesystem() {
        let fixture = fixture();
        let (runner, _guard) = runner(&fixture);
        let mut builder = builder(
            &fixture,
            "filesystem = \"ext4\"\nbootloader = \"custom\"\n\
             [partitions.data]\nmbytes = 20\nfilesystem = \"xfs\"\nmountpoint = \"/data\"",
        );
        builder.create_disk().unwrap();

        let mkfs = runner.commands_for("mkfs.xfs");
        assert_eq!(mkfs.len(), 1);
        assert!(mkfs[0].starts_with("mkfs.xfs -f -L DATA /dev/mapper/loop0p"));

        let rsync = runner.commands_for("rsync");
        assert_eq!(rsync.len(), 2);
        assert!(rsync[1].contains("--exclude /data/*"));

        let fstab = fs::read_to_string(fixture.root.join("etc/fstab")).unwrap();
        assert!(fstab.contains("UUID=1111-2222 /data xfs defaults 0 0"));
        let partids = fs::read_to_string(fixture.root.join("config.partids")).unwrap();
        assert!(partids.contains("DATA_PART=\""));
    }

    #[test]
    fn test_grub_install_targets_root() {
        let fixture = fixture();
        let modules = fixture.root.join("usr/lib/grub2/i386-pc");
        fs::create_dir_all(&modules).unwrap();
        fs::write(modules.join("normal.mod"), "mod").unwrap();
        let (runner, _guard) = runner(&fixture);
        let mut builder = builder(&fixture, "filesystem = \"ext4\"");
        builder.create_disk().unwrap();

        assert!(fixture.root.join("boot/grub2/grub.cfg").exists());
        let grub = runner.commands_for("grub2-install");
        assert_eq!(grub.len(), 1);
        assert!(grub[0].ends_with(&format!(" {}", fixture.node())));
        let root_mount = runner
            .commands_for("mount")
            .into_iter()
            .filter(|m| m.starts_with("mount /dev/mapper/loop0p"))
            .count();
        assert_eq!(root_mount, 2);
    }

    #[test]
    fn test_install_media_needs_oem() {
        let fixture = fixture();
        let (runner, _guard) = runner(&fixture);
        let mut builder = builder(&fixture, "install_iso = true\nbootloader = \"custom\"");
        match builder.create_disk() {
            Err(Error::Precondition { .. }) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(runner.commands().is_empty());
        assert!(!builder.diskname().exists());
    }

    #[test]
    fn test_overlay_with_volume_manager_rejected() {
        let fixture = fixture();
        let (_runner, _guard) = runner(&fixture);
        let mut builder = builder(
            &fixture,
            "overlay_root = true\nvolume_manager = \"lvm\"\nbootloader = \"custom\"",
        );
        assert!(matches!(builder.create_disk(), Err(Error::Precondition { .. })));
    }

    #[test]
    fn test_locked_target_rejected() {
        let fixture = fixture();
        let (runner, _guard) = runner(&fixture);
        let _held = BuildLock::acquire(&fixture.target).unwrap();
        assert!(fixture.target.join(LOCK_FILE_NAME).exists());

        let mut builder = builder(&fixture, "bootloader = \"custom\"");
        assert!(matches!(builder.create_disk(), Err(Error::Precondition { .. })));
        assert!(runner.commands_for("losetup").is_empty());
    }

    #[test]
    fn test_disk_format_registered() {
        let fixture = fixture();
        let (runner, _guard) = runner(&fixture);
        let builder = builder(&fixture, "disk_format = \"qcow2\"");
        let mut result = BuildResult::new("appliance");
        builder.create_disk_format(&mut result).unwrap();

        let qcow2 = fixture.target.join("appliance.x86_64-1.0.0.qcow2");
        assert_eq!(result.get(result_key::DISK_FORMAT_IMAGE).unwrap().filename, qcow2);
        assert_eq!(runner.commands_for("qemu-img").len(), 1);
    }

    #[test]
    fn test_no_install_media_is_noop() {
        let fixture = fixture();
        let (runner, _guard) = runner(&fixture);
        let builder = builder(&fixture, "");
        let mut result = BuildResult::new("appliance");
        builder.create_install_media(&mut result).unwrap();
        assert!(result.entries().is_empty());
        assert!(runner.commands().is_empty());
    }

    fn position(commands: &[String], needle: &str) -> usize {
        commands
            .iter()
            .position(|c| c.starts_with(needle))
            .unwrap_or_else(|| panic!("missing {}", needle))
    }

    fn last_position(commands: &[String], needle: &str) -> usize {
        commands
            .iter()
            .rposition(|c| c.starts_with(needle))
            .unwrap_or_else(|| panic!("missing {}", needle))
    }

    #[test]
    fn test_disk_identifier_lands_in_backing_file() {
        let fixture = fixture();
        let (runner, _guard) = runner(&fixture);
        let mut builder = builder(&fixture, "filesystem = \"ext4\"\nbootloader = \"custom\"");
        builder.create_disk().unwrap();

        // the loop device is gone, so this reads the backing file itself
        assert!(runner.commands().contains(&format!("losetup -d {}", fixture.node())));
        let mbrid = fs::read_to_string(fixture.root.join("boot/mbrid")).unwrap();
        assert_eq!(
            mbrid.trim(),
            format!("0x{:08x}", read_mbr_id(builder.diskname()))
        );
    }

    #[test]
    fn test_disk_identifier_mismatch_rejected() {
        let fixture = fixture();
        let decoy = fixture.loop_node.with_file_name("decoy.raw");
        fs::write(&decoy, vec![0u8; 4096]).unwrap();
        fs::remove_file(&fixture.loop_node).unwrap();
        std::os::unix::fs::symlink(&decoy, &fixture.loop_node).unwrap();
        let (runner, _guard) = runner(&fixture);
        let mut builder = builder(&fixture, "filesystem = \"ext4\"\nbootloader = \"custom\"");

        match builder.create_disk() {
            Err(Error::Partitioner { message }) => assert!(message.contains("disk identifier")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert_eq!(read_mbr_id(builder.diskname()), 0);
        assert!(runner.commands().contains(&format!("losetup -d {}", fixture.node())));
    }

    #[test]
    fn test_lvm_efi_disk() {
        let fixture = fixture();
        let (runner, _guard) = runner(&fixture);
        let mut builder = builder(
            &fixture,
            "filesystem = \"ext4\"\nfirmware = \"efi\"\nefi_csm = false\n\
             volume_manager = \"lvm\"\nbootloader = \"custom\"",
        );
        builder.create_disk().unwrap();

        let commands = runner.commands();
        // efi p1, boot p2, lvm p3
        assert!(commands.contains(&"pvcreate /dev/mapper/loop0p3".to_string()));
        assert!(commands.contains(&"vgcreate systemVG /dev/mapper/loop0p3".to_string()));
        let lvcreate = runner.commands_for("lvcreate");
        assert_eq!(lvcreate.len(), 1);
        assert!(lvcreate[0].ends_with(" -n LVRoot systemVG"));
        let mkfs = runner.commands_for("mkfs.ext4");
        assert_eq!(mkfs.len(), 1);
        assert!(mkfs[0].ends_with(" /dev/systemVG/LVRoot"));

        assert!(position(&commands, "pvcreate") < position(&commands, "vgcreate"));
        assert!(position(&commands, "vgcreate") < position(&commands, "lvcreate"));
        assert!(position(&commands, "lvcreate") < position(&commands, "mkfs.ext4"));
        assert!(position(&commands, "mkfs.ext4") < last_position(&commands, "rsync"));
        assert!(last_position(&commands, "rsync") < last_position(&commands, "umount"));
        assert!(last_position(&commands, "umount") < position(&commands, "vgchange -an systemVG"));
        assert!(position(&commands, "vgchange -an") < position(&commands, "kpartx -s -d"));
        assert!(position(&commands, "kpartx -s -d") < position(&commands, "losetup -d"));

        let rsync = runner.commands_for("rsync");
        assert_eq!(rsync.len(), 3);
        assert!(rsync[2].contains("--exclude /boot/efi/*"));

        let fstab = fs::read_to_string(fixture.root.join("etc/fstab")).unwrap();
        assert!(fstab.starts_with("/dev/systemVG/LVRoot / ext4 defaults 0 1"));
        assert!(fstab.contains(" /boot/efi vfat defaults 0 0"));
        let options = fs::read_to_string(fixture.root.join("config.bootoptions")).unwrap();
        assert_eq!(options, "root=/dev/systemVG/LVRoot\n");
    }

    #[test]
    fn test_btrfs_readonly_snapshot_disk() {
        const LIST: &str = "ID 256 gen 7 top level 5 path @\n\
                            ID 257 gen 7 top level 256 path @/.snapshots\n\
                            ID 258 gen 7 top level 257 path @/.snapshots/1/snapshot\n";
        let fixture = fixture();
        let modules = fixture.root.join("usr/lib/grub2/i386-pc");
        fs::create_dir_all(&modules).unwrap();
        fs::write(modules.join("normal.mod"), "mod").unwrap();
        let (runner, _guard) = runner(&fixture);
        runner.respond_when("btrfs", "list", LIST);
        let mut builder = builder(
            &fixture,
            "filesystem = \"btrfs\"\nvolume_manager = \"btrfs\"\n\
             btrfs_root_is_snapshot = true\nbtrfs_root_is_readonly_snapshot = true",
        );
        builder.create_disk().unwrap();

        let commands = runner.commands();
        let property = position(&commands, "btrfs property set");
        assert!(commands[property].ends_with("/@/.snapshots/1/snapshot ro true"));
        let remount = last_position(&commands, "mount -o subvolid=5 /dev/mapper/loop0p");
        assert!(position(&commands, "btrfs subvolume set-default") < remount);
        assert!(position(&commands, "grub2-install") < remount);
        assert!(remount < property);
        assert!(property < last_position(&commands, "umount"));
        assert!(last_position(&commands, "umount") < position(&commands, "kpartx -s -d"));
        assert!(position(&commands, "kpartx -s -d") < position(&commands, "losetup -d"));

        let fstab = fs::read_to_string(fixture.root.join("etc/fstab")).unwrap();
        let root_line = fstab.lines().find(|l| l.contains(" / ")).unwrap();
        assert!(root_line.contains(" btrfs defaults,ro "));
        assert!(root_line.ends_with(" 0 0"));
    }

    #[test]
    fn test_boot_clones_copied_after_boot_sync() {
        let fixture = fixture();
        let (runner, _guard) = runner(&fixture);
        let mut builder = builder(
            &fixture,
            "filesystem = \"ext4\"\nfirmware = \"bios\"\nbootloader = \"custom\"\n\
             boot_partition = true\nboot_clone_count = 1",
        );
        builder.create_disk().unwrap();

        let commands = runner.commands();
        let clone = "dd if=/dev/mapper/loop0p1 of=/dev/mapper/loop0p2 bs=1M conv=fsync";
        let dd = position(&commands, clone);
        let boot_sync = commands
            .iter()
            .position(|c| c.starts_with("rsync") && c.contains("--exclude /efi/*"))
            .unwrap();
        assert!(boot_sync < dd);
        assert!(commands[dd + 1..].contains(&"tune2fs -f -U random /dev/mapper/loop0p2".to_string()));
        assert_eq!(runner.commands_for("mkfs.ext3").len(), 1);
    }

    #[test]
    fn test_integrity_root_layer() {
        let fixture = fixture();
        let (runner, _guard) = runner(&fixture);
        let mut builder = builder(
            &fixture,
            "filesystem = \"ext4\"\nfirmware = \"bios\"\nbootloader = \"custom\"\n[integrity]",
        );
        builder.create_disk().unwrap();

        let commands = runner.commands();
        let format = position(&commands, "integritysetup -v --batch-mode");
        assert!(commands[format].ends_with(" format /dev/mapper/loop0p1"));
        let mkfs = runner.commands_for("mkfs.ext4");
        assert!(mkfs[0].ends_with(" /dev/mapper/integrityRoot"));
        assert!(format < position(&commands, "mkfs.ext4"));

        let tab = fs::read_to_string(fixture.root.join("etc/integritytab")).unwrap();
        assert!(tab.starts_with("integrityRoot PARTUUID=1111-2222 - "));

        let close = position(&commands, "integritysetup close integrityRoot");
        assert!(last_position(&commands, "umount") < close);
        assert!(close < position(&commands, "kpartx -s -d"));
    }

    #[test]
    fn test_verity_credentials_registered() {
        let fixture = fixture();
        let (runner, _guard) = runner(&fixture);
        runner.respond(
            "veritysetup",
            "VERITY header information\nData blocks: 16\nRoot hash: 5a1f\n",
        );
        let mut builder = builder(
            &fixture,
            "filesystem = \"squashfs\"\noverlay_root = true\nverity_blocks = \"all\"\n\
             bootloader = \"custom\"",
        );
        let result = builder.create_disk().unwrap();

        let credentials = fixture.target.join("appliance.x86_64-1.0.0.verity");
        let entry = result.get(result_key::VERITY_CREDENTIALS).unwrap();
        assert_eq!(entry.filename, credentials);
        let text = fs::read_to_string(&credentials).unwrap();
        assert!(text.contains("Roothash: 5a1f\n"));
        assert!(text.contains("PARTUUID: 1111-2222\n"));

        let commands = runner.commands();
        let format = position(&commands, "veritysetup format");
        assert!(position(&commands, "mksquashfs") < format);
        assert!(format < position(&commands, "losetup -f"));
    }
}
