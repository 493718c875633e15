//! Boot code installation.
//!
//! BIOS targets get a small MBR bootstrap that chain-loads the active
//! partition's boot sector. UEFI targets get an `EFI/BOOT` directory on the
//! FAT system partition holding a `BOOT*.EFI` loader.
use crate::block::{BlockDevice, Region};
use crate::error::{Error, Result};
use crate::options::{FirmwareTarget, OperationOptions, PartitionScheme};
use crate::plan::PartitionPlan;
use log::{debug, info};
use std::fs::File;
use std::io::{self, SeekFrom, Write};

/// Real-mode bootstrap: relocate to 0x0600, find the active partition, read
/// its first sector to 0x7C00 with INT 13h extensions and jump to it. The
/// disk address packet lives at offset 0x60.
const MBR_BOOTSTRAP: [u8; 0x70] = [
    0xFA, 0x31, 0xC0, 0x8E, 0xD0, 0xBC, 0x00, 0x7C, 0x8E, 0xD8, 0x8E, 0xC0, 0xFB, 0xBE, 0x00, 0x7C,
    0xBF, 0x00, 0x06, 0xB9, 0x00, 0x01, 0xFC, 0xF3, 0xA5, 0xEA, 0x1E, 0x06, 0x00, 0x00, 0xBE, 0xBE,
    0x07, 0xB9, 0x04, 0x00, 0x80, 0x3C, 0x80, 0x74, 0x0B, 0x83, 0xC6, 0x10, 0xE2, 0xF6, 0xCD, 0x18,
    0xF4, 0xEB, 0xFD, 0x90, 0x66, 0x8B, 0x44, 0x08, 0x66, 0xA3, 0x68, 0x06, 0x56, 0xB4, 0x42, 0xBE,
    0x60, 0x06, 0xCD, 0x13, 0x5E, 0x72, 0xE7, 0x81, 0x3E, 0xFE, 0x7D, 0x55, 0xAA, 0x75, 0xDF, 0xEA,
    0x00, 0x7C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x10, 0x00, 0x01, 0x00, 0x00, 0x7C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Bytes of sector 0 available for boot code.
const BOOT_CODE_LEN: usize = 440;
const PARTITION_TABLE: usize = 446;

/// Loader name firmware looks for on x86_64 removable media.
pub const DEFAULT_EFI_LOADER: &str = "BOOTX64.EFI";

/// Installs whatever the firmware target needs to boot the written device.
pub trait BootInstaller: Send + Sync {
    fn install(
        &self,
        dev: &mut dyn BlockDevice,
        plan: &PartitionPlan,
        target: FirmwareTarget,
        options: &OperationOptions,
    ) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StandardBootInstaller;

fn install_bios(dev: &mut dyn BlockDevice) -> Result<()> {
    let mut sector = [0u8; 512];
    dev.seek(SeekFrom::Start(0))?;
    dev.read_exact(&mut sector)?;
    if sector[510..] != [0x55, 0xAA] {
        return Err(Error::BootInstall("sector 0 holds no partition table".into()));
    }

    sector[..BOOT_CODE_LEN].fill(0);
    sector[..MBR_BOOTSTRAP.len()].copy_from_slice(&MBR_BOOTSTRAP);
    // The first partition is the system partition; make sure it is the one
    // the bootstrap chain-loads.
    for slot in 0..4 {
        sector[PARTITION_TABLE + slot * 16] = if slot == 0 { 0x80 } else { 0x00 };
    }

    dev.seek(SeekFrom::Start(0))?;
    dev.write_all(&sector)?;
    dev.sync()?;
    debug!("installed MBR bootstrap");
    Ok(())
}

fn is_boot_loader(name: &str) -> bool {
    let name = name.to_ascii_uppercase();
    name.starts_with("BOOT") && name.ends_with(".EFI")
}

/// Makes sure `EFI/BOOT` on the system partition holds a `BOOT*.EFI` loader,
/// copying `options.efi_loader` there if it does not. Nothing is written when
/// a loader is already present or when there is none to copy.
fn install_uefi(
    dev: &mut dyn BlockDevice,
    plan: &PartitionPlan,
    options: &OperationOptions,
) -> Result<()> {
    let system = plan.system();
    let region = Region::new(dev, system.start_offset_bytes, system.size_bytes);
    let fs = fatfs::FileSystem::new(region, fatfs::FsOptions::new()).map_err(|e| {
        Error::BootInstall(format!("system partition is not a FAT filesystem: {e}"))
    })?;

    let result = copy_loader_if_missing(&fs, options);
    fs.unmount()?;
    result
}

fn copy_loader_if_missing<IO: fatfs::ReadWriteSeek>(
    fs: &fatfs::FileSystem<IO>,
    options: &OperationOptions,
) -> Result<()> {
    let has_loader = match fs.root_dir().open_dir("EFI/BOOT") {
        Ok(boot_dir) => boot_dir
            .iter()
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.is_file() && is_boot_loader(&entry.file_name())),
        Err(_) => false,
    };
    if has_loader {
        debug!("system partition already carries an EFI loader");
        return Ok(());
    }

    let Some(loader) = &options.efi_loader else {
        return Err(Error::BootInstall(
            "no EFI loader on the system partition and none supplied".into(),
        ));
    };
    let mut source = File::open(loader).map_err(|source| Error::NotFound {
        path: loader.clone(),
        source,
    })?;
    let boot_dir = fs.root_dir().create_dir("EFI")?.create_dir("BOOT")?;
    let mut target = boot_dir.create_file(DEFAULT_EFI_LOADER)?;
    target.truncate()?;
    io::copy(&mut source, &mut target)?;
    target.flush()?;
    info!("copied {} to EFI/BOOT/{DEFAULT_EFI_LOADER}", loader.display());
    Ok(())
}

/// The message of a boot error without its "Failed to install boot code"
/// prefix, so joined failures read once.
pub(crate) fn reason(err: &Error) -> String {
    match err {
        Error::BootInstall(message) => message.clone(),
        other => other.to_string(),
    }
}

impl BootInstaller for StandardBootInstaller {
    fn install(
        &self,
        dev: &mut dyn BlockDevice,
        plan: &PartitionPlan,
        target: FirmwareTarget,
        options: &OperationOptions,
    ) -> Result<()> {
        let mut failures = Vec::new();

        if target.supports_bios() {
            if plan.scheme == PartitionScheme::Mbr {
                if let Err(e) = install_bios(dev) {
                    failures.push(format!("BIOS: {}", reason(&e)));
                }
            } else {
                debug!("skipping BIOS boot code on a GPT device");
            }
        }
        if target.supports_uefi() {
            if let Err(e) = install_uefi(dev, plan, options) {
                failures.push(format!("UEFI: {}", reason(&e)));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::BootInstall(failures.join("; ")))
        }
    }
}
