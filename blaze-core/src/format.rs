//! Partition table creation and filesystem formatting.
//!
//! FAT32 is laid down in-process with `fatfs`, through a [`Region`] window on
//! the device. NTFS, exFAT and EXT4 are handed to the system's `mkfs.*` tools,
//! which need the kernel's partition node for the target partition.
use crate::block::{BlockDevice, Region};
use crate::cancel::CancelToken;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::options::{FileSystem, MIB};
use crate::plan::{PartitionPlan, PartitionSpec};
use crate::platform;
use crate::table;
use crate::writer::BlockWriter;
use log::{debug, info, warn};
use std::io::{self, Read, SeekFrom};
use std::path::Path;
use std::process::Command;

/// Below this size fatfs is left to pick FAT12/16, as a FAT32 volume needs at
/// least 65525 clusters.
const FAT32_MIN_BYTES: u64 = 512 * MIB;

/// Writes partition tables and creates filesystems.
pub trait Formatter: Send + Sync {
    /// Wipes old signatures and writes `plan`'s partition table.
    fn write_partition_table(&self, dev: &mut dyn BlockDevice, plan: &PartitionPlan) -> Result<()>;

    /// Creates an empty filesystem in the partition described by `spec`, the
    /// `index`-th (1-based) partition of `device`. A full format zeroes the
    /// partition first.
    fn format_partition(
        &self,
        dev: &mut dyn BlockDevice,
        device: &Device,
        index: usize,
        spec: &PartitionSpec,
        quick: bool,
        cancel: &CancelToken,
    ) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StandardFormatter;

fn zero_fill(
    dev: &mut dyn BlockDevice,
    start: u64,
    len: u64,
    cancel: &CancelToken,
) -> Result<()> {
    let mut region = Region::new(dev, start, len);
    BlockWriter::default().transfer(
        &mut io::repeat(0).take(len),
        &mut region,
        len,
        cancel,
        |_, _| {},
    )?;
    Ok(())
}

/// Pads or truncates a label into the 11-byte space-filled FAT form.
pub fn fat_label(label: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    for (slot, byte) in out
        .iter_mut()
        .zip(label.bytes().filter(u8::is_ascii).map(|b| b.to_ascii_uppercase()))
    {
        *slot = byte;
    }
    out
}

fn format_fat32(dev: &mut dyn BlockDevice, spec: &PartitionSpec) -> Result<()> {
    let mut region = Region::new(dev, spec.start_offset_bytes, spec.size_bytes);
    let mut options = fatfs::FormatVolumeOptions::new().volume_label(fat_label(&spec.label));
    if spec.size_bytes >= FAT32_MIN_BYTES {
        options = options.fat_type(fatfs::FatType::Fat32);
    }
    fatfs::format_volume(&mut region, options).map_err(Error::format)?;
    region.sync()?;
    Ok(())
}

fn mkfs_command(fs: FileSystem, node: &Path, label: &str, quick: bool) -> Command {
    let mut cmd = match fs {
        FileSystem::Ntfs => {
            let mut cmd = Command::new("mkfs.ntfs");
            cmd.arg("-F").arg("-L").arg(label);
            if quick {
                cmd.arg("-Q");
            }
            cmd
        }
        FileSystem::ExFat => {
            let mut cmd = Command::new("mkfs.exfat");
            cmd.arg("-L").arg(label);
            cmd
        }
        _ => {
            let mut cmd = Command::new("mkfs.ext4");
            cmd.arg("-F").arg("-q").arg("-L").arg(label);
            if quick {
                cmd.arg("-E").arg("lazy_itable_init=1,lazy_journal_init=1");
            }
            cmd
        }
    };
    cmd.arg(node);
    cmd
}

fn run_mkfs(fs: FileSystem, node: &Path, label: &str, quick: bool) -> Result<()> {
    let mut cmd = mkfs_command(fs, node, label, quick);
    debug!("running {cmd:?}");
    let output = cmd
        .output()
        .map_err(|e| Error::format(format!("cannot run {:?}: {e}", cmd.get_program())))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::format(format!(
            "{:?} exited with {}: {}",
            cmd.get_program(),
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

impl Formatter for StandardFormatter {
    fn write_partition_table(&self, dev: &mut dyn BlockDevice, plan: &PartitionPlan) -> Result<()> {
        let cancel = CancelToken::new();
        let head = plan.system().start_offset_bytes;
        zero_fill(dev, 0, head, &cancel)?;
        if plan.device_bytes > head + MIB {
            zero_fill(dev, plan.device_bytes - MIB, MIB, &cancel)?;
        }

        for (offset, bytes) in table::build(plan)? {
            dev.seek(SeekFrom::Start(offset))?;
            dev.write_all(&bytes)
                .map_err(|source| Error::WriteFault { offset, source })?;
        }
        dev.sync()?;

        if let Err(e) = dev.reread_partitions() {
            warn!("kernel did not re-read the partition table: {e}");
        }
        info!("wrote {:?} partition table with {} entries", plan.scheme, plan.specs.len());
        Ok(())
    }

    fn format_partition(
        &self,
        dev: &mut dyn BlockDevice,
        device: &Device,
        index: usize,
        spec: &PartitionSpec,
        quick: bool,
        cancel: &CancelToken,
    ) -> Result<()> {
        info!("formatting partition {index} ({}) as {}", spec.role, spec.file_system);
        if !quick {
            zero_fill(dev, spec.start_offset_bytes, spec.size_bytes, cancel)?;
        }
        match spec.file_system {
            FileSystem::Fat32 => format_fat32(dev, spec),
            fs => {
                dev.sync()?;
                let node = platform::partition_path(&device.path, index);
                run_mkfs(fs, &node, &spec.label, quick)
            }
        }
    }
}
