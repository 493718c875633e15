//! MBR and GPT partition table serialisation.
//!
//! Tables are built in memory as a list of `(byte offset, bytes)` writes, so
//! the formatter can put them on the device in one pass and tests can inspect
//! them without a device.
use crate::error::{Error, Result};
use crate::options::{FileSystem, PartitionScheme};
use crate::plan::{MBR_ADDRESSABLE_BYTES, PartitionPlan, PartitionRole};
use crc32fast::Hasher;
use uuid::Uuid;

pub const SECTOR_SIZE: u64 = 512;

const MBR_TABLE_OFFSET: usize = 446;
const MBR_DISK_SIGNATURE_OFFSET: usize = 440;
const MBR_PROTECTIVE_TYPE: u8 = 0xEE;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_REVISION: u32 = 0x0001_0000;
const GPT_HEADER_SIZE: u32 = 92;
const GPT_ENTRY_COUNT: u32 = 128;
const GPT_ENTRY_SIZE: u32 = 128;
/// Sectors occupied by the partition entry array.
const GPT_ENTRY_SECTORS: u64 = (GPT_ENTRY_COUNT * GPT_ENTRY_SIZE) as u64 / SECTOR_SIZE;

const BASIC_DATA: Uuid = Uuid::from_u128(0xEBD0A0A2_B9E5_4433_87C0_68B6B72699C7);
const LINUX_FILESYSTEM: Uuid = Uuid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4);

/// A single write the formatter must perform.
pub type TableWrite = (u64, Vec<u8>);

/// MBR partition type byte for a filesystem.
pub fn mbr_type(fs: FileSystem) -> u8 {
    match fs {
        FileSystem::Fat32 => 0x0C,
        FileSystem::Ntfs | FileSystem::ExFat => 0x07,
        FileSystem::Ext4 => 0x83,
    }
}

fn gpt_type(fs: FileSystem) -> Uuid {
    match fs {
        FileSystem::Ext4 => LINUX_FILESYSTEM,
        _ => BASIC_DATA,
    }
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn mbr_entry(sector: &mut [u8; 512], slot: usize, bootable: bool, kind: u8, lba: u32, count: u32) {
    let at = MBR_TABLE_OFFSET + slot * 16;
    let entry = &mut sector[at..at + 16];
    entry[0] = if bootable { 0x80 } else { 0x00 };
    // CHS fields set to the "use LBA" sentinel.
    entry[1..4].copy_from_slice(&[0xFE, 0xFF, 0xFF]);
    entry[4] = kind;
    entry[5..8].copy_from_slice(&[0xFE, 0xFF, 0xFF]);
    put_u32(entry, 8, lba);
    put_u32(entry, 12, count);
}

fn empty_mbr(disk_signature: u32) -> [u8; 512] {
    let mut sector = [0u8; 512];
    put_u32(&mut sector, MBR_DISK_SIGNATURE_OFFSET, disk_signature);
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

/// Builds the writes that lay down `plan`'s partition table.
pub fn build(plan: &PartitionPlan) -> Result<Vec<TableWrite>> {
    let disk_id = Uuid::new_v4();
    match plan.scheme {
        PartitionScheme::Mbr => Ok(vec![(0, build_mbr(plan, disk_signature(&disk_id))?.to_vec())]),
        PartitionScheme::Gpt => Ok(build_gpt(plan, disk_id)),
    }
}

fn disk_signature(id: &Uuid) -> u32 {
    let b = id.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// A classic MBR with one entry per planned partition. The system partition
/// is marked active; boot code is left zeroed for the boot installer.
///
/// Fails with [`Error::MbrLimit`] if a partition does not fit in the 32-bit
/// sector fields.
pub fn build_mbr(plan: &PartitionPlan, disk_signature: u32) -> Result<[u8; 512]> {
    let mut sector = empty_mbr(disk_signature);
    for (slot, spec) in plan.specs.iter().take(4).enumerate() {
        let sectors = |bytes: u64| {
            u32::try_from(bytes.div_ceil(SECTOR_SIZE)).map_err(|_| Error::MbrLimit {
                end: spec.end_offset_bytes(),
                limit: MBR_ADDRESSABLE_BYTES,
            })
        };
        let lba = sectors(spec.start_offset_bytes)?;
        let count = sectors(spec.size_bytes)?;
        if u64::from(lba) + u64::from(count) > MBR_ADDRESSABLE_BYTES / SECTOR_SIZE {
            return Err(Error::MbrLimit {
                end: spec.end_offset_bytes(),
                limit: MBR_ADDRESSABLE_BYTES,
            });
        }
        mbr_entry(
            &mut sector,
            slot,
            spec.role == PartitionRole::System,
            mbr_type(spec.file_system),
            lba,
            count,
        );
    }
    Ok(sector)
}

fn gpt_entries(plan: &PartitionPlan) -> Vec<u8> {
    let mut entries = vec![0u8; (GPT_ENTRY_COUNT * GPT_ENTRY_SIZE) as usize];
    for (i, spec) in plan.specs.iter().enumerate().take(GPT_ENTRY_COUNT as usize) {
        let entry = &mut entries[i * GPT_ENTRY_SIZE as usize..(i + 1) * GPT_ENTRY_SIZE as usize];
        let first = spec.start_offset_bytes / SECTOR_SIZE;
        let last = first + spec.size_bytes.div_ceil(SECTOR_SIZE) - 1;
        entry[0..16].copy_from_slice(&gpt_type(spec.file_system).to_bytes_le());
        entry[16..32].copy_from_slice(&Uuid::new_v4().to_bytes_le());
        put_u64(entry, 32, first);
        put_u64(entry, 40, last);
        for (j, unit) in spec.label.encode_utf16().take(36).enumerate() {
            entry[56 + j * 2..58 + j * 2].copy_from_slice(&unit.to_le_bytes());
        }
    }
    entries
}

fn gpt_header(
    current: u64,
    backup: u64,
    last_usable: u64,
    entries_lba: u64,
    disk_id: Uuid,
    entries_crc: u32,
) -> Vec<u8> {
    let mut header = vec![0u8; SECTOR_SIZE as usize];
    header[0..8].copy_from_slice(GPT_SIGNATURE);
    put_u32(&mut header, 8, GPT_REVISION);
    put_u32(&mut header, 12, GPT_HEADER_SIZE);
    put_u64(&mut header, 24, current);
    put_u64(&mut header, 32, backup);
    put_u64(&mut header, 40, 2 + GPT_ENTRY_SECTORS);
    put_u64(&mut header, 48, last_usable);
    header[56..72].copy_from_slice(&disk_id.to_bytes_le());
    put_u64(&mut header, 72, entries_lba);
    put_u32(&mut header, 80, GPT_ENTRY_COUNT);
    put_u32(&mut header, 84, GPT_ENTRY_SIZE);
    put_u32(&mut header, 88, entries_crc);
    let mut hasher = Hasher::new();
    hasher.update(&header[..GPT_HEADER_SIZE as usize]);
    put_u32(&mut header, 16, hasher.finalize());
    header
}

/// Protective MBR, primary header and entries, then the backup entries and
/// header at the end of the device.
fn build_gpt(plan: &PartitionPlan, disk_id: Uuid) -> Vec<TableWrite> {
    let sectors = plan.device_bytes / SECTOR_SIZE;
    let last_lba = sectors - 1;
    let backup_entries_lba = last_lba - GPT_ENTRY_SECTORS;
    let last_usable = backup_entries_lba - 1;

    // The protective entry saturates at 0xFFFFFFFF sectors on larger disks.
    let protective_sectors = u32::try_from(sectors - 1).unwrap_or(u32::MAX);
    let mut protective = empty_mbr(0);
    mbr_entry(&mut protective, 0, false, MBR_PROTECTIVE_TYPE, 1, protective_sectors);

    let entries = gpt_entries(plan);
    let entries_crc = crc32fast::hash(&entries);
    let primary = gpt_header(1, last_lba, last_usable, 2, disk_id, entries_crc);
    let backup = gpt_header(
        last_lba,
        1,
        last_usable,
        backup_entries_lba,
        disk_id,
        entries_crc,
    );

    vec![
        (0, protective.to_vec()),
        (SECTOR_SIZE, primary),
        (2 * SECTOR_SIZE, entries.clone()),
        (backup_entries_lba * SECTOR_SIZE, entries),
        (last_lba * SECTOR_SIZE, backup),
    ]
}
