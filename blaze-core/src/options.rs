//! Caller-supplied settings for a write operation.
use crate::error::{Error, Result};
use std::fmt;
use std::path::PathBuf;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionScheme {
    Mbr,
    Gpt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileSystem {
    Fat32,
    Ntfs,
    ExFat,
    Ext4,
}

impl FileSystem {
    /// Allocation granularity used when sizing a partition for this filesystem.
    pub fn cluster_bytes(self) -> u64 {
        match self {
            FileSystem::Fat32 => 32 * 1024,
            FileSystem::Ntfs => 4 * 1024,
            FileSystem::ExFat => 128 * 1024,
            FileSystem::Ext4 => 4 * 1024,
        }
    }

    /// Longest volume label the on-disk format can store.
    pub fn max_label_len(self) -> usize {
        match self {
            FileSystem::Fat32 | FileSystem::ExFat => 11,
            FileSystem::Ext4 => 16,
            FileSystem::Ntfs => 32,
        }
    }
}

impl fmt::Display for FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileSystem::Fat32 => "FAT32",
            FileSystem::Ntfs => "NTFS",
            FileSystem::ExFat => "exFAT",
            FileSystem::Ext4 => "EXT4",
        })
    }
}

/// Firmware a written device should boot under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirmwareTarget {
    Bios,
    Uefi,
    Hybrid,
}

impl FirmwareTarget {
    pub fn supports_uefi(self) -> bool {
        matches!(self, FirmwareTarget::Uefi | FirmwareTarget::Hybrid)
    }

    pub fn supports_bios(self) -> bool {
        matches!(self, FirmwareTarget::Bios | FirmwareTarget::Hybrid)
    }
}

impl fmt::Display for FirmwareTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FirmwareTarget::Bios => "BIOS",
            FirmwareTarget::Uefi => "UEFI",
            FirmwareTarget::Hybrid => "Hybrid",
        })
    }
}

/// Settings for one write operation. Immutable once the operation starts.
#[derive(Clone, Debug)]
pub struct OperationOptions {
    pub partition_scheme: PartitionScheme,
    /// Filesystem of the system partition.
    pub file_system: FileSystem,
    pub volume_label: String,
    pub quick_format: bool,
    pub verify_after_write: bool,
    pub create_persistent: bool,
    pub persistent_size_bytes: u64,
    pub create_recovery: bool,
    pub recovery_size_bytes: u64,
    /// Extra images, each written raw into its own partition.
    pub multiboot_images: Vec<PathBuf>,
    /// `None` means "whatever the source image supports".
    pub firmware_target: Option<FirmwareTarget>,
    pub enable_secure_boot: bool,
    /// EFI loader copied to `EFI/BOOT` when the system partition lacks one.
    pub efi_loader: Option<PathBuf>,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            partition_scheme: PartitionScheme::Mbr,
            file_system: FileSystem::Fat32,
            volume_label: "BLAZE".to_string(),
            quick_format: true,
            verify_after_write: true,
            create_persistent: false,
            persistent_size_bytes: 4 * GIB,
            create_recovery: false,
            recovery_size_bytes: 512 * MIB,
            multiboot_images: Vec::new(),
            firmware_target: None,
            enable_secure_boot: false,
            efi_loader: None,
        }
    }
}

impl OperationOptions {
    /// Checks the options against themselves. Device and image checks happen in
    /// the orchestrator.
    pub fn validate(&self) -> Result<()> {
        let label_len = self.volume_label.chars().count();
        if label_len > self.file_system.max_label_len() {
            return Err(Error::validation(format!(
                "volume label '{}' is longer than {} characters allowed by {}",
                self.volume_label,
                self.file_system.max_label_len(),
                self.file_system
            )));
        }
        if self.file_system == FileSystem::Fat32 && !self.volume_label.is_ascii() {
            return Err(Error::validation("FAT32 volume labels must be ASCII"));
        }
        if self.create_persistent && self.persistent_size_bytes == 0 {
            return Err(Error::validation("persistent partition size must be > 0"));
        }
        if self.create_recovery && self.recovery_size_bytes == 0 {
            return Err(Error::validation("recovery partition size must be > 0"));
        }
        if self.partition_scheme == PartitionScheme::Gpt
            && self.firmware_target == Some(FirmwareTarget::Bios)
        {
            return Err(Error::validation(
                "GPT partitioning is UEFI only; choose MBR for BIOS targets",
            ));
        }
        if self.enable_secure_boot
            && matches!(self.firmware_target, Some(target) if !target.supports_uefi())
        {
            return Err(Error::validation("secure boot requires a UEFI firmware target"));
        }
        if self.efi_loader.is_some() && self.verify_after_write {
            // Copying the loader changes the system partition after the write,
            // so a read-back could never match.
            return Err(Error::validation(
                "an EFI loader copy cannot be combined with verification",
            ));
        }
        Ok(())
    }
}
