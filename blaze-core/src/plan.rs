//! Partition layout planning.
//!
//! The planner is pure: it reads a device snapshot, the inspected images and
//! the options, and produces offsets and sizes. Nothing is written here.
use crate::device::Device;
use crate::error::{Error, Result};
use crate::image::SourceImage;
use crate::options::{FileSystem, MIB, OperationOptions, PartitionScheme};
use log::{debug, warn};
use std::fmt;

/// Partition starts are aligned to this boundary by default.
pub const DEFAULT_ALIGNMENT: u64 = MIB;

/// Space kept free at the end of the device for the backup GPT.
const GPT_TAIL_RESERVE: u64 = MIB;

/// Primary partition slots available in an MBR.
const MBR_SLOTS: usize = 4;

/// MBR entries count 512-byte sectors in 32 bits.
pub const MBR_ADDRESSABLE_BYTES: u64 = (u32::MAX as u64 + 1) * 512;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionRole {
    System,
    Persistent,
    Recovery,
    /// The n-th extra image (1-based).
    MultiBoot(usize),
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionRole::System => f.write_str("system"),
            PartitionRole::Persistent => f.write_str("persistent"),
            PartitionRole::Recovery => f.write_str("recovery"),
            PartitionRole::MultiBoot(n) => write!(f, "multiboot-{n}"),
        }
    }
}

/// What a partition will hold once the operation is done.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionContent {
    /// A freshly formatted, empty filesystem.
    Format(FileSystem),
    /// The raw bytes of an image, written over whatever was there.
    Image(std::path::PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionSpec {
    pub role: PartitionRole,
    pub start_offset_bytes: u64,
    pub size_bytes: u64,
    pub file_system: FileSystem,
    pub label: String,
    pub content: PartitionContent,
}

impl PartitionSpec {
    pub fn end_offset_bytes(&self) -> u64 {
        self.start_offset_bytes + self.size_bytes
    }
}

/// An ordered, non-overlapping partition layout for one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionPlan {
    pub scheme: PartitionScheme,
    pub device_bytes: u64,
    pub specs: Vec<PartitionSpec>,
    /// Auxiliary partitions that were requested but did not fit.
    pub dropped: Vec<String>,
}

impl PartitionPlan {
    pub fn system(&self) -> &PartitionSpec {
        &self.specs[0]
    }

    pub fn auxiliary(&self) -> &[PartitionSpec] {
        &self.specs[1..]
    }

    pub fn total_bytes(&self) -> u64 {
        self.specs.iter().map(|s| s.size_bytes).sum()
    }

    /// Whether specs are ordered, non-overlapping and inside the device.
    pub fn is_consistent(&self) -> bool {
        let ordered = self
            .specs
            .windows(2)
            .all(|pair| pair[0].end_offset_bytes() <= pair[1].start_offset_bytes);
        let inside = self
            .specs
            .last()
            .is_none_or(|last| last.end_offset_bytes() <= self.device_bytes);
        ordered && inside && self.total_bytes() <= self.device_bytes
    }
}

type Candidate = (PartitionRole, u64, FileSystem, String, PartitionContent);

/// Rounds `value` up to a multiple of `alignment`; `None` on overflow.
fn align_up(value: u64, alignment: u64) -> Option<u64> {
    value.checked_next_multiple_of(alignment)
}

/// Computes partition layouts.
#[derive(Clone, Copy, Debug)]
pub struct PartitionPlanner {
    alignment: u64,
}

impl Default for PartitionPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_ALIGNMENT)
    }
}

impl PartitionPlanner {
    pub fn new(alignment: u64) -> Self {
        Self {
            alignment: alignment.max(512),
        }
    }

    pub fn plan(
        &self,
        device: &Device,
        image: &SourceImage,
        options: &OperationOptions,
    ) -> Result<PartitionPlan> {
        self.plan_with_extras(device, image, &[], options)
    }

    /// Plans the system partition for `image` followed by the requested
    /// auxiliary partitions, `extras` being the inspected multi-boot images.
    ///
    /// Auxiliary partitions that do not fit are dropped, multi-boot extras
    /// first (last one first), then recovery, then persistent storage. Only a
    /// system partition that does not fit is an error. With MBR, "fits" also
    /// means ending within [`MBR_ADDRESSABLE_BYTES`].
    pub fn plan_with_extras(
        &self,
        device: &Device,
        image: &SourceImage,
        extras: &[SourceImage],
        options: &OperationOptions,
    ) -> Result<PartitionPlan> {
        let first = self.alignment;
        let end_reserve = match options.partition_scheme {
            PartitionScheme::Mbr => 0,
            PartitionScheme::Gpt => GPT_TAIL_RESERVE,
        };
        let mut usable_end = device.total_bytes.saturating_sub(end_reserve);
        if options.partition_scheme == PartitionScheme::Mbr {
            usable_end = usable_end.min(MBR_ADDRESSABLE_BYTES);
        }

        let fs = options.file_system;
        let system_size = align_up(image.total_bytes.max(1), fs.cluster_bytes());
        let required = system_size
            .and_then(|size| size.checked_add(first))
            .and_then(|end| end.checked_add(end_reserve));
        let Some((system_size, required)) = system_size.zip(required) else {
            return Err(Error::InsufficientSpace {
                required: u64::MAX,
                available: device.total_bytes,
            });
        };
        if device.total_bytes < image.total_bytes || required > device.total_bytes {
            return Err(Error::InsufficientSpace {
                required,
                available: device.total_bytes,
            });
        }
        let system_end = first + system_size;
        if options.partition_scheme == PartitionScheme::Mbr && system_end > MBR_ADDRESSABLE_BYTES {
            return Err(Error::MbrLimit {
                end: system_end,
                limit: MBR_ADDRESSABLE_BYTES,
            });
        }

        let system = PartitionSpec {
            role: PartitionRole::System,
            start_offset_bytes: first,
            size_bytes: system_size,
            file_system: fs,
            label: options.volume_label.clone(),
            content: PartitionContent::Format(fs),
        };

        // Candidates in placement order; dropping walks this list backwards.
        let mut wanted: Vec<Candidate> = Vec::new();
        if options.create_persistent {
            wanted.push((
                PartitionRole::Persistent,
                options.persistent_size_bytes,
                FileSystem::Ext4,
                "persistence".to_string(),
                PartitionContent::Format(FileSystem::Ext4),
            ));
        }
        if options.create_recovery {
            wanted.push((
                PartitionRole::Recovery,
                options.recovery_size_bytes,
                FileSystem::Fat32,
                "RECOVERY".to_string(),
                PartitionContent::Format(FileSystem::Fat32),
            ));
        }
        for (i, extra) in extras.iter().enumerate() {
            wanted.push((
                PartitionRole::MultiBoot(i + 1),
                extra.total_bytes,
                fs,
                extra.label.clone().unwrap_or_else(|| format!("MULTI{}", i + 1)),
                PartitionContent::Image(extra.path.clone()),
            ));
        }

        let mut dropped = Vec::new();
        if options.partition_scheme == PartitionScheme::Mbr {
            while wanted.len() + 1 > MBR_SLOTS {
                if let Some((role, ..)) = wanted.pop() {
                    dropped.push(format!("{role} partition dropped: MBR holds four partitions"));
                }
            }
        }

        let place = |wanted: &[Candidate]| -> Option<Vec<(u64, u64)>> {
            let mut end = system_end;
            let mut placed = Vec::with_capacity(wanted.len());
            for (_, size, fs, ..) in wanted {
                let start = align_up(end, self.alignment)?;
                let size = align_up(*size, fs.cluster_bytes())?;
                end = start.checked_add(size)?;
                placed.push((start, size));
            }
            (end <= usable_end).then_some(placed)
        };

        let placed = loop {
            if let Some(placed) = place(&wanted) {
                break placed;
            }
            let Some((role, size, ..)) = wanted.pop() else {
                break Vec::new();
            };
            warn!("not enough space for the {role} partition ({size} bytes), dropping it");
            dropped.push(format!("{role} partition dropped: not enough space"));
        };

        let mut specs = vec![system];
        for ((role, _, file_system, label, content), (start, size)) in wanted.into_iter().zip(placed) {
            specs.push(PartitionSpec {
                role,
                start_offset_bytes: start,
                size_bytes: size,
                file_system,
                label,
                content,
            });
        }

        let plan = PartitionPlan {
            scheme: options.partition_scheme,
            device_bytes: device.total_bytes,
            specs,
            dropped,
        };
        for spec in &plan.specs {
            debug!(
                "plan: {} at {} (+{} bytes, {})",
                spec.role, spec.start_offset_bytes, spec.size_bytes, spec.file_system
            );
        }
        Ok(plan)
    }
}
