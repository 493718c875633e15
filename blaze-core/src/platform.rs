//! Operating-system glue.
//!
//! Removable-disk discovery, partition node naming and partition table
//! re-reads differ per OS. Each backend below exports the same three
//! functions: `get_removable_devices`, `partition_path` and
//! `reread_partition_table`.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::*;
