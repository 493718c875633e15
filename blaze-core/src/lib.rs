//! The core, UI-agnostic library for the `blaze` bootable-media writer.
//!
//! `blaze-core` takes a source disk image and a removable block device and
//! produces a verified, bootable copy, optionally with persistent-storage,
//! recovery and multi-boot partitions next to it. Any front-end can drive it:
//! the `blaze` command-line tool is one.
//!
//! The library is structured into several key modules:
//! - [`device`] and [`platform`]: removable-device discovery.
//! - [`image`]: image inspection (ISO-9660, raw disk, firmware and OS
//!   heuristics) and decompression of `.gz`, `.xz` and `.zst` images.
//! - [`plan`], [`table`] and [`format`]: partition layout, MBR/GPT tables and
//!   filesystem creation.
//! - [`writer`] and [`verify`]: chunked, cancellable transfer and read-back.
//! - [`boot`]: MBR bootstrap and `EFI/BOOT` installation.
//! - [`operation`]: the orchestrator that runs all of the above on a worker
//!   thread and reports through an [`operation::EventSink`].
//! - [`backup`]: whole-device backup, restore and speed test.
//!
//! ## Example: writing an image and following its progress
//!
//! ```rust,no_run
//! use blaze_core::operation::{ChannelSink, Event, Orchestrator};
//! use blaze_core::options::OperationOptions;
//! use std::path::Path;
//!
//! fn main() -> blaze_core::Result<()> {
//!     let (sink, events) = ChannelSink::bounded(64);
//!     let orchestrator = Orchestrator::new().with_sink(sink);
//!
//!     let operation = orchestrator.start(
//!         Path::new("/dev/sdb"),
//!         Path::new("path/to/distro.iso"),
//!         OperationOptions::default(),
//!     )?;
//!
//!     for event in events.iter() {
//!         match event {
//!             Event::Progress { phase, percent, .. } => println!("{phase}: {percent}%"),
//!             Event::Complete(completion) => {
//!                 println!("{:?}", completion.outcome);
//!                 for warning in &completion.warnings {
//!                     println!("warning: {warning}");
//!                 }
//!                 break;
//!             }
//!         }
//!     }
//!
//!     operation.wait();
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod block;
pub mod boot;
pub mod cancel;
pub mod device;
pub mod error;
pub mod format;
pub mod image;
pub mod operation;
pub mod options;
mod os_options;
pub mod plan;
pub mod platform;
pub mod table;
pub mod verify;
pub mod writer;

pub use error::{Error, ErrorKind, Result};
