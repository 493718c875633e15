//! Whole-device backup and restore, and a destructive speed test.
//!
//! These work on an entire device rather than a partition plan, so they sit
//! beside the orchestrator instead of inside it. Cancellation surfaces as a
//! [`crate::Error::Cancelled`] inside the `anyhow` error, which callers can
//! recover with `downcast_ref`.
use crate::cancel::CancelToken;
use crate::error::Error;
use crate::os_options::{AlignedBuffer, DIRECT_IO, OpenOptionsExt};
use crate::verify::Verifier;
use crate::writer::{BlockWriter, DEFAULT_CHUNK_SIZE};
use anyhow::{Context, Result};
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Instant;

/// Bytes written and read back by [`speed_test`] unless told otherwise.
pub const SPEED_TEST_BYTES: u64 = 50 * 1024 * 1024;

#[cfg(target_os = "linux")]
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// The stage a backup, restore or speed test is reporting progress for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Reading,
    Writing,
    Verifying,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RestoreReport {
    pub bytes_written: u64,
    /// Set when the restore was verified.
    pub source_sha256: Option<[u8; 32]>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpeedReport {
    pub bytes: u64,
    pub write_mb_per_s: f64,
    pub read_mb_per_s: f64,
}

#[cfg(unix)]
fn is_block_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path).is_ok_and(|m| m.file_type().is_block_device())
}

#[cfg(windows)]
fn is_block_device(path: &Path) -> bool {
    path.to_string_lossy().starts_with(r"\\.\")
}

/// Opens `path` for reading, bypassing the page cache when it is a device.
fn open_for_read(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    if is_block_device(path) {
        options.custom_flags(DIRECT_IO);
    }
    options
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))
}

fn open_for_write(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open {} for writing", path.display()))
}

#[cfg(target_os = "linux")]
fn block_device_size(file: &mut File) -> Result<u64> {
    use std::os::unix::io::AsRawFd;
    let mut size: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
    unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }
        .context("Failed to query the device size")?;
    Ok(size)
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(file: &mut File) -> Result<u64> {
    let size = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(size)
}

/// Size in bytes of a device or, for tests and loop-back use, a regular file.
fn device_size(file: &mut File) -> Result<u64> {
    let meta = file.metadata()?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    block_device_size(file)
}

/// Copies the whole of `device_path` into a new image file at `image_path`.
///
/// A cancelled backup removes the partial image. Returns the bytes copied.
pub fn backup<F>(
    device_path: &Path,
    image_path: &Path,
    cancel: &CancelToken,
    on_start: impl FnOnce(u64),
    mut on_progress: F,
) -> Result<u64>
where
    F: FnMut(Stage, u64, u64),
{
    let mut device_file = open_for_read(device_path)?;
    let size_bytes = device_size(&mut device_file)?;
    if size_bytes == 0 {
        anyhow::bail!("Device size is reported as zero");
    }
    on_start(size_bytes);

    let mut image_file = File::create(image_path)
        .with_context(|| format!("Failed to create {}", image_path.display()))?;
    let mut buffer = AlignedBuffer::new(DEFAULT_CHUNK_SIZE);
    let buffer = buffer.as_mut_slice();

    let mut read_total: u64 = 0;
    while read_total < size_bytes {
        if cancel.is_cancelled() {
            drop(image_file);
            std::fs::remove_file(image_path)?;
            return Err(Error::Cancelled.into());
        }

        let to_read = (size_bytes - read_total).min(DEFAULT_CHUNK_SIZE as u64) as usize;
        device_file
            .read_exact(&mut buffer[..to_read])
            .with_context(|| format!("Read failed at offset {read_total}"))?;
        image_file.write_all(&buffer[..to_read])?;

        read_total += to_read as u64;
        on_progress(Stage::Reading, read_total, size_bytes);
    }

    image_file.flush()?;
    image_file.sync_all()?;
    info!("backed up {read_total} bytes from {}", device_path.display());
    Ok(read_total)
}

/// Writes `image_path` over the start of `device_path`, then optionally reads
/// it back and compares.
pub fn restore<F>(
    image_path: &Path,
    device_path: &Path,
    verify: bool,
    cancel: &CancelToken,
    mut on_progress: F,
) -> Result<RestoreReport>
where
    F: FnMut(Stage, u64, u64),
{
    let mut image = File::open(image_path).map_err(|source| Error::NotFound {
        path: image_path.to_path_buf(),
        source,
    })?;
    let image_len = image.metadata()?.len();

    let mut device = open_for_write(device_path)?;
    let device_len = device_size(&mut device)?;
    if image_len > device_len {
        return Err(Error::InsufficientSpace {
            required: image_len,
            available: device_len,
        }
        .into());
    }

    let written = BlockWriter::default().transfer(
        &mut image,
        &mut device,
        image_len,
        cancel,
        |done, total| on_progress(Stage::Writing, done, total),
    )?;
    debug!("restored {written} bytes to {}", device_path.display());

    let mut source_sha256 = None;
    if verify {
        let verification = Verifier::default().verify_with_digest(
            &mut image,
            &mut device,
            written,
            cancel,
            |done, total| on_progress(Stage::Verifying, done, total),
        )?;
        if !verification.matched {
            return Err(Error::VerificationMismatch.into());
        }
        source_sha256 = verification.source_sha256;
    }

    Ok(RestoreReport {
        bytes_written: written,
        source_sha256,
    })
}

/// Measures sequential write and read throughput over the first `bytes` of
/// the device. This destroys whatever those bytes held.
pub fn speed_test<F>(
    device_path: &Path,
    bytes: u64,
    cancel: &CancelToken,
    mut on_progress: F,
) -> Result<SpeedReport>
where
    F: FnMut(Stage, u64, u64),
{
    let mut device = open_for_write(device_path)?;
    let bytes = bytes.min(device_size(&mut device)?);
    if bytes == 0 {
        anyhow::bail!("Device size is reported as zero");
    }

    let started = Instant::now();
    BlockWriter::default().transfer(
        &mut io::repeat(0xA5).take(bytes),
        &mut device,
        bytes,
        cancel,
        |done, total| on_progress(Stage::Writing, done, total),
    )?;
    let write_secs = started.elapsed().as_secs_f64();
    drop(device);

    let mut reader = open_for_read(device_path)?;
    reader.seek(SeekFrom::Start(0))?;
    let mut buffer = AlignedBuffer::new(DEFAULT_CHUNK_SIZE);
    let buffer = buffer.as_mut_slice();
    let started = Instant::now();
    let mut read_total: u64 = 0;
    while read_total < bytes {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        let to_read = (bytes - read_total).min(DEFAULT_CHUNK_SIZE as u64) as usize;
        reader.read_exact(&mut buffer[..to_read])?;
        read_total += to_read as u64;
        on_progress(Stage::Reading, read_total, bytes);
    }
    let read_secs = started.elapsed().as_secs_f64();

    let rate = |secs: f64| bytes as f64 / 1_000_000.0 / secs.max(f64::EPSILON);
    Ok(SpeedReport {
        bytes,
        write_mb_per_s: rate(write_secs),
        read_mb_per_s: rate(read_secs),
    })
}
