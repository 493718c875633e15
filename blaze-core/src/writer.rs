//! Chunked, cancellable transfer of an image onto a block device.
use crate::block::BlockDevice;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use log::{debug, warn};
use std::io::{self, Read};

/// 1 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Reads until `buf` is full or the reader reports end of input.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Copies bytes from a source stream to a device in fixed-size chunks.
///
/// Progress is reported and the cancel token is polled once per chunk. The
/// destination is synced before returning, whether the transfer finished or was
/// cancelled. A failed device write is reported as [`Error::WriteFault`] and
/// never retried.
#[derive(Clone, Copy, Debug)]
pub struct BlockWriter {
    chunk_size: usize,
}

impl Default for BlockWriter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl BlockWriter {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Transfers up to `total_bytes` from `source` to `dest`, starting at the
    /// current positions of both.
    ///
    /// A source that ends early is not an error: the returned count is simply
    /// smaller than `total_bytes`. `on_progress` receives `(written, total)`.
    pub fn transfer<R, W, F>(
        &self,
        source: &mut R,
        dest: &mut W,
        total_bytes: u64,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> Result<u64>
    where
        R: Read + ?Sized,
        W: BlockDevice + ?Sized,
        F: FnMut(u64, u64),
    {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut written: u64 = 0;

        while written < total_bytes {
            if cancel.is_cancelled() {
                debug!("transfer cancelled after {written} bytes");
                if let Err(e) = dest.sync() {
                    warn!("sync after cancel failed: {e}");
                }
                return Err(Error::Cancelled);
            }

            let want = (total_bytes - written).min(self.chunk_size as u64) as usize;
            let n = read_full(source, &mut buffer[..want])?;
            if n == 0 {
                debug!("source ended after {written} of {total_bytes} bytes");
                break;
            }

            dest.write_all(&buffer[..n])
                .map_err(|source| Error::WriteFault {
                    offset: written,
                    source,
                })?;
            written += n as u64;
            on_progress(written, total_bytes);

            if n < want {
                break;
            }
        }

        dest.sync().map_err(|source| Error::WriteFault {
            offset: written,
            source,
        })?;
        Ok(written)
    }
}
