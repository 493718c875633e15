//! Read-back verification of a written device.
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::writer::{DEFAULT_CHUNK_SIZE, read_full};
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::io::{self, Read, Seek, SeekFrom};

/// Result of a verification pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verification {
    pub matched: bool,
    pub bytes_compared: u64,
    /// SHA-256 of the source bytes compared. Only set when the pass matched.
    pub source_sha256: Option<[u8; 32]>,
}

/// Compares a source stream with what a device holds, chunk by chunk.
#[derive(Clone, Copy, Debug)]
pub struct Verifier {
    chunk_size: usize,
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl Verifier {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Returns `Ok(false)` on the first differing byte. Either stream failing
    /// to read, or a device that ends before the source does, is an
    /// [`Error::Verification`].
    pub fn verify<S, D>(
        &self,
        source: &mut S,
        device: &mut D,
        total_bytes: u64,
        cancel: &CancelToken,
        on_progress: impl FnMut(u64, u64),
    ) -> Result<bool>
    where
        S: Read + Seek + ?Sized,
        D: Read + Seek + ?Sized,
    {
        self.verify_with_digest(source, device, total_bytes, cancel, on_progress)
            .map(|v| v.matched)
    }

    /// Like [`Verifier::verify`], also hashing the source as it goes.
    ///
    /// Both streams are rewound to their start first. At most `total_bytes`
    /// are compared; a shorter source bounds the comparison.
    pub fn verify_with_digest<S, D>(
        &self,
        source: &mut S,
        device: &mut D,
        total_bytes: u64,
        cancel: &CancelToken,
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<Verification>
    where
        S: Read + Seek + ?Sized,
        D: Read + Seek + ?Sized,
    {
        source
            .seek(SeekFrom::Start(0))
            .map_err(Error::Verification)?;
        device
            .seek(SeekFrom::Start(0))
            .map_err(Error::Verification)?;

        let mut source_buf = vec![0u8; self.chunk_size];
        let mut device_buf = vec![0u8; self.chunk_size];
        let mut hasher = Sha256::new();
        let mut compared: u64 = 0;

        while compared < total_bytes {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let want = (total_bytes - compared).min(self.chunk_size as u64) as usize;
            let n = read_full(source, &mut source_buf[..want]).map_err(Error::Verification)?;
            if n == 0 {
                break;
            }

            let got = read_full(device, &mut device_buf[..n]).map_err(Error::Verification)?;
            if got < n {
                return Err(Error::Verification(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("device ended after {} bytes", compared + got as u64),
                )));
            }

            if source_buf[..n] != device_buf[..n] {
                let at = source_buf[..n]
                    .iter()
                    .zip(&device_buf[..n])
                    .position(|(a, b)| a != b)
                    .unwrap_or(0);
                info!("verification mismatch at byte {}", compared + at as u64);
                return Ok(Verification {
                    matched: false,
                    bytes_compared: compared + at as u64,
                    source_sha256: None,
                });
            }

            hasher.update(&source_buf[..n]);
            compared += n as u64;
            on_progress(compared, total_bytes);

            if n < want {
                break;
            }
        }

        debug!("verified {compared} bytes");
        Ok(Verification {
            matched: true,
            bytes_compared: compared,
            source_sha256: Some(hasher.finalize().into()),
        })
    }
}

/// Lowercase hex rendering of a digest.
pub fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
