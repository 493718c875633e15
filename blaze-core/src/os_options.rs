#![allow(unused_imports)]
#[cfg(unix)]
pub(crate) use std::os::unix::fs::OpenOptionsExt;

/// Flag requesting unbuffered I/O when opening a raw device.
#[cfg(target_os = "linux")]
pub(crate) const DIRECT_IO: i32 = libc::O_DIRECT;
#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) const DIRECT_IO: i32 = 0;
#[cfg(windows)]
pub(crate) const DIRECT_IO: u32 = 0;

#[cfg(windows)]
pub(crate) trait OpenOptionsExt {
    fn custom_flags(&mut self, flags: u32) -> &mut Self;
}

#[cfg(windows)]
impl OpenOptionsExt for std::fs::OpenOptions {
    fn custom_flags(&mut self, _flags: u32) -> &mut Self {
        // FILE_FLAG_NO_BUFFERING needs a raw `CreateFileW`, which
        // `std::fs::OpenOptions` does not expose.
        self
    }
}

/// Sector size assumed for unbuffered transfers.
pub(crate) const SECTOR: usize = 512;

/// A heap buffer whose usable window starts on a sector boundary, as
/// unbuffered I/O requires.
pub(crate) struct AlignedBuffer {
    buf: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuffer {
    pub(crate) fn new(len: usize) -> Self {
        let buf = vec![0u8; len + SECTOR];
        let offset = buf.as_ptr().align_offset(SECTOR);
        Self { buf, offset, len }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..self.offset + self.len]
    }
}
