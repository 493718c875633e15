//! Raw block-device handles and partition windows.
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// A readable, writable, seekable handle on a whole device.
///
/// `sync` must not return until every byte the handle accepted is durable;
/// `flush` alone is not enough for a `File`.
pub trait BlockDevice: Read + Write + Seek + Send {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }

    /// Makes the operating system pick up a partition table just written.
    fn reread_partitions(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlockDevice for File {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }

    fn reread_partitions(&mut self) -> io::Result<()> {
        crate::platform::reread_partition_table(self)
    }
}

impl BlockDevice for Cursor<Vec<u8>> {}

impl<T: BlockDevice + ?Sized> BlockDevice for Box<T> {
    fn sync(&mut self) -> io::Result<()> {
        (**self).sync()
    }

    fn reread_partitions(&mut self) -> io::Result<()> {
        (**self).reread_partitions()
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn sync(&mut self) -> io::Result<()> {
        (**self).sync()
    }

    fn reread_partitions(&mut self) -> io::Result<()> {
        (**self).reread_partitions()
    }
}

/// A window onto `len` bytes of a device starting at `start`.
///
/// All positions are relative to the window. Reads stop at the end of the
/// window and writes past it fail with [`io::ErrorKind::WriteZero`], so a
/// partition can never spill into its neighbour.
pub struct Region<T> {
    inner: T,
    start: u64,
    len: u64,
    position: u64,
}

impl<T: Seek> Region<T> {
    pub fn new(inner: T, start: u64, len: u64) -> Self {
        Self {
            inner,
            start,
            len,
            position: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.position)
    }

    fn seek_inner(&mut self) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(self.start + self.position))?;
        Ok(())
    }
}

impl<T: Read + Seek> Read for Region<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (buf.len() as u64).min(self.remaining()) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.seek_inner()?;
        let read = self.inner.read(&mut buf[..n])?;
        self.position += read as u64;
        Ok(read)
    }
}

impl<T: Write + Seek> Write for Region<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(self.remaining()) as usize;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write past the end of the partition",
            ));
        }
        self.seek_inner()?;
        let written = self.inner.write(&buf[..n])?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<T: Seek> Seek for Region<T> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative position",
            )
        })?;
        self.position = target;
        Ok(target)
    }
}

impl<T: BlockDevice> BlockDevice for Region<T> {
    fn sync(&mut self) -> io::Result<()> {
        self.inner.sync()
    }
}
