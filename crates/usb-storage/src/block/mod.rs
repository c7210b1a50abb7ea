//! Block device abstraction and the byte stream the FAT driver mounts.
//!
//! A `BlockDevice` reads whole logical blocks. `BlockStream` turns a window of
//! blocks (one partition) into a `Read + Seek` byte stream. Writes are refused:
//! USB storage is mounted read-only.

pub mod partition;

use log::{debug, warn};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Upper bound for a single direct read into the caller's buffer.
const MAX_DIRECT_READ_BYTES: usize = 64 * 1024;

/// A device that reads fixed-size logical blocks.
pub trait BlockDevice: Send {
    /// Logical block size in bytes (usually 512).
    fn block_size(&self) -> u32;

    /// Number of logical blocks on the device.
    fn block_count(&self) -> u64;

    /// Reads `buf.len() / block_size` blocks starting at `lba`.
    /// `buf.len()` must be a multiple of the block size.
    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Releases the underlying handle. Calling it twice must be harmless.
    fn close(&mut self) -> io::Result<()>;
}

/// Read-only byte stream over a range of blocks.
pub struct BlockStream {
    device: Box<dyn BlockDevice>,
    first_lba: u64,
    len: u64,
    pos: u64,
    cached_lba: Option<u64>,
    cache: Vec<u8>,
    closed: bool,
}

impl BlockStream {
    /// Creates a stream over `block_count` blocks starting at `first_lba`.
    pub fn new(device: Box<dyn BlockDevice>, first_lba: u64, block_count: u64) -> Self {
        let block_size = device.block_size();
        Self {
            len: block_count * u64::from(block_size),
            cache: vec![0; block_size as usize],
            device,
            first_lba,
            pos: 0,
            cached_lba: None,
            closed: false,
        }
    }

    /// Length of the window in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Closes the underlying device. Idempotent.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("Closing block device");
        self.device.close()
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "block device is closed"));
        }
        Ok(())
    }

    fn fill_cache(&mut self, lba: u64) -> io::Result<()> {
        if self.cached_lba == Some(lba) {
            return Ok(());
        }
        self.cached_lba = None;
        self.device.read_blocks(self.first_lba + lba, &mut self.cache)?;
        self.cached_lba = Some(lba);
        Ok(())
    }
}

impl Read for BlockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        if buf.is_empty() || self.pos >= self.len {
            return Ok(0);
        }

        let block_size = self.cache.len();
        let available = (self.len - self.pos).min(buf.len() as u64) as usize;
        let lba = self.pos / block_size as u64;
        let offset = (self.pos % block_size as u64) as usize;

        // Aligned and at least one whole block: skip the cache
        if offset == 0 && available >= block_size {
            let direct = (available.min(MAX_DIRECT_READ_BYTES) / block_size) * block_size;
            self.device.read_blocks(self.first_lba + lba, &mut buf[..direct])?;
            self.pos += direct as u64;
            return Ok(direct);
        }

        self.fill_cache(lba)?;
        let count = available.min(block_size - offset);
        buf[..count].copy_from_slice(&self.cache[offset..offset + count]);
        self.pos += count as u64;
        Ok(count)
    }
}

impl Seek for BlockStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(position) => {
                self.pos = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the partition",
            )),
        }
    }
}

impl Write for BlockStream {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "USB storage is mounted read-only",
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for BlockStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Ignoring error while closing block device: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Block device over a byte vector that counts reads and closes.
    struct VecDevice {
        data: Vec<u8>,
        block_size: u32,
        reads: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl BlockDevice for VecDevice {
        fn block_size(&self) -> u32 {
            self.block_size
        }

        fn block_count(&self) -> u64 {
            self.data.len() as u64 / u64::from(self.block_size)
        }

        fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
            assert_eq!(buf.len() % self.block_size as usize, 0, "unaligned block read");
            self.reads.fetch_add(1, Ordering::SeqCst);
            let start = lba as usize * self.block_size as usize;
            buf.copy_from_slice(&self.data[start..start + buf.len()]);
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn stream(data: Vec<u8>, first_lba: u64, blocks: u64) -> (BlockStream, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let device = VecDevice {
            data,
            block_size: 512,
            reads: Arc::clone(&reads),
            closes: Arc::clone(&closes),
        };
        (BlockStream::new(Box::new(device), first_lba, blocks), reads, closes)
    }

    #[test]
    fn test_reads_window_at_offset() {
        let data = patterned(512 * 8);
        let (mut s, _, _) = stream(data.clone(), 2, 4);
        assert_eq!(s.len(), 2048);

        let mut out = Vec::new();
        s.read_to_end(&mut out).unwrap();
        assert_eq!(out, data[1024..3072]);
    }

    #[test]
    fn test_unaligned_reads_use_cache() {
        let data = patterned(512 * 4);
        let (mut s, reads, _) = stream(data.clone(), 0, 4);

        s.seek(SeekFrom::Start(10)).unwrap();
        let mut a = [0u8; 20];
        s.read_exact(&mut a).unwrap();
        let mut b = [0u8; 20];
        s.read_exact(&mut b).unwrap();
        assert_eq!(&a, &data[10..30]);
        assert_eq!(&b, &data[30..50]);
        // Both reads hit the same cached block
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_spanning_block_boundary() {
        let data = patterned(512 * 4);
        let (mut s, _, _) = stream(data.clone(), 0, 4);
        s.seek(SeekFrom::Start(500)).unwrap();
        let mut out = [0u8; 100];
        s.read_exact(&mut out).unwrap();
        assert_eq!(&out[..], &data[500..600]);
    }

    #[test]
    fn test_seek_variants() {
        let (mut s, _, _) = stream(patterned(2048), 0, 4);
        assert_eq!(s.seek(SeekFrom::End(-48)).unwrap(), 2000);
        assert_eq!(s.seek(SeekFrom::Current(8)).unwrap(), 2008);
        assert!(s.seek(SeekFrom::Current(-5000)).is_err());
        // Reading past the end yields EOF
        s.seek(SeekFrom::Start(4096)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(s.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_writes_are_refused() {
        let (mut s, _, _) = stream(patterned(512), 0, 1);
        let err = s.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_close_is_idempotent_and_drop_closes_once() {
        let (mut s, _, closes) = stream(patterned(512), 0, 1);
        s.close().unwrap();
        s.close().unwrap();
        drop(s);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let (s, _, closes) = stream(patterned(512), 0, 1);
        drop(s);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_after_close_fails() {
        let (mut s, _, _) = stream(patterned(512), 0, 1);
        s.close().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(s.read(&mut buf).unwrap_err().kind(), io::ErrorKind::NotConnected);
    }
}
