//! Chunked file reading.

use super::navigator::{Node, resolve};
use super::StorageSession;
use crate::block::BlockStream;
use crate::error::UsbStorageError;
use fatfs::File;
use log::debug;
use std::io::Read;

/// Stream of file contents in fixed-size chunks.
pub trait FileReadStream {
    /// Appends the next chunk to `buf` and returns its length. 0 means end of file.
    fn read_chunk(&mut self, buf: &mut Vec<u8>) -> Result<usize, UsbStorageError>;

    /// File size as recorded in the directory entry.
    fn total_size(&self) -> u64;

    fn bytes_read(&self) -> u64;
}

/// Reads a FAT file one cluster at a time.
///
/// The file handle is released as soon as the end is reached or a read fails.
pub struct FatFileStream<'a> {
    file: Option<File<'a, BlockStream>>,
    chunk_size: usize,
    total_size: u64,
    bytes_read: u64,
}

impl<'a> FatFileStream<'a> {
    pub fn new(file: File<'a, BlockStream>, total_size: u64, chunk_size: usize) -> Self {
        Self {
            file: Some(file),
            chunk_size: chunk_size.max(1),
            total_size,
            bytes_read: 0,
        }
    }
}

impl FileReadStream for FatFileStream<'_> {
    fn read_chunk(&mut self, buf: &mut Vec<u8>) -> Result<usize, UsbStorageError> {
        let remaining = self.total_size.saturating_sub(self.bytes_read);
        let want = usize::try_from(remaining).map_or(self.chunk_size, |r| r.min(self.chunk_size));
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };
        if want == 0 {
            self.file = None;
            return Ok(0);
        }

        // Read straight into the tail of the caller's buffer
        let start = buf.len();
        buf.resize(start + want, 0);
        match file.read(&mut buf[start..]) {
            Ok(n) => {
                buf.truncate(start + n);
                if n == 0 {
                    self.file = None;
                }
                self.bytes_read += n as u64;
                Ok(n)
            }
            Err(e) => {
                buf.truncate(start);
                self.file = None;
                Err(UsbStorageError::io("Couldn't read the file", e))
            }
        }
    }

    fn total_size(&self) -> u64 {
        self.total_size
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// Drains a stream into one buffer sized from the reported length.
pub fn read_to_end(stream: &mut dyn FileReadStream) -> Result<Vec<u8>, UsbStorageError> {
    let mut data = Vec::with_capacity(stream.total_size() as usize);
    while stream.read_chunk(&mut data)? > 0 {}
    Ok(data)
}

/// Reads the whole file at `path`.
///
/// Returns `Ok(None)` if nothing exists at the path.
pub fn read(session: &StorageSession, path: &str) -> Result<Option<Vec<u8>>, UsbStorageError> {
    let fs = session.fs()?;
    let entry = match resolve(fs, path)? {
        None => {
            debug!("Nothing at {:?} on {}", path, session.device_name());
            return Ok(None);
        }
        Some(Node::Root(_)) => return Err(UsbStorageError::IsADirectory { path: path.to_string() }),
        Some(Node::Entry(entry)) if entry.is_dir() => {
            return Err(UsbStorageError::IsADirectory { path: path.to_string() });
        }
        Some(Node::Entry(entry)) => entry,
    };

    let mut stream = FatFileStream::new(entry.to_file(), entry.len(), session.chunk_size());
    let data = read_to_end(&mut stream)?;
    debug!(
        "Read {} of {} bytes from {:?} in chunks of {}",
        stream.bytes_read(),
        stream.total_size(),
        path,
        session.chunk_size()
    );
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecStream {
        chunks: Vec<Vec<u8>>,
        total: u64,
        read: u64,
        fail_at: Option<usize>,
    }

    impl FileReadStream for VecStream {
        fn read_chunk(&mut self, buf: &mut Vec<u8>) -> Result<usize, UsbStorageError> {
            if self.fail_at == Some(0) {
                return Err(UsbStorageError::IoFailure {
                    message: "boom".to_string(),
                });
            }
            self.fail_at = self.fail_at.map(|n| n - 1);
            if self.chunks.is_empty() {
                return Ok(0);
            }
            let chunk = self.chunks.remove(0);
            buf.extend_from_slice(&chunk);
            self.read += chunk.len() as u64;
            Ok(chunk.len())
        }

        fn total_size(&self) -> u64 {
            self.total
        }

        fn bytes_read(&self) -> u64 {
            self.read
        }
    }

    #[test]
    fn test_read_to_end_concatenates_chunks() {
        let mut stream = VecStream {
            chunks: vec![vec![1, 2], vec![3], vec![4, 5]],
            total: 5,
            read: 0,
            fail_at: None,
        };
        assert_eq!(read_to_end(&mut stream).unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(stream.bytes_read(), 5);
    }

    #[test]
    fn test_read_to_end_propagates_errors() {
        let mut stream = VecStream {
            chunks: vec![vec![1], vec![2]],
            total: 2,
            read: 0,
            fail_at: Some(1),
        };
        assert!(matches!(read_to_end(&mut stream), Err(UsbStorageError::IoFailure { .. })));
    }
}
