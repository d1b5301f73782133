//! Storage backend abstraction: the interface file handles use to reach
//! actual bytes, plus two reference implementations. Neither implementation
//! is part of the on-disk compatibility surface — only the trait and the
//! ciphertext byte layout it reads/writes are.

use std::fs::{File, OpenOptions};
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Random-access byte storage for one ciphertext file.
pub trait StorageBackend: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize>;
    fn size(&self) -> io::Result<u64>;
    fn set_size(&mut self, new_size: u64) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// A `std::fs::File`-backed implementation, used by the CLI and integration
/// tests.
pub struct FsBackend {
    file: File,
}

impl FsBackend {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        Ok(FsBackend { file })
    }
}

impl StorageBackend for FsBackend {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_size(&mut self, new_size: u64) -> io::Result<()> {
        self.file.set_len(new_size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// An in-memory backend used by unit tests for cheap, deterministic round
/// trips without touching the filesystem.
#[derive(Default)]
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemBackend {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_size(&mut self, new_size: u64) -> io::Result<()> {
        self.data.resize(new_size as usize, 0);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_backend_reads_back_what_it_wrote() {
        let mut backend = MemBackend::new();
        backend.write_at(4, b"hello").unwrap();
        assert_eq!(backend.size().unwrap(), 9);
        let mut buf = [0u8; 5];
        backend.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        let mut head = [0u8; 4];
        backend.read_at(0, &mut head).unwrap();
        assert_eq!(head, [0, 0, 0, 0]);
    }

    #[test]
    fn mem_backend_set_size_truncates_and_expands() {
        let mut backend = MemBackend::new();
        backend.write_at(0, b"0123456789").unwrap();
        backend.set_size(4).unwrap();
        assert_eq!(backend.size().unwrap(), 4);
        backend.set_size(8).unwrap();
        let mut buf = [0xffu8; 4];
        backend.read_at(4, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn fs_backend_round_trips_through_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ciphertext.bin");
        let mut backend = FsBackend::open(&path).unwrap();
        backend.write_at(0, b"abcdefgh").unwrap();
        backend.flush().unwrap();
        let mut buf = [0u8; 8];
        backend.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");
    }
}
