//! Random-access file I/O with a small write-coalescing buffer.
//!
//! Plot construction writes large sequential runs at explicit offsets into
//! files that can exceed 100 GiB. `FileDisk` buffers contiguous writes and
//! flushes whenever a write lands elsewhere, a read is issued, or the file
//! is dropped. Short reads surface as I/O errors.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::Result;

/// Maximum size of the coalescing buffer.
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

pub struct FileDisk {
    file: File,
    path: PathBuf,
    buf: Vec<u8>,
    buf_start: u64,
}

impl FileDisk {
    /// Creates (or truncates) a file for reading and writing.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            buf: Vec::with_capacity(WRITE_BUFFER_SIZE),
            buf_start: 0,
        })
    }

    /// Opens an existing file for reading and writing.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            buf: Vec::with_capacity(WRITE_BUFFER_SIZE),
            buf_start: 0,
        })
    }

    /// Opens an existing file read-only. Writes will fail with an I/O
    /// error.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            buf: Vec::new(),
            buf_start: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `data` at `offset`, coalescing with the pending buffer when
    /// the write extends it.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.buf.is_empty() {
            self.buf_start = offset;
        } else if offset != self.buf_start + self.buf.len() as u64
            || self.buf.len() + data.len() > WRITE_BUFFER_SIZE
        {
            self.flush()?;
            self.buf_start = offset;
        }
        if data.len() >= WRITE_BUFFER_SIZE {
            // Oversized writes bypass the buffer entirely.
            debug_assert!(self.buf.is_empty());
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(data)?;
            return Ok(());
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Reads exactly `out.len()` bytes at `offset`. Any pending writes are
    /// flushed first so reads always observe them.
    pub fn read(&mut self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.flush()?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(out)?;
        Ok(())
    }

    /// Flushes the coalescing buffer to the underlying file.
    pub fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.file.seek(SeekFrom::Start(self.buf_start))?;
            self.file.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Current file length, after flushing pending writes.
    pub fn len(&mut self) -> Result<u64> {
        self.flush()?;
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// An independent read handle positioned at `offset`, for sequential
    /// scans that may interleave with writes through this `FileDisk`. A
    /// fresh descriptor is opened so the two never share a seek position;
    /// the pending write buffer is flushed so the reader sees current
    /// data.
    pub fn sequential_reader(&mut self, offset: u64) -> Result<std::io::BufReader<File>> {
        self.flush()?;
        let mut reader = OpenOptions::new().read(true).open(&self.path)?;
        reader.seek(SeekFrom::Start(offset))?;
        Ok(std::io::BufReader::with_capacity(1 << 20, reader))
    }

    /// Flushes and syncs file contents to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for FileDisk {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Reads exactly `out.len()` bytes from a sequential reader.
pub fn read_exact_from(reader: &mut impl Read, out: &mut [u8]) -> Result<()> {
    reader.read_exact(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");
        let mut disk = FileDisk::create(&path).unwrap();
        disk.write(0, b"hello").unwrap();
        disk.write(5, b" world").unwrap();
        let mut out = [0u8; 11];
        disk.read(0, &mut out).unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn test_noncontiguous_write_flushes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");
        let mut disk = FileDisk::create(&path).unwrap();
        disk.write(0, b"aaaa").unwrap();
        disk.write(100, b"bbbb").unwrap();
        let mut out = [0u8; 4];
        disk.read(100, &mut out).unwrap();
        assert_eq!(&out, b"bbbb");
        assert_eq!(disk.len().unwrap(), 104);
    }

    #[test]
    fn test_short_read_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");
        let mut disk = FileDisk::create(&path).unwrap();
        disk.write(0, b"abc").unwrap();
        let mut out = [0u8; 10];
        assert!(disk.read(0, &mut out).is_err());
        // Seek past end-of-file behaves the same way.
        assert!(disk.read(1000, &mut out[..1]).is_err());
    }

    #[test]
    fn test_large_write_bypasses_buffer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");
        let mut disk = FileDisk::create(&path).unwrap();
        let big = vec![7u8; WRITE_BUFFER_SIZE + 10];
        disk.write(3, &big).unwrap();
        let mut out = vec![0u8; big.len()];
        disk.read(3, &mut out).unwrap();
        assert_eq!(out, big);
    }
}
