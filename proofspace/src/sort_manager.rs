//! Bucketed external sort.
//!
//! Entries are fixed-width byte strings whose sort key leads, so ordering
//! is plain lexicographic comparison. On `add`, the top bits of the key
//! route the entry to one of `2^log_num_buckets` spill files; on read,
//! buckets are loaded whole into the RAM arena one at a time, sorted in
//! parallel, and streamed back in order. A bucket that exceeds the arena
//! fails the sort — the plotter's bucket-count formula keeps buckets below
//! the budget for well-formed inputs.

use rayon::prelude::*;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::{PosError, Result};

/// Spill-side buffer per bucket file.
const SPILL_BUFFER_SIZE: usize = 64 * 1024;

struct Bucket {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    count: u64,
}

pub struct SortManager {
    entry_size: usize,
    log_num_buckets: u32,
    memory_size: u64,
    buckets: Vec<Bucket>,
    total: u64,
}

impl SortManager {
    /// Creates the spill files `<prefix>.sort_bucket_NNN.tmp` under `dir`.
    pub fn new(
        dir: &Path,
        prefix: &str,
        entry_size: usize,
        log_num_buckets: u32,
        memory_size: u64,
    ) -> Result<Self> {
        debug_assert!(entry_size >= 2, "bucket routing reads two key bytes");
        let mut buckets = Vec::with_capacity(1 << log_num_buckets);
        for b in 0..(1u32 << log_num_buckets) {
            let path = dir.join(format!("{prefix}.sort_bucket_{b:03}.tmp"));
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            buckets.push(Bucket {
                path,
                writer: Some(BufWriter::with_capacity(SPILL_BUFFER_SIZE, file)),
                count: 0,
            });
        }
        Ok(Self {
            entry_size,
            log_num_buckets,
            memory_size,
            buckets,
            total: 0,
        })
    }

    #[inline]
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Total entries added so far.
    pub fn total_entries(&self) -> u64 {
        self.total
    }

    /// Routes one entry to its bucket by the top bits of the sort key.
    pub fn add(&mut self, entry: &[u8]) -> Result<()> {
        debug_assert_eq!(entry.len(), self.entry_size);
        let key16 = u16::from_be_bytes([entry[0], entry[1]]) as u32;
        let bucket = (key16 >> (16 - self.log_num_buckets)) as usize;
        let b = &mut self.buckets[bucket];
        b.writer
            .as_mut()
            .expect("sort manager already sealed")
            .write_all(entry)?;
        b.count += 1;
        self.total += 1;
        Ok(())
    }

    /// Flushes and closes all spill writers. Call once writing is done so
    /// the open-file count stays bounded while other managers are active.
    pub fn seal(&mut self) -> Result<()> {
        for b in &mut self.buckets {
            if let Some(mut w) = b.writer.take() {
                w.flush()?;
            }
        }
        Ok(())
    }

    /// Consumes the manager, yielding entries in globally sorted order.
    pub fn into_sorted_stream(mut self) -> Result<SortedStream> {
        self.seal()?;
        let pending = self
            .buckets
            .drain(..)
            .map(|b| (b.path, b.count))
            .collect::<VecDeque<_>>();
        Ok(SortedStream {
            entry_size: self.entry_size,
            memory_size: self.memory_size,
            pending,
            current: Vec::new(),
            cursor: 0,
        })
    }

    /// Removes all spill files without reading them.
    pub fn discard(mut self) -> Result<()> {
        self.seal()?;
        for b in &self.buckets {
            let _ = fs::remove_file(&b.path);
        }
        self.buckets.clear();
        Ok(())
    }
}

impl Drop for SortManager {
    fn drop(&mut self) {
        for b in &mut self.buckets {
            if let Some(mut w) = b.writer.take() {
                let _ = w.flush();
            }
            let _ = fs::remove_file(&b.path);
        }
    }
}

/// Streaming reader over the sorted output. Holds one sorted bucket in RAM
/// at a time; each spill file is deleted as soon as it is loaded.
pub struct SortedStream {
    entry_size: usize,
    memory_size: u64,
    pending: VecDeque<(PathBuf, u64)>,
    current: Vec<u8>,
    cursor: usize,
}

impl SortedStream {
    /// Returns the next entry, or `None` once all buckets are drained.
    pub fn next_entry(&mut self) -> Result<Option<&[u8]>> {
        while self.cursor >= self.current.len() {
            match self.pending.pop_front() {
                None => return Ok(None),
                Some((path, count)) => {
                    self.load_bucket(&path, count)?;
                    self.cursor = 0;
                }
            }
        }
        let start = self.cursor;
        self.cursor += self.entry_size;
        Ok(Some(&self.current[start..start + self.entry_size]))
    }

    fn load_bucket(&mut self, path: &Path, count: u64) -> Result<()> {
        let expected = count * self.entry_size as u64;
        if expected > self.memory_size {
            return Err(PosError::InsufficientMemory(format!(
                "memory too small for sort buckets: bucket holds {expected} bytes, \
                 arena is {} bytes",
                self.memory_size
            )));
        }
        let data = fs::read(path)?;
        let _ = fs::remove_file(path);
        if data.len() as u64 != expected {
            return Err(PosError::InvariantViolation(format!(
                "sort bucket {} truncated: {} != {expected} bytes",
                path.display(),
                data.len()
            )));
        }
        let mut refs: Vec<&[u8]> = data.chunks_exact(self.entry_size).collect();
        refs.par_sort_unstable();
        let mut sorted = Vec::with_capacity(data.len());
        for r in refs {
            sorted.extend_from_slice(r);
        }
        self.current = sorted;
        Ok(())
    }
}

impl Drop for SortedStream {
    fn drop(&mut self) {
        for (path, _) in &self.pending {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    #[test]
    fn test_sorted_stream_orders_entries() {
        let dir = tempdir().unwrap();
        let mut sm = SortManager::new(dir.path(), "t", 4, 4, 1 << 20).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut entries: Vec<[u8; 4]> = (0..5000).map(|_| rng.gen::<[u8; 4]>()).collect();
        for e in &entries {
            sm.add(e).unwrap();
        }
        assert_eq!(sm.total_entries(), 5000);

        let mut stream = sm.into_sorted_stream().unwrap();
        let mut got = Vec::new();
        while let Some(e) = stream.next_entry().unwrap() {
            got.push(<[u8; 4]>::try_from(e).unwrap());
        }
        entries.sort_unstable();
        assert_eq!(got, entries);
    }

    #[test]
    fn test_bucket_overflow_reports_insufficient_memory() {
        let dir = tempdir().unwrap();
        // Arena of 64 bytes, all entries share a key prefix -> one bucket.
        let mut sm = SortManager::new(dir.path(), "t", 8, 2, 64).unwrap();
        for i in 0..100u64 {
            sm.add(&i.to_be_bytes()).unwrap();
        }
        let mut stream = sm.into_sorted_stream().unwrap();
        let mut err = None;
        loop {
            match stream.next_entry() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        assert!(matches!(err, Some(PosError::InsufficientMemory(_))));
    }

    #[test]
    fn test_spill_files_cleaned_up() {
        let dir = tempdir().unwrap();
        {
            let mut sm = SortManager::new(dir.path(), "t", 4, 2, 1 << 16).unwrap();
            for i in 0..100u32 {
                sm.add(&i.to_be_bytes()).unwrap();
            }
            let mut stream = sm.into_sorted_stream().unwrap();
            while stream.next_entry().unwrap().is_some() {}
        }
        let leftover = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftover, 0);
    }
}
