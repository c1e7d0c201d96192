//! Disk-backed prover.
//!
//! Opens a finished plot, keeps C2 in RAM, and answers challenges by
//! descending C2 -> C1 -> C3 to the matching table-7 entries, then walking
//! the park-compressed back-pointer tree. Qualities follow one branch
//! picked by the challenge's last five bits; full proofs expand all 64
//! leaves.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bits::{slice_u64, BitWriter};
use crate::cache::LruCache;
use crate::constants::*;
use crate::disk::FileDisk;
use crate::encoding;
use crate::entry_sizes;
use crate::f_calc::{matches_pair, F1Calculator, FxCalculator, Metadata};
use crate::header;
use crate::verifier::hash_quality;
use crate::{PosError, Result};

/// Decoded parks kept hot per prover handle.
const PARK_CACHE_SIZE: usize = 128;

pub struct DiskProver {
    path: PathBuf,
    k: u32,
    id: [u8; K_ID_LEN],
    memo: Vec<u8>,
    table_begin: [u64; 11],
    n7: u64,
    c1_count: u64,
    c2: Vec<u64>,
    file: Mutex<FileDisk>,
    park_cache: Mutex<LruCache<(u32, u64), Arc<Vec<u8>>>>,
}

impl DiskProver {
    pub fn new(path: &Path) -> Result<Self> {
        let mut file = FileDisk::open_read_only(path)?;
        let h = header::parse_header(&mut file)?;
        let file_size = file.len()?;

        // Pointers must delimit strictly increasing, in-bounds regions.
        if h.table_begin[1] != h.header_size as u64 {
            return Err(PosError::InvalidValue(
                "plot table pointers do not start at the header".into(),
            ));
        }
        for t in 1..10 {
            if h.table_begin[t + 1] < h.table_begin[t] || h.table_begin[t + 1] > file_size {
                return Err(PosError::InvalidValue(format!(
                    "plot table pointer {t} is out of order"
                )));
            }
        }

        let k = h.k;
        let n7 = (h.table_begin[8] - h.table_begin[7]) / entry_sizes::p7_entry_size(k) as u64;
        let c1_entry = entry_sizes::c1_entry_size(k) as u64;
        let c1_count = (h.table_begin[9] - h.table_begin[8]) / c1_entry;
        let c2_count = (h.table_begin[10] - h.table_begin[9]) / c1_entry;

        let mut c2 = Vec::with_capacity(c2_count as usize);
        let mut buf = vec![0u8; c1_entry as usize];
        for i in 0..c2_count {
            file.read(h.table_begin[9] + i * c1_entry, &mut buf)?;
            c2.push(slice_u64(&buf, 0, k));
        }

        Ok(Self {
            path: path.to_path_buf(),
            k,
            id: h.id,
            memo: h.memo,
            table_begin: h.table_begin,
            n7,
            c1_count,
            c2,
            file: Mutex::new(file),
            park_cache: Mutex::new(LruCache::new(PARK_CACHE_SIZE)),
        })
    }

    pub fn size(&self) -> u32 {
        self.k
    }

    pub fn id(&self) -> &[u8; K_ID_LEN] {
        &self.id
    }

    pub fn memo(&self) -> &[u8] {
        &self.memo
    }

    pub fn filename(&self) -> &Path {
        &self.path
    }

    /// All qualities whose f7 equals the top k bits of the challenge. The
    /// result index feeds [`DiskProver::get_full_proof`].
    pub fn get_qualities_for_challenge(&self, challenge: &[u8; 32]) -> Result<Vec<[u8; 32]>> {
        let f7 = slice_u64(challenge, 0, self.k);
        let last_5_bits = challenge[31] & 0x1f;
        let mut qualities = Vec::new();
        for index in self.find_f7_indices(f7)? {
            let (_, mut position) = self.read_t7_entry(index)?;
            for table in (2..=6u32).rev() {
                let lp = self.read_line_point(table, position)?;
                let (hi, lo) = encoding::line_point_to_square(lp);
                position = if (last_5_bits >> (table - 2)) & 1 == 0 {
                    lo
                } else {
                    hi
                };
            }
            let lp = self.read_line_point(1, position)?;
            let (x1, x2) = encoding::line_point_to_square(lp);
            if x1 >= 1 << self.k {
                return Err(PosError::NoProof);
            }
            qualities.push(hash_quality(challenge, self.k, x2, x1));
        }
        Ok(qualities)
    }

    /// The full 64-leaf proof for the `index`-th quality of `challenge`,
    /// bit-packed as 64 k-bit x-values in proof order.
    pub fn get_full_proof(&self, challenge: &[u8; 32], index: usize) -> Result<Vec<u8>> {
        let f7 = slice_u64(challenge, 0, self.k);
        let indices = self.find_f7_indices(f7)?;
        let t7_index = *indices.get(index).ok_or(PosError::NoProof)?;
        let (_, position) = self.read_t7_entry(t7_index)?;

        let xs = self.get_inputs(position, 6)?;
        debug_assert_eq!(xs.len(), 64);
        let ordered = self.reorder_to_proof_order(&xs)?;

        let mut writer = BitWriter::with_capacity(64 * self.k as u64);
        for x in ordered {
            writer.push(x as u128, self.k);
        }
        Ok(writer.into_bytes())
    }

    /// Table-7 indices whose f7 equals the target, ascending.
    fn find_f7_indices(&self, f7: u64) -> Result<Vec<u64>> {
        if self.n7 == 0 || self.c1_count == 0 {
            return Ok(Vec::new());
        }
        // C2 narrows the C1 search to one checkpoint-2 decade.
        let c2_index = match last_le(&self.c2, f7) {
            None => return Ok(Vec::new()),
            Some(i) => i as u64,
        };
        let lo = c2_index * K_CHECKPOINT2_INTERVAL as u64;
        let hi = (lo + K_CHECKPOINT2_INTERVAL as u64).min(self.c1_count);

        // Binary search C1 on disk for the last entry <= f7.
        let mut lo_i = lo;
        let mut hi_i = hi;
        while hi_i - lo_i > 1 {
            let mid = (lo_i + hi_i) / 2;
            if self.read_c1_entry(mid)? <= f7 {
                lo_i = mid;
            } else {
                hi_i = mid;
            }
        }
        let group = lo_i;
        if self.read_c1_entry(group)? > f7 {
            return Ok(Vec::new());
        }

        let mut groups = Vec::with_capacity(2);
        // A run of equal f7 values can spill backward across the group
        // boundary when the group opens exactly on the target.
        if group > 0 && self.read_c1_entry(group)? == f7 {
            groups.push(group - 1);
        }
        groups.push(group);

        let mut out = Vec::new();
        for g in groups {
            let base = g * K_CHECKPOINT1_INTERVAL as u64;
            let count = (K_CHECKPOINT1_INTERVAL as u64).min(self.n7 - base) as usize;
            let anchor = self.read_c1_entry(g)?;
            let c3_size = entry_sizes::c3_size(self.k) as u64;
            let mut block = vec![0u8; c3_size as usize];
            self.file
                .lock()
                .read(self.table_begin[10] + g * c3_size, &mut block)?;
            let values = encoding::decode_c3(&block, anchor, count)?;
            for (j, &value) in values.iter().enumerate() {
                if value == f7 {
                    out.push(base + j as u64);
                }
            }
        }
        out.sort_unstable();
        out.dedup();
        Ok(out)
    }

    fn read_c1_entry(&self, index: u64) -> Result<u64> {
        let c1_entry = entry_sizes::c1_entry_size(self.k) as u64;
        let mut buf = vec![0u8; c1_entry as usize];
        self.file
            .lock()
            .read(self.table_begin[8] + index * c1_entry, &mut buf)?;
        Ok(slice_u64(&buf, 0, self.k))
    }

    fn read_t7_entry(&self, index: u64) -> Result<(u64, u64)> {
        if index >= self.n7 {
            return Err(PosError::InvariantViolation(
                "table 7 index out of range".into(),
            ));
        }
        let entry_size = entry_sizes::p7_entry_size(self.k) as u64;
        let mut buf = vec![0u8; entry_size as usize];
        self.file
            .lock()
            .read(self.table_begin[7] + index * entry_size, &mut buf)?;
        let f7 = slice_u64(&buf, 0, self.k);
        let pos = slice_u64(&buf, self.k as u64, self.k + 1);
        Ok((f7, pos))
    }

    /// Reads and decodes one line point from the park stream of a final
    /// table.
    fn read_line_point(&self, table: u32, position: u64) -> Result<u128> {
        let park_size = entry_sizes::park_size(self.k, table) as u64;
        let park_index = position / K_ENTRIES_PER_PARK as u64;
        let slot = (position % K_ENTRIES_PER_PARK as u64) as usize;
        let start = self.table_begin[table as usize] + park_index * park_size;
        if start + park_size > self.table_begin[table as usize + 1] {
            return Err(PosError::InvariantViolation(format!(
                "park {park_index} of table {table} is out of range"
            )));
        }

        let key = (table, park_index);
        let park = {
            let cached = self.park_cache.lock().get(&key);
            match cached {
                Some(bytes) => bytes,
                None => {
                    let mut bytes = vec![0u8; park_size as usize];
                    self.file.lock().read(start, &mut bytes)?;
                    let bytes = Arc::new(bytes);
                    self.park_cache.lock().put(key, Arc::clone(&bytes));
                    bytes
                }
            }
        };
        encoding::decode_park_entry(self.k, table, &park, slot)
    }

    /// Collects the 64 leaf x-values below a table-6 position, in plot
    /// order (smaller-position branch first).
    fn get_inputs(&self, position: u64, table: u32) -> Result<Vec<u64>> {
        let lp = self.read_line_point(table, position)?;
        let (hi, lo) = encoding::line_point_to_square(lp);
        if table == 1 {
            // a corrupted park can decode to x-values outside the universe
            if hi >= 1 << self.k {
                return Err(PosError::NoProof);
            }
            return Ok(vec![lo, hi]);
        }
        let mut leaves = self.get_inputs(lo, table - 1)?;
        leaves.extend(self.get_inputs(hi, table - 1)?);
        Ok(leaves)
    }

    /// Converts plot-ordered leaves to proof order by re-deriving the
    /// match orientation at every level.
    fn reorder_to_proof_order(&self, xs: &[u64]) -> Result<Vec<u64>> {
        struct Node {
            y: u64,
            meta: Metadata,
            xs: Vec<u64>,
        }
        let f1 = F1Calculator::new(self.k, &self.id);
        let mut nodes: Vec<Node> = xs
            .iter()
            .map(|&x| Node {
                y: f1.calculate_f(x),
                meta: Metadata::from_u64(x, self.k),
                xs: vec![x],
            })
            .collect();

        for table in 2..=7u32 {
            let fx = FxCalculator::new(self.k, table);
            let mut next = Vec::with_capacity(nodes.len() / 2);
            for pair in nodes.chunks_exact(2) {
                let (a, b) = if matches_pair(pair[0].y, pair[1].y) {
                    (&pair[0], &pair[1])
                } else if matches_pair(pair[1].y, pair[0].y) {
                    (&pair[1], &pair[0])
                } else {
                    // The plot says these should match; a failure here
                    // means the file bytes changed under us.
                    return Err(PosError::NoProof);
                };
                let (y, meta) = fx.calculate_bucket(a.y, &a.meta, &b.meta);
                let mut xs = a.xs.clone();
                xs.extend_from_slice(&b.xs);
                next.push(Node { y, meta, xs });
            }
            nodes = next;
        }
        let root = nodes.pop().expect("64 leaves reduce to one root");
        Ok(root.xs)
    }
}

/// Index of the last element `<= target` in a sorted slice.
fn last_le(values: &[u64], target: u64) -> Option<usize> {
    let mut result = None;
    let (mut lo, mut hi) = (0usize, values.len());
    while lo < hi {
        let mid = (lo + hi) / 2;
        if values[mid] <= target {
            result = Some(mid);
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_le() {
        let v = vec![2u64, 5, 5, 9];
        assert_eq!(last_le(&v, 1), None);
        assert_eq!(last_le(&v, 2), Some(0));
        assert_eq!(last_le(&v, 5), Some(2));
        assert_eq!(last_le(&v, 6), Some(2));
        assert_eq!(last_le(&v, 100), Some(3));
        assert_eq!(last_le(&[], 1), None);
    }
}
