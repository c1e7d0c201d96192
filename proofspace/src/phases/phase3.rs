//! Phase 3: compression into parks.
//!
//! For each table t in 1..=6, the entries of table t+1 are converted into
//! line points over their two back-pointers and written as final table t:
//!
//! 1. walk table t+1 sorted by left position, resolving both parents
//!    through a sliding window over the left table's values (x-values for
//!    t = 1, final positions for t > 1), and sort the resulting
//!    `(line_point, sort_key)` pairs;
//! 2. drain that sort in line-point order, packing parks, while emitting
//!    `(sort_key, final_index)` pairs whose sorted order becomes the left
//!    value stream of the next iteration.
//!
//! The iteration for t = 6 leaves a map keyed by f7; flattening it yields
//! final table 7.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::bitfield::Bitfield;
use crate::bits::{slice_u128, slice_u64, BitWriter};
use crate::constants::*;
use crate::disk::{read_exact_from, FileDisk};
use crate::encoding;
use crate::entry_sizes;
use crate::phases::phase2::Phase2Results;
use crate::sort_manager::{SortManager, SortedStream};
use crate::{PosError, Result};

pub struct Phase3Params<'a> {
    pub k: u32,
    pub tmp_dir: &'a Path,
    pub filename: &'a str,
    pub sort_memory: u64,
    pub log_num_buckets: u32,
    pub header_size: u32,
}

pub struct Phase3Results {
    /// Start offsets; slots 1..=7 filled here, the rest by Phase 4.
    pub final_pointers: [u64; 11],
    /// Final table 7 entry count.
    pub n7: u64,
}

/// The left-side value stream of one compression iteration.
enum LeftSource {
    /// Table 1 survivors: x-values filtered by the Phase-2 bitfield.
    Table1 {
        reader: BufReader<File>,
        bitfield: Bitfield,
        entry: Vec<u8>,
        raw_index: u64,
        total: u64,
    },
    /// `(sort_key, final_index)` map from the previous iteration, drained
    /// in sort-key order so the stream position is the key.
    Map(SortedStream),
}

impl LeftSource {
    fn next_value(&mut self, k: u32) -> Result<Option<u64>> {
        match self {
            LeftSource::Table1 {
                reader,
                bitfield,
                entry,
                raw_index,
                total,
            } => {
                while *raw_index < *total {
                    read_exact_from(reader, entry)?;
                    let index = *raw_index;
                    *raw_index += 1;
                    if bitfield.get(index) {
                        return Ok(Some(slice_u64(entry, (k + K_EXTRA_BITS) as u64, k)));
                    }
                }
                Ok(None)
            }
            LeftSource::Map(stream) => match stream.next_entry()? {
                None => Ok(None),
                Some(entry) => Ok(Some(slice_u64(entry, k as u64, k + 1))),
            },
        }
    }
}

pub fn run_phase3(
    params: &Phase3Params,
    tmp2: &mut FileDisk,
    p2: Phase2Results,
    table1_file: &mut FileDisk,
    table1_count: u64,
) -> Result<Phase3Results> {
    let k = params.k;
    let mut pointers = [0u64; 11];
    pointers[1] = params.header_size as u64;

    let mut left = LeftSource::Table1 {
        reader: table1_file.sequential_reader(0)?,
        bitfield: p2.bitfield1,
        entry: vec![0u8; entry_sizes::max_entry_size(k, 1, true) as usize],
        raw_index: 0,
        total: table1_count,
    };

    let window_size = K_CACHED_POSITIONS_SIZE;
    let mut managers = p2.sort_managers.into_iter();

    for t in 1..=6u32 {
        log::info!("Compressing tables {t} and {}", t + 1);
        let mut right = managers
            .next()
            .expect("phase 2 produced six sort managers")
            .into_sorted_stream()?;

        // Pass 1: line points, sorted.
        let mut lp_sort = SortManager::new(
            params.tmp_dir,
            &format!("{}.p3.lp.t{t}", params.filename),
            entry_sizes::line_point_sort_size(k) as usize,
            params.log_num_buckets,
            params.sort_memory,
        )?;
        let mut window = vec![0u64; window_size as usize];
        let mut filled = 0u64;
        let mut writer = BitWriter::new();
        while let Some(entry) = right.next_entry()? {
            let pos = slice_u64(entry, 0, k);
            let offset = slice_u64(entry, k as u64, K_OFFSET_SIZE);
            let key = slice_u64(entry, (k + K_OFFSET_SIZE) as u64, k);
            let right_pos = pos + offset;
            while filled <= right_pos {
                let value = left.next_value(k)?.ok_or_else(|| {
                    PosError::InvariantViolation(format!(
                        "table {} back-pointer {right_pos} outside the compacted table {t}",
                        t + 1
                    ))
                })?;
                window[(filled % window_size) as usize] = value;
                filled += 1;
            }
            if pos + window_size < filled {
                return Err(PosError::InvariantViolation(
                    "position window overrun; phase 2 output is not sorted by position".into(),
                ));
            }
            let a = window[(pos % window_size) as usize];
            let b = window[(right_pos % window_size) as usize];
            writer.clear();
            writer.push(encoding::square_to_line_point(a, b), 2 * k);
            writer.push(key as u128, k);
            lp_sort.add(writer.as_bytes())?;
        }
        lp_sort.seal()?;

        // Pass 2: write parks, build the next position map.
        let mut lp_stream = lp_sort.into_sorted_stream()?;
        let mut map_sort = SortManager::new(
            params.tmp_dir,
            &format!("{}.p3.map.t{t}", params.filename),
            entry_sizes::position_map_size(k) as usize,
            params.log_num_buckets,
            params.sort_memory,
        )?;
        let park_bytes = entry_sizes::park_size(k, t) as u64;
        let mut park: Vec<u128> = Vec::with_capacity(K_ENTRIES_PER_PARK as usize);
        let mut park_index = 0u64;
        let mut final_index = 0u64;
        while let Some(entry) = lp_stream.next_entry()? {
            let lp = slice_u128(entry, 0, 2 * k);
            let key = slice_u64(entry, 2 * k as u64, k);
            writer.clear();
            writer.push(key as u128, k);
            writer.push(final_index as u128, k + 1);
            map_sort.add(writer.as_bytes())?;
            final_index += 1;

            park.push(lp);
            if park.len() == K_ENTRIES_PER_PARK as usize {
                let bytes = encoding::encode_park(k, t, &park)?;
                tmp2.write(pointers[t as usize] + park_index * park_bytes, &bytes)?;
                park_index += 1;
                park.clear();
            }
        }
        if !park.is_empty() {
            let bytes = encoding::encode_park(k, t, &park)?;
            tmp2.write(pointers[t as usize] + park_index * park_bytes, &bytes)?;
            park_index += 1;
        }
        map_sort.seal()?;
        pointers[t as usize + 1] = pointers[t as usize] + park_index * park_bytes;
        left = LeftSource::Map(map_sort.into_sorted_stream()?);
    }

    // Final table 7: the t = 6 map is keyed by f7 and its entries already
    // have the flat `f7 || pos` layout.
    let entry7 = entry_sizes::p7_entry_size(k) as u64;
    debug_assert_eq!(entry7 as u32, entry_sizes::position_map_size(k));
    let mut n7 = 0u64;
    if let LeftSource::Map(mut stream) = left {
        while let Some(entry) = stream.next_entry()? {
            tmp2.write(pointers[7] + n7 * entry7, entry)?;
            n7 += 1;
        }
    }
    pointers[8] = pointers[7] + n7 * entry7;
    tmp2.flush()?;

    log::info!(
        "Phase 3 wrote {n7} final table 7 entries; tables end at byte {}",
        pointers[8]
    );
    Ok(Phase3Results {
        final_pointers: pointers,
        n7,
    })
}
