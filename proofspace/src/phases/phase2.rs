//! Phase 2: backpropagation.
//!
//! Walks tables 7 down to 2. For each table, a first pass marks every
//! position of the previous table that some kept entry references; a
//! second pass rewrites the table as compact `(pos, offset, key)` triples
//! with positions remapped through the rank index of the mark bitfield.
//! Entries nothing references are dropped. The rewritten tables come out
//! of a sort manager ordered by position, which is exactly how Phase 3
//! wants to consume them.

use std::path::Path;

use crate::bitfield::{Bitfield, RankIndex};
use crate::bits::{slice_u64, BitWriter};
use crate::constants::*;
use crate::disk::{read_exact_from, FileDisk};
use crate::entry_sizes;
use crate::sort_manager::SortManager;
use crate::{PosError, Result};

pub struct Phase2Params<'a> {
    pub k: u32,
    pub tmp_dir: &'a Path,
    pub filename: &'a str,
    pub sort_memory: u64,
    pub log_num_buckets: u32,
}

pub struct Phase2Results {
    /// Survivor marks for table 1 (rewritten lazily by Phase 3).
    pub bitfield1: Bitfield,
    /// Rewritten tables 2..=7, each sorted by position.
    pub sort_managers: Vec<SortManager>,
    /// Post-backpropagation entry counts.
    pub new_table_sizes: [u64; 8],
}

pub fn run_phase2(
    params: &Phase2Params,
    table_files: &mut [FileDisk],
    table_sizes: &[u64; 8],
) -> Result<Phase2Results> {
    let k = params.k;
    let mut new_sizes = [0u64; 8];
    let mut managers: Vec<Option<SortManager>> = (0..6).map(|_| None).collect();

    // Table 7 is fully retained; every other keep-set comes from the table
    // above it.
    let mut keep = Bitfield::all_set(table_sizes[7]);

    for t in (2..=7u32).rev() {
        log::info!("Backpropagating table {t}");
        let entry_size = entry_sizes::max_entry_size(k, t, true) as usize;
        let meta_bits = if t == 7 {
            0
        } else {
            k * K_VECTOR_LENS[t as usize + 1]
        };
        let pos_bit = (k + K_EXTRA_BITS + meta_bits) as u64;
        let prev_len = table_sizes[t as usize - 1];

        // Pass 1: mark the previous table's referenced positions.
        let mut next_bf = Bitfield::new(prev_len);
        let mut reader = table_files[t as usize].sequential_reader(0)?;
        let mut entry = vec![0u8; entry_size];
        for i in 0..table_sizes[t as usize] {
            read_exact_from(&mut reader, &mut entry)?;
            if !keep.get(i) {
                continue;
            }
            let pos = slice_u64(&entry, pos_bit, k + 1);
            let offset = slice_u64(&entry, pos_bit + (k + 1) as u64, K_OFFSET_SIZE);
            if pos + offset >= prev_len {
                return Err(PosError::InvariantViolation(format!(
                    "table {t} back-pointer {pos}+{offset} outside table {} (len {prev_len})",
                    t - 1
                )));
            }
            next_bf.set(pos);
            next_bf.set(pos + offset);
        }
        let rank = RankIndex::build(&next_bf);

        // Pass 2: rewrite kept entries with dense positions, sorted by
        // their new left position for Phase 3.
        let mut sm = SortManager::new(
            params.tmp_dir,
            &format!("{}.p2.t{t}", params.filename),
            entry_sizes::key_pos_offset_size(k) as usize,
            params.log_num_buckets,
            params.sort_memory,
        )?;
        let mut reader = table_files[t as usize].sequential_reader(0)?;
        let mut writer = BitWriter::new();
        let mut sort_key = 0u64;
        for i in 0..table_sizes[t as usize] {
            read_exact_from(&mut reader, &mut entry)?;
            if !keep.get(i) {
                continue;
            }
            let pos = slice_u64(&entry, pos_bit, k + 1);
            let offset = slice_u64(&entry, pos_bit + (k + 1) as u64, K_OFFSET_SIZE);
            let new_pos = rank.rank(&next_bf, pos);
            let new_offset = rank.rank(&next_bf, pos + offset) - new_pos;
            let key = if t == 7 {
                // table 7 keeps its f7 as the key; entry order is f7 order
                slice_u64(&entry, 0, k + K_EXTRA_BITS) >> K_EXTRA_BITS
            } else {
                sort_key
            };
            if new_pos >= 1 << k || key >= 1 << k {
                return Err(PosError::InvariantViolation(format!(
                    "table {t} overflows the compact position field"
                )));
            }
            writer.clear();
            writer.push(new_pos as u128, k);
            writer.push(new_offset as u128, K_OFFSET_SIZE);
            writer.push(key as u128, k);
            sm.add(writer.as_bytes())?;
            sort_key += 1;
        }
        sm.seal()?;
        new_sizes[t as usize] = sort_key;
        managers[t as usize - 2] = Some(sm);
        keep = next_bf;
    }

    new_sizes[1] = keep.count_set();
    log::info!("Phase 2 table sizes: {:?}", &new_sizes[1..=7]);

    Ok(Phase2Results {
        bitfield1: keep,
        sort_managers: managers.into_iter().map(Option::unwrap).collect(),
        new_table_sizes: new_sizes,
    })
}
