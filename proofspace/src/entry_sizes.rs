//! Closed-form entry and block sizes for every table and phase.
//!
//! Phase 1 entries carry full y-values and metadata; Phase 2 rewrites
//! tables to compact `(pos, offset, key)` triples; Phase 3 emits
//! fixed-stride parks. All sizes here are in bytes unless noted.

use crate::bits::{byte_align, cdiv};
use crate::constants::*;

/// Maximum size of a table entry. `phase_1` selects the wide Phase-1 layout
/// (with y and metadata); otherwise the post-Phase-2 layout is used.
pub fn max_entry_size(k: u32, table: u32, phase_1: bool) -> u32 {
    debug_assert!((1..=7).contains(&table));
    match table {
        1 => {
            if phase_1 {
                // y (k + 6) || x (k)
                (byte_align((k + K_EXTRA_BITS + k) as u64) / 8) as u32
            } else {
                (byte_align(k as u64) / 8) as u32
            }
        }
        2..=6 => {
            if phase_1 {
                // y || metadata || pos || offset
                let bits = k
                    + K_EXTRA_BITS
                    + k * K_VECTOR_LENS[table as usize + 1]
                    + (k + 1)
                    + K_OFFSET_SIZE;
                (byte_align(bits as u64) / 8) as u32
            } else {
                key_pos_offset_size(k)
            }
        }
        _ => {
            // table 7: y || pos || offset
            let bits = k + K_EXTRA_BITS + (k + 1) + K_OFFSET_SIZE;
            (byte_align(bits as u64) / 8) as u32
        }
    }
}

/// Size of the `(pos, offset, key)` triples written by Phase 2.
pub fn key_pos_offset_size(k: u32) -> u32 {
    cdiv((2 * k + K_OFFSET_SIZE) as u64, 8) as u32
}

/// Size of a Phase-3 line-point sort entry: `lp (2k) || key (k)`.
pub fn line_point_sort_size(k: u32) -> u32 {
    cdiv(3 * k as u64, 8) as u32
}

/// Size of a Phase-3 position-map sort entry: `key (k) || index (k + 1)`.
pub fn position_map_size(k: u32) -> u32 {
    cdiv(2 * k as u64 + 1, 8) as u32
}

/// Raw anchor line point at the head of each park.
pub fn line_point_size(k: u32) -> u32 {
    (byte_align(2 * k as u64) / 8) as u32
}

/// Bit-packed stub section of a park.
pub fn stubs_size(k: u32) -> u32 {
    let bits = (K_ENTRIES_PER_PARK - 1) as u64 * (k - K_STUB_MINUS_BITS) as u64;
    (byte_align(bits) / 8) as u32
}

/// Worst-case bytes for the prefix-coded high deltas of one park.
pub fn max_deltas_size(table: u32) -> u32 {
    let budget = if table == 1 {
        K_MAX_AVERAGE_DELTA_TABLE1
    } else {
        K_MAX_AVERAGE_DELTA
    };
    let bits = ((K_ENTRIES_PER_PARK - 1) as f64 * budget).ceil() as u64;
    (byte_align(bits) / 8) as u32
}

/// Fixed byte stride of a park in final table `table` (1..=6):
/// anchor, stubs, 2-byte delta length, delta stream.
pub fn park_size(k: u32, table: u32) -> u32 {
    line_point_size(k) + stubs_size(k) + 2 + max_deltas_size(table)
}

/// Final table-7 entry: `f7 (k) || pos (k + 1)`, byte aligned.
pub fn p7_entry_size(k: u32) -> u32 {
    cdiv(2 * k as u64 + 1, 8) as u32
}

/// C1/C2 checkpoint entry: one f7 value.
pub fn c1_entry_size(k: u32) -> u32 {
    cdiv(k as u64, 8) as u32
}

/// Fixed byte stride of a C3 block: 2-byte length plus delta stream. Low k
/// values see much higher per-entry variability, so they get a flat 8 bits
/// per entry.
pub fn c3_size(k: u32) -> u32 {
    let bits = if k < 20 {
        8 * K_CHECKPOINT1_INTERVAL as u64
    } else {
        (K_C3_BITS_PER_ENTRY * K_CHECKPOINT1_INTERVAL as f64).ceil() as u64
    };
    2 + (byte_align(bits) / 8) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase1_entry_sizes_k32() {
        // y = 38 bits throughout; metadata per K_VECTOR_LENS.
        assert_eq!(max_entry_size(32, 1, true), 9); // 38 + 32 = 70 bits
        assert_eq!(max_entry_size(32, 2, true), 18); // 38 + 64 + 33 + 10
        assert_eq!(max_entry_size(32, 3, true), 26); // 38 + 128 + 33 + 10
        assert_eq!(max_entry_size(32, 7, true), 11); // 38 + 33 + 10
    }

    #[test]
    fn test_phase2_sizes() {
        assert_eq!(key_pos_offset_size(32), 10); // 74 bits
        assert_eq!(key_pos_offset_size(18), 6); // 46 bits
    }

    #[test]
    fn test_park_size_components() {
        let k = 32;
        for t in 1..=6 {
            let p = park_size(k, t);
            assert_eq!(
                p,
                line_point_size(k) + stubs_size(k) + 2 + max_deltas_size(t)
            );
            assert!(p > line_point_size(k));
        }
        // Table 1 carries the larger delta budget.
        assert!(park_size(k, 1) > park_size(k, 2));
    }

    #[test]
    fn test_c3_size_small_k_flat() {
        assert_eq!(c3_size(18), 2 + 10000);
        assert!(c3_size(20) < c3_size(18));
    }

    #[test]
    fn test_sizes_monotone_in_k() {
        for k in [18, 20, 25, 32, 50] {
            for t in 1..=7 {
                assert!(max_entry_size(k, t, true) >= max_entry_size(k, t, false));
            }
        }
    }
}
