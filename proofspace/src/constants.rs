//! Plot format constants.
//!
//! Every value here is part of the on-disk format. Changing any of them
//! produces plots that existing provers cannot read, so they are fixed for
//! the lifetime of the `v1.0` format description.

use once_cell::sync::Lazy;

/// Length of the unique plot id, which doubles as the ChaCha8 seed.
pub const K_ID_LEN: usize = 32;

/// Minimum plot size exponent. Set high enough to prevent fast re-plotting
/// attacks.
pub const K_MIN_PLOT_SIZE: u32 = 18;

/// Maximum plot size exponent. `k + K_EXTRA_BITS + 4k` must not exceed the
/// 256-bit hash output used by the compression function.
pub const K_MAX_PLOT_SIZE: u32 = 50;

/// Extra bits appended to each y-value to reduce collisions during matching.
pub const K_EXTRA_BITS: u32 = 6;

/// Number of match candidates tried per left entry (`2^K_EXTRA_BITS`).
pub const K_EXTRA_BITS_POW: u32 = 1 << K_EXTRA_BITS;

/// Matching bucket parameters. A y-value decomposes as
/// `y = bucket_id * K_BC + bc`, with `bc` further split modulo `K_B` and
/// `K_C`.
pub const K_B: u64 = 119;
pub const K_C: u64 = 127;
pub const K_BC: u64 = K_B * K_C;

/// Width of the offset field linking an entry to its right parent.
pub const K_OFFSET_SIZE: u32 = 10;

/// Metadata width multipliers per table: table `t` carries
/// `k * K_VECTOR_LENS[t + 1]` bits of metadata.
pub const K_VECTOR_LENS: [u32; 8] = [0, 0, 1, 2, 4, 4, 3, 2];

/// ChaCha8 keystream block size in bits.
pub const K_F1_BLOCK_SIZE_BITS: u64 = 512;

/// f1 evaluations are generated in batches of `2^K_BATCH_SIZES` x-values.
pub const K_BATCH_SIZES: u32 = 8;

/// Bucket count bounds for the external sort.
pub const K_MIN_BUCKETS: u32 = 16;
pub const K_MAX_BUCKETS: u32 = 128;

/// Proportion of the RAM budget handed to the sort manager for reading
/// buckets back. The remainder covers write buffering and phase scratch.
pub const K_MEM_SORT_PROPORTION: f64 = 0.75;

/// Default stripe depth for Phase 1 parallelism.
pub const K_DEFAULT_STRIPE_SIZE: u64 = 65536;

/// Default worker thread count.
pub const K_DEFAULT_THREADS: u8 = 2;

/// Default sort/plot buffer in MiB.
pub const K_DEFAULT_BUFFER_MIB: u32 = 4608;

/// Entries per park in the final compressed tables.
pub const K_ENTRIES_PER_PARK: u32 = 2048;

/// The stub of each park delta keeps `k - K_STUB_MINUS_BITS` low bits raw.
pub const K_STUB_MINUS_BITS: u32 = 3;

/// Per-entry bit budgets for the prefix-coded high deltas. Table 1 line
/// points are spread over a wider range, so its deltas run larger.
pub const K_MAX_AVERAGE_DELTA_TABLE1: f64 = 6.5;
pub const K_MAX_AVERAGE_DELTA: f64 = 4.5;

/// Distribution parameters for the static delta codes of tables 1..6.
pub const K_R_VALUES: [f64; 6] = [4.7, 2.75, 2.75, 2.7, 2.6, 2.45];

/// Distribution parameter and per-entry bit budget for C3 checkpoint
/// deltas.
pub const K_C3_R: f64 = 1.0;
pub const K_C3_BITS_PER_ENTRY: f64 = 2.4;

/// f7 sampling intervals for the checkpoint tables.
pub const K_CHECKPOINT1_INTERVAL: u32 = 10000;
pub const K_CHECKPOINT2_INTERVAL: u32 = 10000;

/// Sliding window of cached left-table positions during park construction.
/// Must exceed `4 * 2^K_OFFSET_SIZE` so a right entry can always reach its
/// partner.
pub const K_CACHED_POSITIONS_SIZE: u64 = 4096;

/// Magic literal opening every plot file.
pub const HEADER_MAGIC: &[u8; 19] = b"Proof of Space Plot";

/// Format description stored in the header. Bump when any constant above
/// changes.
pub const FORMAT_DESCRIPTION: &str = "v1.0";

/// Match target table: `L_TARGETS[parity][r][m]` is the `bc` residue a
/// right entry must carry for a left entry with residue `r` to match at
/// candidate index `m`.
pub struct MatchTargets(Box<[u16]>);

impl MatchTargets {
    #[inline]
    pub fn at(&self, parity: usize, r: usize, m: usize) -> u16 {
        self.0[(parity * K_BC as usize + r) * K_EXTRA_BITS_POW as usize + m]
    }
}

pub static L_TARGETS: Lazy<MatchTargets> = Lazy::new(|| {
    let mut table = vec![0u16; 2 * K_BC as usize * K_EXTRA_BITS_POW as usize];
    for parity in 0..2u64 {
        for r in 0..K_BC {
            let ind_j = r / K_C;
            for m in 0..K_EXTRA_BITS_POW as u64 {
                let target = ((ind_j + m) % K_B) * K_C
                    + (((2 * m + parity) * (2 * m + parity) + r) % K_C);
                let idx = (parity as usize * K_BC as usize + r as usize)
                    * K_EXTRA_BITS_POW as usize
                    + m as usize;
                table[idx] = target as u16;
            }
        }
    }
    MatchTargets(table.into_boxed_slice())
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bc_product() {
        assert_eq!(K_BC, 15113);
        assert_eq!(K_B * K_C, K_BC);
    }

    #[test]
    fn test_targets_in_range() {
        for parity in 0..2 {
            for r in (0..K_BC as usize).step_by(501) {
                for m in 0..K_EXTRA_BITS_POW as usize {
                    assert!((L_TARGETS.at(parity, r, m) as u64) < K_BC);
                }
            }
        }
    }

    #[test]
    fn test_targets_formula() {
        // Spot-check the quadratic residue construction directly.
        let parity = 1u64;
        let r = 200u64;
        let m = 5u64;
        let expected = ((r / K_C + m) % K_B) * K_C
            + (((2 * m + parity) * (2 * m + parity) + r) % K_C);
        assert_eq!(
            L_TARGETS.at(parity as usize, r as usize, m as usize) as u64,
            expected
        );
    }
}
