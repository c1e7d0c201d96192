//! Proof verification.
//!
//! Recomputes the full `f1..f7` chain from the seed and the 64 proof
//! leaves, checking the match predicate at every level, then confirms the
//! final y against the challenge and derives the quality string. Pure
//! computation; any predicate failure yields the empty quality.

use sha2::{Digest, Sha256};

use crate::bits::{byte_align, slice_u64, BitWriter};
use crate::constants::*;
use crate::f_calc::{matches_pair, F1Calculator, FxCalculator, Metadata};

/// SHA-256 of the challenge and one adjacent leaf pair, the pair packed as
/// two k-bit values.
pub(crate) fn hash_quality(challenge: &[u8; 32], k: u32, x_a: u64, x_b: u64) -> [u8; 32] {
    let mut packed = BitWriter::with_capacity(byte_align(2 * k as u64));
    packed.push(x_a as u128, k);
    packed.push(x_b as u128, k);
    let mut hasher = Sha256::new();
    hasher.update(challenge);
    hasher.update(packed.as_bytes());
    hasher.finalize().into()
}

/// Validates a proof-ordered proof against `(id, k, challenge)`. Returns
/// the 256-bit quality on success, `None` on any mismatch.
pub fn validate_proof(
    id: &[u8; K_ID_LEN],
    k: u32,
    challenge: &[u8; 32],
    proof: &[u8],
) -> Option<[u8; 32]> {
    if !(K_MIN_PLOT_SIZE..=K_MAX_PLOT_SIZE).contains(&k) {
        return None;
    }
    if proof.len() as u64 * 8 != 64 * k as u64 {
        return None;
    }
    let xs: Vec<u64> = (0..64)
        .map(|i| slice_u64(proof, i * k as u64, k))
        .collect();

    // Level 1: f1 of every leaf.
    let f1 = F1Calculator::new(k, id);
    let mut ys: Vec<u64> = xs.iter().map(|&x| f1.calculate_f(x)).collect();
    let mut metadata: Vec<Metadata> = xs.iter().map(|&x| Metadata::from_u64(x, k)).collect();

    // Levels 2..7: each adjacent pair must match left-to-right in proof
    // order, and folds into the next level.
    for table in 2..=7u32 {
        let fx = FxCalculator::new(k, table);
        let mut next_ys = Vec::with_capacity(ys.len() / 2);
        let mut next_meta = Vec::with_capacity(ys.len() / 2);
        for i in (0..ys.len()).step_by(2) {
            if !matches_pair(ys[i], ys[i + 1]) {
                return None;
            }
            let (y, meta) = fx.calculate_bucket(ys[i], &metadata[i], &metadata[i + 1]);
            next_ys.push(y);
            next_meta.push(meta);
        }
        ys = next_ys;
        metadata = next_meta;
    }

    // The surviving y must reproduce the challenge's top k bits.
    if ys[0] >> K_EXTRA_BITS != slice_u64(challenge, 0, k) {
        return None;
    }

    let quality_index = (challenge[31] & 0x1f) as usize;
    let plot_ordered = proof_to_plot_order(&xs);
    Some(hash_quality(
        challenge,
        k,
        plot_ordered[quality_index * 2],
        plot_ordered[quality_index * 2 + 1],
    ))
}

/// Converts a proof-ordered leaf list into plot order: at every level the
/// half that compares smaller (k-bit chunks, last chunk first) leads.
fn proof_to_plot_order(xs: &[u64]) -> Vec<u64> {
    let mut values = xs.to_vec();
    for level in 1..=6u32 {
        let half = 1usize << (level - 1);
        let mut next = Vec::with_capacity(values.len());
        for pair in values.chunks_exact(2 * half) {
            let (l, r) = pair.split_at(half);
            if chunks_greater(l, r) {
                next.extend_from_slice(r);
                next.extend_from_slice(l);
            } else {
                next.extend_from_slice(l);
                next.extend_from_slice(r);
            }
        }
        values = next;
    }
    values
}

/// Compares two equal-length leaf runs from the last value backward.
fn chunks_greater(l: &[u64], r: &[u64]) -> bool {
    for (a, b) in l.iter().rev().zip(r.iter().rev()) {
        if a > b {
            return true;
        }
        if a < b {
            return false;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_wrong_length() {
        let id = [1u8; 32];
        let challenge = [2u8; 32];
        assert!(validate_proof(&id, 20, &challenge, &[0u8; 10]).is_none());
        assert!(validate_proof(&id, 17, &challenge, &[0u8; 136]).is_none());
    }

    #[test]
    fn test_reject_garbage_proof() {
        // A random proof has essentially zero chance of matching at every
        // level; the verifier must fail closed rather than panic.
        let id = [3u8; 32];
        let challenge = [4u8; 32];
        let proof = vec![0xA5u8; 8 * 20];
        assert!(validate_proof(&id, 20, &challenge, &proof).is_none());
    }

    #[test]
    fn test_plot_order_swaps_pairs() {
        let mut xs: Vec<u64> = (0..64).collect();
        xs.swap(0, 1);
        let ordered = proof_to_plot_order(&xs);
        assert_eq!(ordered[0], 0);
        assert_eq!(ordered[1], 1);
    }

    #[test]
    fn test_plot_order_compares_last_chunk_first() {
        // [5, 9] vs [6, 7]: the tails 9 > 7 decide, despite 5 < 6.
        assert!(chunks_greater(&[5, 9], &[6, 7]));
        assert!(!chunks_greater(&[9, 5], &[7, 6]));
        assert!(!chunks_greater(&[1, 2], &[1, 2]));
    }

    #[test]
    fn test_quality_hash_is_order_sensitive() {
        let challenge = [7u8; 32];
        assert_ne!(
            hash_quality(&challenge, 20, 1, 2),
            hash_quality(&challenge, 20, 2, 1)
        );
    }
}
