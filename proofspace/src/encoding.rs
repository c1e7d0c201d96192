//! Line-point algebra and the static compression codes.
//!
//! Final tables store pairs of back-pointers as *line points*: the pair
//! `(x, y)` with `x >= y` maps to `x(x-1)/2 + y`, folding the square of
//! possible pairs into a triangle so sorted deltas stay small. Consecutive
//! line points inside a park are delta-encoded: the low `k - 3` bits of
//! each delta are raw stubs, the high part goes through a static canonical
//! prefix code.
//!
//! The codes are canonical Huffman codes built once per distribution
//! parameter `R` from integer weights, so encoder and decoder derive the
//! exact same table without ever serializing it.

use byteorder::{BigEndian, ByteOrder};
use once_cell::sync::Lazy;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::bits::{slice_u128, slice_u64, BitWriter};
use crate::constants::*;
use crate::entry_sizes;
use crate::{PosError, Result};

/// Symbols 0..62 encode the delta directly; 63 escapes to a raw field.
pub const DELTA_ALPHABET: usize = 64;
const ESCAPE_SYMBOL: u64 = (DELTA_ALPHABET - 1) as u64;
const ESCAPE_RAW_BITS: u32 = 24;

#[inline]
fn x_enc(x: u128) -> u128 {
    x * x.saturating_sub(1) / 2
}

/// Maps an unordered pair into the triangle. Order of arguments does not
/// matter.
pub fn square_to_line_point(x: u64, y: u64) -> u128 {
    let (a, b) = if y > x { (y, x) } else { (x, y) };
    x_enc(a as u128) + b as u128
}

/// Inverse of [`square_to_line_point`]; returns `(larger, smaller)`.
/// Performs the square root bit by bit to keep full 128-bit precision.
pub fn line_point_to_square(lp: u128) -> (u64, u64) {
    let mut x: u64 = 0;
    for i in (0..64).rev() {
        let candidate = x | (1u64 << i);
        if x_enc(candidate as u128) <= lp {
            x = candidate;
        }
    }
    (x, (lp - x_enc(x as u128)) as u64)
}

/// A canonical prefix code over small delta values.
pub struct DeltaCode {
    codes: [(u64, u32); DELTA_ALPHABET],
    max_len: u32,
    // canonical decode tables, indexed by code length
    first_code: Vec<u64>,
    count: Vec<u32>,
    offset: Vec<u32>,
    symbols: Vec<u8>,
}

impl DeltaCode {
    /// Builds the code for the geometric distribution `p(x) ∝ e^(-x/r)`.
    pub fn new(r: f64) -> Self {
        let weights: Vec<u64> = (0..DELTA_ALPHABET)
            .map(|x| {
                let p = (-(x as f64) / r).exp() * (1u64 << 30) as f64;
                (p.round() as u64).max(1)
            })
            .collect();
        let lens = huffman_lengths(&weights);
        Self::from_lengths(&lens)
    }

    fn from_lengths(lens: &[u32; DELTA_ALPHABET]) -> Self {
        let max_len = *lens.iter().max().unwrap();
        let mut order: Vec<u8> = (0..DELTA_ALPHABET as u8).collect();
        order.sort_by_key(|&s| (lens[s as usize], s));

        let mut codes = [(0u64, 0u32); DELTA_ALPHABET];
        let mut first_code = vec![0u64; max_len as usize + 1];
        let mut count = vec![0u32; max_len as usize + 1];
        let mut offset = vec![0u32; max_len as usize + 1];

        let mut next: u64 = 0;
        let mut cur_len = lens[order[0] as usize];
        for (i, &sym) in order.iter().enumerate() {
            let len = lens[sym as usize];
            if i > 0 {
                next += 1;
                next <<= len - cur_len;
                cur_len = len;
            }
            if count[len as usize] == 0 {
                first_code[len as usize] = next;
                offset[len as usize] = i as u32;
            }
            count[len as usize] += 1;
            codes[sym as usize] = (next, len);
        }

        Self {
            codes,
            max_len,
            first_code,
            count,
            offset,
            symbols: order,
        }
    }

    /// Appends the codeword for `value` to `out`.
    pub fn encode(&self, out: &mut BitWriter, value: u64) -> Result<()> {
        if value >= ESCAPE_SYMBOL {
            if value >= 1 << ESCAPE_RAW_BITS {
                return Err(PosError::InvariantViolation(format!(
                    "delta {value} exceeds the escape range"
                )));
            }
            let (code, len) = self.codes[ESCAPE_SYMBOL as usize];
            out.push(code as u128, len);
            out.push(value as u128, ESCAPE_RAW_BITS);
        } else {
            let (code, len) = self.codes[value as usize];
            out.push(code as u128, len);
        }
        Ok(())
    }

    /// Decodes one value starting at `*pos` (a bit offset into `bytes`),
    /// advancing `*pos`. `end` bounds the readable bit range.
    pub fn decode(&self, bytes: &[u8], pos: &mut u64, end: u64) -> Result<u64> {
        let mut code: u64 = 0;
        let mut len: u32 = 0;
        while len < self.max_len {
            if *pos >= end {
                return Err(PosError::InvariantViolation(
                    "truncated delta stream".into(),
                ));
            }
            code = (code << 1) | slice_u64(bytes, *pos, 1);
            *pos += 1;
            len += 1;
            let n = self.count[len as usize];
            if n == 0 {
                continue;
            }
            let first = self.first_code[len as usize];
            if code >= first && code < first + n as u64 {
                let sym =
                    self.symbols[(self.offset[len as usize] + (code - first) as u32) as usize];
                if sym as u64 == ESCAPE_SYMBOL {
                    if *pos + ESCAPE_RAW_BITS as u64 > end {
                        return Err(PosError::InvariantViolation(
                            "truncated delta escape".into(),
                        ));
                    }
                    let raw = slice_u64(bytes, *pos, ESCAPE_RAW_BITS);
                    *pos += ESCAPE_RAW_BITS as u64;
                    return Ok(raw);
                }
                return Ok(sym as u64);
            }
        }
        Err(PosError::InvariantViolation("bad delta code".into()))
    }
}

/// Huffman code lengths from integer weights. Ties are broken by node
/// creation order, so the result is fully deterministic.
fn huffman_lengths(weights: &[u64]) -> [u32; DELTA_ALPHABET] {
    assert_eq!(weights.len(), DELTA_ALPHABET);
    let mut parent: Vec<usize> = vec![usize::MAX; DELTA_ALPHABET];
    let mut node_weight: Vec<u64> = weights.to_vec();
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = (0..DELTA_ALPHABET)
        .map(|i| Reverse((weights[i], i)))
        .collect();

    while heap.len() > 1 {
        let Reverse((wa, a)) = heap.pop().unwrap();
        let Reverse((wb, b)) = heap.pop().unwrap();
        let id = node_weight.len();
        node_weight.push(wa + wb);
        parent.push(usize::MAX);
        parent[a] = id;
        parent[b] = id;
        heap.push(Reverse((wa + wb, id)));
    }

    let mut lens = [0u32; DELTA_ALPHABET];
    for (sym, len) in lens.iter_mut().enumerate() {
        let mut node = sym;
        while parent[node] != usize::MAX {
            node = parent[node];
            *len += 1;
        }
    }
    lens
}

static TABLE_CODES: Lazy<Vec<DeltaCode>> =
    Lazy::new(|| K_R_VALUES.iter().map(|&r| DeltaCode::new(r)).collect());
static C3_CODE: Lazy<DeltaCode> = Lazy::new(|| DeltaCode::new(K_C3_R));

/// The static delta code for parks of final table `table` (1..=6).
pub fn table_delta_code(table: u32) -> &'static DeltaCode {
    &TABLE_CODES[table as usize - 1]
}

/// The static delta code for C3 checkpoint blocks.
pub fn c3_delta_code() -> &'static DeltaCode {
    &C3_CODE
}

/// Encodes up to `K_ENTRIES_PER_PARK` sorted line points as one park of
/// exactly `park_size(k, table)` bytes.
pub fn encode_park(k: u32, table: u32, line_points: &[u128]) -> Result<Vec<u8>> {
    debug_assert!(!line_points.is_empty());
    debug_assert!(line_points.len() <= K_ENTRIES_PER_PARK as usize);

    let lp_size = entry_sizes::line_point_size(k) as usize;
    let stubs_size = entry_sizes::stubs_size(k) as usize;
    let max_deltas = entry_sizes::max_deltas_size(table) as usize;
    let total = entry_sizes::park_size(k, table) as usize;
    let mut out = vec![0u8; total];

    let mut anchor = BitWriter::with_capacity(2 * k as u64);
    anchor.push(line_points[0], 2 * k);
    out[..lp_size].copy_from_slice(anchor.as_bytes());

    let stub_bits = k - K_STUB_MINUS_BITS;
    let stub_mask = (1u128 << stub_bits) - 1;
    let code = table_delta_code(table);
    let mut stubs = BitWriter::with_capacity(stubs_size as u64 * 8);
    let mut deltas = BitWriter::new();
    for pair in line_points.windows(2) {
        let delta = pair[1].checked_sub(pair[0]).ok_or_else(|| {
            PosError::InvariantViolation("park line points are not sorted".into())
        })?;
        stubs.push(delta & stub_mask, stub_bits);
        code.encode(&mut deltas, (delta >> stub_bits) as u64)?;
    }
    let stub_bytes = stubs.as_bytes();
    out[lp_size..lp_size + stub_bytes.len()].copy_from_slice(stub_bytes);

    let delta_bytes = deltas.into_bytes();
    if delta_bytes.len() > max_deltas {
        return Err(PosError::InvariantViolation(format!(
            "park deltas overflow: {} > {} bytes",
            delta_bytes.len(),
            max_deltas
        )));
    }
    let len_at = lp_size + stubs_size;
    BigEndian::write_u16(&mut out[len_at..len_at + 2], delta_bytes.len() as u16);
    out[len_at + 2..len_at + 2 + delta_bytes.len()].copy_from_slice(&delta_bytes);
    Ok(out)
}

/// Decodes the line point at `idx` within a park.
pub fn decode_park_entry(k: u32, table: u32, park: &[u8], idx: usize) -> Result<u128> {
    let lp0 = slice_u128(park, 0, 2 * k);
    if idx == 0 {
        return Ok(lp0);
    }
    let lp_size = entry_sizes::line_point_size(k) as usize;
    let stubs_size = entry_sizes::stubs_size(k) as usize;
    let stub_bits = k - K_STUB_MINUS_BITS;
    let len_at = lp_size + stubs_size;
    let delta_len = BigEndian::read_u16(&park[len_at..len_at + 2]) as u64;
    let delta_base = (len_at as u64 + 2) * 8;
    // a corrupted length prefix must not read past the park
    let delta_end = (delta_base + delta_len * 8).min(park.len() as u64 * 8);

    let code = table_delta_code(table);
    let mut acc = lp0;
    let mut pos = delta_base;
    for j in 0..idx {
        let high = code.decode(park, &mut pos, delta_end)?;
        let stub = slice_u128(park, (lp_size as u64 * 8) + j as u64 * stub_bits as u64, stub_bits);
        acc += ((high as u128) << stub_bits) | stub;
    }
    Ok(acc)
}

/// Decodes the first `count` line points of a park.
pub fn decode_park(k: u32, table: u32, park: &[u8], count: usize) -> Result<Vec<u128>> {
    let lp_size = entry_sizes::line_point_size(k) as usize;
    let stubs_size = entry_sizes::stubs_size(k) as usize;
    let stub_bits = k - K_STUB_MINUS_BITS;
    let len_at = lp_size + stubs_size;
    let delta_len = BigEndian::read_u16(&park[len_at..len_at + 2]) as u64;
    let delta_base = (len_at as u64 + 2) * 8;
    let delta_end = (delta_base + delta_len * 8).min(park.len() as u64 * 8);
    let code = table_delta_code(table);

    let mut out = Vec::with_capacity(count);
    let mut acc = slice_u128(park, 0, 2 * k);
    out.push(acc);
    let mut pos = delta_base;
    for j in 0..count.saturating_sub(1) {
        let high = code.decode(park, &mut pos, delta_end)?;
        let stub = slice_u128(park, (lp_size as u64 * 8) + j as u64 * stub_bits as u64, stub_bits);
        acc += ((high as u128) << stub_bits) | stub;
        out.push(acc);
    }
    Ok(out)
}

/// Encodes one checkpoint group of sorted f7 values as a fixed-stride C3
/// block (the first value is anchored by the C1 entry and not encoded).
pub fn encode_c3(k: u32, f7s: &[u64]) -> Result<Vec<u8>> {
    let total = entry_sizes::c3_size(k) as usize;
    let mut out = vec![0u8; total];
    let code = c3_delta_code();
    let mut w = BitWriter::new();
    for pair in f7s.windows(2) {
        let delta = pair[1].checked_sub(pair[0]).ok_or_else(|| {
            PosError::InvariantViolation("checkpoint f7 values are not sorted".into())
        })?;
        code.encode(&mut w, delta)?;
    }
    let bytes = w.into_bytes();
    if bytes.len() + 2 > total {
        return Err(PosError::InvariantViolation(format!(
            "C3 block overflow: {} > {} bytes",
            bytes.len() + 2,
            total
        )));
    }
    BigEndian::write_u16(&mut out[..2], bytes.len() as u16);
    out[2..2 + bytes.len()].copy_from_slice(&bytes);
    Ok(out)
}

/// Decodes the `count - 1` deltas of a C3 block and reconstructs the group
/// from its anchor.
pub fn decode_c3(block: &[u8], anchor: u64, count: usize) -> Result<Vec<u64>> {
    let delta_len = BigEndian::read_u16(&block[..2]) as u64;
    let mut pos = 16u64;
    let end = (16 + delta_len * 8).min(block.len() as u64 * 8);
    let code = c3_delta_code();
    let mut out = Vec::with_capacity(count);
    let mut acc = anchor;
    out.push(acc);
    for _ in 1..count {
        acc += code.decode(block, &mut pos, end)?;
        out.push(acc);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_line_point_roundtrip() {
        for (x, y) in [(0u64, 0u64), (1, 0), (5, 5), (1000, 3), (3, 1000)] {
            let lp = square_to_line_point(x, y);
            let (a, b) = line_point_to_square(lp);
            let (hi, lo) = if x >= y { (x, y) } else { (y, x) };
            assert_eq!((a, b), (hi, lo));
        }
    }

    #[test]
    fn test_line_point_roundtrip_large() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let x = rng.gen::<u64>() >> 14; // within k = 50 position range
            let y = rng.gen::<u64>() >> 14;
            let (a, b) = line_point_to_square(square_to_line_point(x, y));
            assert_eq!((a, b), (x.max(y), x.min(y)));
        }
    }

    #[test]
    fn test_delta_code_roundtrip() {
        let code = DeltaCode::new(2.75);
        let values = [0u64, 1, 2, 5, 20, 62, 63, 100, 5000, (1 << 24) - 1];
        let mut w = BitWriter::new();
        for &v in &values {
            code.encode(&mut w, v).unwrap();
        }
        let end = w.bit_len();
        let bytes = w.into_bytes();
        let mut pos = 0u64;
        for &v in &values {
            assert_eq!(code.decode(&bytes, &mut pos, end).unwrap(), v);
        }
        assert_eq!(pos, end);
    }

    #[test]
    fn test_delta_code_kraft_equality() {
        // Huffman lengths must satisfy the Kraft equality exactly.
        for &r in K_R_VALUES.iter().chain([K_C3_R].iter()) {
            let code = DeltaCode::new(r);
            let sum: f64 = code
                .codes
                .iter()
                .map(|&(_, len)| (0.5f64).powi(len as i32))
                .sum();
            assert!((sum - 1.0).abs() < 1e-9, "r={r} kraft sum {sum}");
        }
    }

    #[test]
    fn test_delta_code_deterministic() {
        let a = DeltaCode::new(2.45);
        let b = DeltaCode::new(2.45);
        assert_eq!(a.codes, b.codes);
    }

    #[test]
    fn test_park_roundtrip() {
        let k = 18;
        let mut rng = StdRng::seed_from_u64(11);
        let mut lps: Vec<u128> = Vec::new();
        let mut acc: u128 = rng.gen_range(0..1u128 << 20);
        for _ in 0..K_ENTRIES_PER_PARK {
            lps.push(acc);
            // geometric-ish gaps around the k = 18 average
            acc += 1 + rng.gen_range(0..1u128 << 16);
        }
        for table in 1..=6 {
            let park = encode_park(k, table, &lps).unwrap();
            assert_eq!(park.len(), entry_sizes::park_size(k, table) as usize);
            for idx in [0usize, 1, 2, 100, 2047] {
                assert_eq!(decode_park_entry(k, table, &park, idx).unwrap(), lps[idx]);
            }
            let all = decode_park(k, table, &park, lps.len()).unwrap();
            assert_eq!(all, lps);
        }
    }

    #[test]
    fn test_partial_park() {
        let k = 20;
        let lps: Vec<u128> = (0..17u128).map(|i| i * 131071 + 5).collect();
        let park = encode_park(k, 3, &lps).unwrap();
        let all = decode_park(k, 3, &park, lps.len()).unwrap();
        assert_eq!(all, lps);
    }

    #[test]
    fn test_c3_roundtrip() {
        let k = 20;
        let mut rng = StdRng::seed_from_u64(3);
        let mut f7s: Vec<u64> = Vec::new();
        let mut acc = 1000u64;
        for _ in 0..K_CHECKPOINT1_INTERVAL {
            f7s.push(acc);
            acc += rng.gen_range(0..4);
        }
        let block = encode_c3(k, &f7s).unwrap();
        assert_eq!(block.len(), entry_sizes::c3_size(k) as usize);
        let decoded = decode_c3(&block, f7s[0], f7s.len()).unwrap();
        assert_eq!(decoded, f7s);
    }

    #[test]
    fn test_unsorted_park_rejected() {
        let k = 18;
        let lps = vec![10u128, 5u128];
        assert!(matches!(
            encode_park(k, 2, &lps),
            Err(PosError::InvariantViolation(_))
        ));
    }
}
