//! 8-round ChaCha keystream generator.
//!
//! The f1 function draws its entropy from a ChaCha8 keystream keyed by the
//! plot id, with a zero nonce and a 64-bit block counter. Only keystream
//! generation is needed; there is no encryption path.

/// Keystream block size in bytes.
pub const BLOCK_SIZE: usize = 64;

const SIGMA: [u32; 4] = [0x6170_7865, 0x3320_646e, 0x7962_2d32, 0x6b20_6574];

#[derive(Clone)]
pub struct ChaCha8 {
    state: [u32; 16],
}

#[inline(always)]
fn quarter_round(state: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize) {
    state[a] = state[a].wrapping_add(state[b]);
    state[d] = (state[d] ^ state[a]).rotate_left(16);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_left(12);
    state[a] = state[a].wrapping_add(state[b]);
    state[d] = (state[d] ^ state[a]).rotate_left(8);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_left(7);
}

impl ChaCha8 {
    /// 256-bit key, zero nonce.
    pub fn new(key: &[u8; 32]) -> Self {
        let mut state = [0u32; 16];
        state[..4].copy_from_slice(&SIGMA);
        for i in 0..8 {
            state[4 + i] = u32::from_le_bytes(key[4 * i..4 * i + 4].try_into().unwrap());
        }
        // words 12..13 hold the 64-bit block counter, 14..15 the zero nonce
        Self { state }
    }

    fn block(&self, counter: u64, out: &mut [u8]) {
        debug_assert_eq!(out.len(), BLOCK_SIZE);
        let mut input = self.state;
        input[12] = counter as u32;
        input[13] = (counter >> 32) as u32;

        let mut x = input;
        for _ in 0..4 {
            quarter_round(&mut x, 0, 4, 8, 12);
            quarter_round(&mut x, 1, 5, 9, 13);
            quarter_round(&mut x, 2, 6, 10, 14);
            quarter_round(&mut x, 3, 7, 11, 15);
            quarter_round(&mut x, 0, 5, 10, 15);
            quarter_round(&mut x, 1, 6, 11, 12);
            quarter_round(&mut x, 2, 7, 8, 13);
            quarter_round(&mut x, 3, 4, 9, 14);
        }
        for i in 0..16 {
            let word = x[i].wrapping_add(input[i]);
            out[4 * i..4 * i + 4].copy_from_slice(&word.to_le_bytes());
        }
    }

    /// Fills `out` with `out.len() / 64` consecutive keystream blocks
    /// starting at `counter`.
    pub fn keystream(&self, counter: u64, out: &mut [u8]) {
        debug_assert_eq!(out.len() % BLOCK_SIZE, 0);
        for (i, chunk) in out.chunks_exact_mut(BLOCK_SIZE).enumerate() {
            self.block(counter + i as u64, chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_is_deterministic() {
        let cipher = ChaCha8::new(&[7u8; 32]);
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        cipher.block(42, &mut a);
        cipher.block(42, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_counter_changes_output() {
        let cipher = ChaCha8::new(&[7u8; 32]);
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        cipher.block(0, &mut a);
        cipher.block(1, &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_keystream_matches_blocks() {
        let cipher = ChaCha8::new(&[3u8; 32]);
        let mut run = vec![0u8; 256];
        cipher.keystream(10, &mut run);
        for i in 0..4u64 {
            let mut single = [0u8; 64];
            cipher.block(10 + i, &mut single);
            assert_eq!(&run[i as usize * 64..(i as usize + 1) * 64], &single);
        }
    }

    #[test]
    fn test_key_changes_output() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        ChaCha8::new(&[0u8; 32]).block(0, &mut a);
        ChaCha8::new(&[1u8; 32]).block(0, &mut b);
        assert_ne!(a, b);
    }
}
