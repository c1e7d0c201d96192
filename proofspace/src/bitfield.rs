//! Bitfield with a superblock rank index, used by Phase 2 to mark
//! referenced entries and remap positions into the compacted tables.

/// Bits per rank superblock.
const SUPERBLOCK_BITS: u64 = 512;

pub struct Bitfield {
    words: Vec<u64>,
    len: u64,
}

impl Bitfield {
    pub fn new(len: u64) -> Self {
        Self {
            words: vec![0u64; ((len + 63) / 64) as usize],
            len,
        }
    }

    /// A bitfield with every position marked (table 7 is fully retained).
    pub fn all_set(len: u64) -> Self {
        let mut bf = Self {
            words: vec![u64::MAX; ((len + 63) / 64) as usize],
            len,
        };
        // clear the tail beyond len
        let tail = len % 64;
        if tail != 0 {
            let last = bf.words.len() - 1;
            bf.words[last] = (1u64 << tail) - 1;
        }
        bf
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn set(&mut self, index: u64) {
        debug_assert!(index < self.len);
        self.words[(index / 64) as usize] |= 1u64 << (index % 64);
    }

    #[inline]
    pub fn get(&self, index: u64) -> bool {
        debug_assert!(index < self.len);
        self.words[(index / 64) as usize] & (1u64 << (index % 64)) != 0
    }

    pub fn count_set(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }
}

/// Cumulative popcounts every [`SUPERBLOCK_BITS`] bits, giving
/// constant-time-ish rank queries over a frozen bitfield.
pub struct RankIndex {
    superblocks: Vec<u64>,
}

impl RankIndex {
    pub fn build(bf: &Bitfield) -> Self {
        let blocks = (bf.len + SUPERBLOCK_BITS - 1) / SUPERBLOCK_BITS + 1;
        let mut superblocks = Vec::with_capacity(blocks as usize);
        let mut acc = 0u64;
        superblocks.push(0);
        let words_per_block = (SUPERBLOCK_BITS / 64) as usize;
        for chunk in bf.words.chunks(words_per_block) {
            acc += chunk.iter().map(|w| w.count_ones() as u64).sum::<u64>();
            superblocks.push(acc);
        }
        Self { superblocks }
    }

    /// Number of set bits strictly before `pos`. For a set bit this is its
    /// dense index in the compacted table.
    pub fn rank(&self, bf: &Bitfield, pos: u64) -> u64 {
        debug_assert!(pos <= bf.len);
        let block = pos / SUPERBLOCK_BITS;
        let mut acc = self.superblocks[block as usize];
        let first_word = (block * SUPERBLOCK_BITS / 64) as usize;
        let last_word = (pos / 64) as usize;
        for w in &bf.words[first_word..last_word] {
            acc += w.count_ones() as u64;
        }
        let tail = pos % 64;
        if tail != 0 {
            acc += (bf.words[last_word] & ((1u64 << tail) - 1)).count_ones() as u64;
        }
        acc
    }
}

/// Whether the host CPU exposes a hardware popcount. The bitfield path
/// leans on popcount-heavy rank queries, so plotting refuses to start
/// without it.
pub fn have_popcnt() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::arch::is_x86_feature_detected!("popcnt")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let mut bf = Bitfield::new(1000);
        bf.set(0);
        bf.set(63);
        bf.set(64);
        bf.set(999);
        assert!(bf.get(0) && bf.get(63) && bf.get(64) && bf.get(999));
        assert!(!bf.get(1) && !bf.get(998));
        assert_eq!(bf.count_set(), 4);
    }

    #[test]
    fn test_all_set_tail() {
        let bf = Bitfield::all_set(70);
        assert_eq!(bf.count_set(), 70);
        assert!(bf.get(69));
    }

    #[test]
    fn test_rank_matches_linear_count() {
        let mut bf = Bitfield::new(3000);
        for i in (0..3000).step_by(7) {
            bf.set(i);
        }
        let idx = RankIndex::build(&bf);
        let mut count = 0u64;
        for pos in 0..3000 {
            assert_eq!(idx.rank(&bf, pos), count, "pos {pos}");
            if bf.get(pos) {
                count += 1;
            }
        }
        assert_eq!(idx.rank(&bf, 3000), count);
    }

    #[test]
    fn test_rank_dense_indices() {
        let mut bf = Bitfield::new(600);
        let set: Vec<u64> = vec![3, 77, 500, 512, 599];
        for &i in &set {
            bf.set(i);
        }
        let idx = RankIndex::build(&bf);
        for (dense, &pos) in set.iter().enumerate() {
            assert_eq!(idx.rank(&bf, pos), dense as u64);
        }
    }
}
