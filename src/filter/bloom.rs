//! Bloom filter block.
//!
//! Blob layout: `[bits...][num_hashes: u8]`. Probe indexes are derived
//! by double hashing, `h1 + i * h2` over the bit count, with the two
//! hashes taken from seeded xxh32 runs over the key.

use xxhash_rust::xxh32::xxh32;

use crate::config::DirOptions;

const BLOOM_SEED_1: u32 = 0xbc9f_1d34;
const BLOOM_SEED_2: u32 = 0x7a2d_c331;

/// Probe counts above this mark are reserved for future encodings and
/// match everything.
const MAX_PROBES: u8 = 30;

fn hash_pair(key: &[u8]) -> (u64, u64) {
    (
        xxh32(key, BLOOM_SEED_1) as u64,
        xxh32(key, BLOOM_SEED_2) as u64,
    )
}

/// Builds the bloom stripe for one data block.
pub struct BloomBlock {
    bits_per_key: usize,
    num_probes: u8,
    bits: Vec<u8>,
    num_bits: u64,
}

impl BloomBlock {
    pub fn new(options: &DirOptions) -> Self {
        // k = bits_per_key * ln(2) rounded, clamped to the encodable range.
        let k = (options.bf_bits_per_key as f64 * 0.69).round() as u8;
        Self {
            bits_per_key: options.bf_bits_per_key,
            num_probes: k.clamp(1, MAX_PROBES),
            bits: Vec::new(),
            num_bits: 0,
        }
    }

    /// Sizes the bit array for the expected number of keys.
    pub fn reset(&mut self, num_keys: u32) {
        let num_bits = (num_keys as u64 * self.bits_per_key as u64).max(64);
        let num_bytes = num_bits.div_ceil(8) as usize;
        self.bits.clear();
        self.bits.resize(num_bytes, 0);
        self.num_bits = num_bytes as u64 * 8;
    }

    pub fn add_key(&mut self, key: &[u8]) {
        debug_assert!(!self.bits.is_empty(), "reset() must size the filter first");
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_probes {
            let bit = h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Emits the blob. The builder keeps its sizing and may be `reset`
    /// for the next block.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut blob = std::mem::take(&mut self.bits);
        blob.push(self.num_probes);
        self.num_bits = 0;
        blob
    }
}

/// Tests a key against a finished bloom blob. No false negatives;
/// false positives at a rate set by the bits-per-key budget.
pub fn bloom_key_may_match(key: &[u8], filter: &[u8]) -> bool {
    if filter.len() < 2 {
        return false;
    }
    let num_probes = filter[filter.len() - 1];
    if num_probes > MAX_PROBES {
        // Reserved encoding: cannot rule the key out.
        return true;
    }
    let num_bits = ((filter.len() - 1) * 8) as u64;
    let (h1, h2) = hash_pair(key);
    for i in 0..num_probes {
        let bit = h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits;
        if filter[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
            return false;
        }
    }
    true
}
