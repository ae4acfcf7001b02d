//! Cuckoo filter block, optionally carrying a small value payload per
//! slot so the filter doubles as a tiny hash table.
//!
//! Blob layout:
//!
//! ```text
//! +--------------------+-----------------+-------------------+
//! | table 0            | table 1 ...     | tail (11 bytes)   |
//! +--------------------+-----------------+-------------------+
//! tail: [num_tables: u32][bucket_count: u32]
//!       [bits_per_fingerprint: u8][bits_per_value: u8][variant: u8]
//! ```
//!
//! Every table has the same geometry: `bucket_count` buckets of four
//! bit-packed slots. A slot holds a non-zero fingerprint (zero marks a
//! free slot) followed by the value payload. Insertion displaces
//! fingerprints along an eviction chain; when the chain is exhausted the
//! spilling entry point allocates a fresh table of identical geometry
//! and retries there, so `add_key` never rejects a key. Lookups scan the
//! two candidate buckets of every table.

use byteorder::{LittleEndian, WriteBytesExt};
use xxhash_rust::xxh32::xxh32;
use xxhash_rust::xxh64::xxh64;

use crate::config::DirOptions;
use crate::encoding::decode_fixed32;

const SLOTS_PER_BUCKET: usize = 4;
const TAIL_SIZE: usize = 11;

/// Tail byte identifying the cuckoo blob encoding.
pub const CUCKOO_VARIANT: u8 = 0x02;

/// Fixed seed for key hashing. Blob lookups carry no options, so the
/// key hash cannot be configurable; only the eviction RNG is seeded
/// from options.
const CUCKOO_KEY_SEED: u64 = 301;

const FINGERPRINT_SPREAD_SEED: u32 = 0x5bd1_e995;

fn cuckoo_hash(key: &[u8]) -> u64 {
    xxh64(key, CUCKOO_KEY_SEED)
}

/// Derives a non-zero fingerprint of `bits` bits from a key hash.
fn cuckoo_fingerprint(hash: u64, bits: u8) -> u32 {
    let mask = if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    };
    let fp = (hash as u32) & mask;
    if fp == 0 {
        1
    } else {
        fp
    }
}

fn primary_index(hash: u64, num_buckets: usize) -> usize {
    ((hash >> 32) as usize) % num_buckets
}

/// The partner bucket of `index` for a fingerprint. An involution when
/// the bucket count is a power of two.
fn alt_index(index: usize, fp: u32, num_buckets: usize) -> usize {
    (index ^ xxh32(&fp.to_le_bytes(), FINGERPRINT_SPREAD_SEED) as usize) % num_buckets
}

/// Bucket count for an expected key volume. A positive occupation
/// target rounds up to the next power of two; a negative target asks
/// for the exact count.
fn bucket_count(num_keys: u32, frac: f64) -> usize {
    let exact = (num_keys as usize).div_ceil(SLOTS_PER_BUCKET).max(1);
    if frac > 0.0 {
        let target = ((exact as f64) / frac).ceil() as usize;
        target.next_power_of_two()
    } else {
        exact
    }
}

fn read_bits(data: &[u8], mut offset: usize, mut count: usize) -> u64 {
    let mut out = 0u64;
    let mut shift = 0;
    while count > 0 {
        let byte = data[offset / 8] as u64;
        let bit = offset % 8;
        let take = (8 - bit).min(count);
        let chunk = (byte >> bit) & ((1u64 << take) - 1);
        out |= chunk << shift;
        shift += take;
        offset += take;
        count -= take;
    }
    out
}

fn write_bits(data: &mut [u8], mut offset: usize, mut count: usize, mut value: u64) {
    while count > 0 {
        let bit = offset % 8;
        let take = (8 - bit).min(count);
        let mask = ((1u64 << take) - 1) as u8;
        let byte = &mut data[offset / 8];
        *byte = (*byte & !(mask << bit)) | (((value as u8) & mask) << bit);
        value >>= take;
        offset += take;
        count -= take;
    }
}

/// One fixed-geometry table of bit-packed buckets.
struct CuckooTable {
    num_buckets: usize,
    fp_bits: u8,
    value_bits: u8,
    data: Vec<u8>,
}

impl CuckooTable {
    fn new(num_buckets: usize, fp_bits: u8, value_bits: u8) -> Self {
        let bits = num_buckets * SLOTS_PER_BUCKET * (fp_bits + value_bits) as usize;
        Self {
            num_buckets,
            fp_bits,
            value_bits,
            data: vec![0u8; bits.div_ceil(8)],
        }
    }

    fn slot_bits(&self) -> usize {
        self.fp_bits as usize + self.value_bits as usize
    }

    fn slot_offset(&self, bucket: usize, slot: usize) -> usize {
        (bucket * SLOTS_PER_BUCKET + slot) * self.slot_bits()
    }

    fn read_slot(&self, bucket: usize, slot: usize) -> (u32, u32) {
        let offset = self.slot_offset(bucket, slot);
        let fp = read_bits(&self.data, offset, self.fp_bits as usize) as u32;
        let value = if self.value_bits > 0 {
            read_bits(
                &self.data,
                offset + self.fp_bits as usize,
                self.value_bits as usize,
            ) as u32
        } else {
            0
        };
        (fp, value)
    }

    fn write_slot(&mut self, bucket: usize, slot: usize, fp: u32, value: u32) {
        let offset = self.slot_offset(bucket, slot);
        write_bits(&mut self.data, offset, self.fp_bits as usize, fp as u64);
        if self.value_bits > 0 {
            write_bits(
                &mut self.data,
                offset + self.fp_bits as usize,
                self.value_bits as usize,
                value as u64,
            );
        }
    }

    /// Places the entry in a free slot of `bucket` if one exists.
    fn insert_in_bucket(&mut self, bucket: usize, fp: u32, value: u32) -> bool {
        for slot in 0..SLOTS_PER_BUCKET {
            let (occupant, _) = self.read_slot(bucket, slot);
            if occupant == 0 {
                self.write_slot(bucket, slot, fp, value);
                return true;
            }
        }
        false
    }
}

fn xorshift(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

/// Builds the cuckoo stripe for one data block, or a standalone
/// filter/table over arbitrary keys.
pub struct CuckooBlock {
    fp_bits: u8,
    value_bits: u8,
    frac: f64,
    max_moves: usize,
    rng: u64,
    seed: u64,
    tables: Vec<CuckooTable>,
}

impl CuckooBlock {
    /// Fingerprint width comes from `cuckoo_bits_per_key`; `value_bits`
    /// is zero for a plain membership filter.
    pub fn new(options: &DirOptions, value_bits: u8) -> Self {
        let seed = u64::from(options.cuckoo_seed).max(1);
        Self {
            fp_bits: options.cuckoo_bits_per_key.clamp(1, 32),
            value_bits: value_bits.min(32),
            frac: options.cuckoo_frac,
            max_moves: options.cuckoo_max_moves,
            rng: seed,
            seed,
            tables: Vec::new(),
        }
    }

    /// Sizes the primary table for the expected number of keys,
    /// discarding any previous contents.
    pub fn reset(&mut self, num_keys: u32) {
        let num_buckets = bucket_count(num_keys, self.frac);
        self.tables = vec![CuckooTable::new(num_buckets, self.fp_bits, self.value_bits)];
        self.rng = self.seed;
    }

    /// Inserts a key, spilling to an auxiliary table when the current
    /// one rejects it. Never fails.
    pub fn add_key(&mut self, key: &[u8]) {
        self.add(key, 0)
    }

    /// [`CuckooBlock::add_key`] with a value payload.
    pub fn add(&mut self, key: &[u8], value: u32) {
        debug_assert!(!self.tables.is_empty(), "reset() must size the filter first");
        let hash = cuckoo_hash(key);
        let fp = cuckoo_fingerprint(hash, self.fp_bits);
        loop {
            let table = self.tables.last_mut().unwrap();
            let index = primary_index(hash, table.num_buckets);
            if insert_into(table, &mut self.rng, self.max_moves, fp, index, value) {
                return;
            }
            let geometry = self.tables[0].num_buckets;
            self.tables
                .push(CuckooTable::new(geometry, self.fp_bits, self.value_bits));
        }
    }

    /// Strict insertion into the current table only. Returns false when
    /// the eviction chain is exhausted, leaving spill decisions to the
    /// caller.
    pub fn test_add_key(&mut self, key: &[u8]) -> bool {
        self.test_add(key, 0)
    }

    /// [`CuckooBlock::test_add_key`] with a value payload.
    pub fn test_add(&mut self, key: &[u8], value: u32) -> bool {
        debug_assert!(!self.tables.is_empty(), "reset() must size the filter first");
        let hash = cuckoo_hash(key);
        let fp = cuckoo_fingerprint(hash, self.fp_bits);
        let table = self.tables.last_mut().unwrap();
        let index = primary_index(hash, table.num_buckets);
        insert_into(table, &mut self.rng, self.max_moves, fp, index, value)
    }

    /// Emits the sequence of tables followed by the self-describing
    /// tail.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut blob = Vec::new();
        for table in &self.tables {
            blob.extend_from_slice(&table.data);
        }
        blob.write_u32::<LittleEndian>(self.tables.len() as u32)
            .expect("write to vec");
        blob.write_u32::<LittleEndian>(
            self.tables.first().map_or(0, |t| t.num_buckets) as u32,
        )
        .expect("write to vec");
        blob.push(self.fp_bits);
        blob.push(self.value_bits);
        blob.push(CUCKOO_VARIANT);
        blob
    }

    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    pub fn num_buckets(&self) -> usize {
        self.tables.first().map_or(0, |t| t.num_buckets)
    }
}

fn insert_into(
    table: &mut CuckooTable,
    rng: &mut u64,
    max_moves: usize,
    fp: u32,
    index: usize,
    value: u32,
) -> bool {
    let num_buckets = table.num_buckets;
    let alt = alt_index(index, fp, num_buckets);
    if table.insert_in_bucket(index, fp, value) || table.insert_in_bucket(alt, fp, value) {
        return true;
    }

    let mut bucket = if xorshift(rng) & 1 == 0 { index } else { alt };
    let mut fp = fp;
    let mut value = value;
    for _ in 0..max_moves {
        let slot = xorshift(rng) as usize % SLOTS_PER_BUCKET;
        let (victim_fp, victim_value) = table.read_slot(bucket, slot);
        table.write_slot(bucket, slot, fp, value);
        fp = victim_fp;
        value = victim_value;
        bucket = alt_index(bucket, fp, num_buckets);
        if table.insert_in_bucket(bucket, fp, value) {
            return true;
        }
    }
    false
}

/// A decoded view over a finished cuckoo blob.
struct CuckooDir<'a> {
    tables: Vec<&'a [u8]>,
    num_buckets: usize,
    fp_bits: u8,
    value_bits: u8,
}

impl<'a> CuckooDir<'a> {
    fn parse(filter: &'a [u8]) -> Option<Self> {
        if filter.len() < TAIL_SIZE {
            return None;
        }
        let tail = &filter[filter.len() - TAIL_SIZE..];
        let num_tables = decode_fixed32(&tail[0..4]) as usize;
        let num_buckets = decode_fixed32(&tail[4..8]) as usize;
        let fp_bits = tail[8];
        let value_bits = tail[9];
        if tail[10] != CUCKOO_VARIANT
            || num_buckets == 0
            || fp_bits == 0
            || fp_bits > 32
            || value_bits > 32
        {
            return None;
        }

        let slot_bits = fp_bits as usize + value_bits as usize;
        let table_bytes = num_buckets
            .checked_mul(SLOTS_PER_BUCKET)?
            .checked_mul(slot_bits)?
            .div_ceil(8);
        let expected = num_tables.checked_mul(table_bytes)?;
        if table_bytes == 0 || filter.len() - TAIL_SIZE != expected {
            return None;
        }

        let tables = (0..num_tables)
            .map(|i| &filter[i * table_bytes..(i + 1) * table_bytes])
            .collect();
        Some(Self {
            tables,
            num_buckets,
            fp_bits,
            value_bits,
        })
    }

    fn probe<F: FnMut(u32)>(&self, key: &[u8], mut on_value: F) -> bool {
        let hash = cuckoo_hash(key);
        let fp = cuckoo_fingerprint(hash, self.fp_bits);
        let i1 = primary_index(hash, self.num_buckets);
        let i2 = alt_index(i1, fp, self.num_buckets);
        let slot_bits = self.fp_bits as usize + self.value_bits as usize;

        let candidates = [i1, i2];
        let buckets = if i1 == i2 {
            &candidates[..1]
        } else {
            &candidates[..]
        };
        let mut matched = false;
        for table in &self.tables {
            for &bucket in buckets {
                for slot in 0..SLOTS_PER_BUCKET {
                    let offset = (bucket * SLOTS_PER_BUCKET + slot) * slot_bits;
                    let occupant = read_bits(table, offset, self.fp_bits as usize) as u32;
                    if occupant == fp {
                        matched = true;
                        if self.value_bits > 0 {
                            let value = read_bits(
                                table,
                                offset + self.fp_bits as usize,
                                self.value_bits as usize,
                            ) as u32;
                            on_value(value);
                        }
                    }
                }
            }
        }
        matched
    }
}

/// Tests a key against a finished cuckoo blob. No false negatives; a
/// malformed blob cannot rule the key out and matches.
pub fn cuckoo_key_may_match(key: &[u8], filter: &[u8]) -> bool {
    match CuckooDir::parse(filter) {
        None => true,
        Some(dir) => dir.probe(key, |_| {}),
    }
}

/// Collects the value payloads of every slot whose fingerprint matches
/// the key, across all tables. The result is a candidate set: false
/// matches contribute values too, so callers must verify against the
/// primary data. Returns true if any slot matched.
pub fn cuckoo_values(key: &[u8], filter: &[u8], values: &mut Vec<u32>) -> bool {
    match CuckooDir::parse(filter) {
        None => true,
        Some(dir) => dir.probe(key, |value| values.push(value)),
    }
}
