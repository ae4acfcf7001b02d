//! Point-membership filters.
//!
//! Each data block gets one filter stripe, built while the block is
//! compacted and written into a separate filter stream. Two structures
//! are available: a classic bloom block and a cuckoo block that can also
//! carry a small value payload per key. Both emit self-describing blobs
//! and guarantee no false negatives; false positives only cost an extra
//! block probe.

pub mod bloom;
pub mod cuckoo;

pub use bloom::{bloom_key_may_match, BloomBlock};
pub use cuckoo::{cuckoo_key_may_match, cuckoo_values, CuckooBlock};

use crate::config::{DirOptions, FilterKind};

/// The filter builder selected by directory options. One policy is
/// constructed per compaction.
pub enum FilterPolicy {
    Disabled,
    Bloom(BloomBlock),
    Cuckoo(CuckooBlock),
}

impl FilterPolicy {
    pub fn new(options: &DirOptions) -> Self {
        match options.filter {
            FilterKind::NoFilter => FilterPolicy::Disabled,
            FilterKind::Bloom => FilterPolicy::Bloom(BloomBlock::new(options)),
            FilterKind::Cuckoo => FilterPolicy::Cuckoo(CuckooBlock::new(options, 0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, FilterPolicy::Disabled)
    }

    /// Sizes the structure for the expected number of keys.
    pub fn reset(&mut self, num_keys: u32) {
        match self {
            FilterPolicy::Disabled => {}
            FilterPolicy::Bloom(bloom) => bloom.reset(num_keys),
            FilterPolicy::Cuckoo(cuckoo) => cuckoo.reset(num_keys),
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        match self {
            FilterPolicy::Disabled => {}
            FilterPolicy::Bloom(bloom) => bloom.add_key(key),
            FilterPolicy::Cuckoo(cuckoo) => cuckoo.add_key(key),
        }
    }

    /// Emits the finished stripe; empty when filtering is disabled.
    pub fn finish(&mut self) -> Vec<u8> {
        match self {
            FilterPolicy::Disabled => Vec::new(),
            FilterPolicy::Bloom(bloom) => bloom.finish(),
            FilterPolicy::Cuckoo(cuckoo) => cuckoo.finish(),
        }
    }
}

/// Tests a key against one filter stripe. An empty stripe cannot rule
/// the key out and always matches.
pub fn stripe_may_match(options: &DirOptions, key: &[u8], stripe: &[u8]) -> bool {
    if stripe.is_empty() {
        return true;
    }
    match options.filter {
        FilterKind::NoFilter => true,
        FilterKind::Bloom => bloom_key_may_match(key, stripe),
        FilterKind::Cuckoo => cuckoo_key_may_match(key, stripe),
    }
}
