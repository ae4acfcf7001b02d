use std::sync::Arc;

use crate::env::pool::ThreadPool;
use crate::error::Result;
use crate::Error;

/// Point-lookup filter attached to each data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Do not build filters. Every lookup scans every candidate block.
    NoFilter,
    /// Classic k-hash bloom filter.
    Bloom,
    /// 4-slot cuckoo filter with auxiliary-table spill.
    Cuckoo,
}

/// Per-block compression. The trailer reserves a byte for it; only the
/// identity encoding is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
}

impl Compression {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Compression::None => 0,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Compression::None),
            other => crate::errcorrupt!("unknown compression type {other:#x}"),
        }
    }
}

/// Configuration for a block-log directory.
#[derive(Debug, Clone)]
pub struct DirOptions {
    /// Total memory reserved for write buffering across all buffers
    /// (default: 4MB)
    pub total_memtable_budget: usize,

    /// Rotate a buffer when its size reaches this fraction of the
    /// per-buffer share of the budget (default: 0.97)
    pub memtable_util: f64,

    /// Number of write buffers, at least two: one active, the rest
    /// immutable or free (default: 2)
    pub memtable_parts: usize,

    /// Approximate user data packed per data block. Also the unit blocks
    /// are zero-padded to (default: 32KB)
    pub block_size: usize,

    /// Zero-pad data blocks to a multiple of `block_size` (default: true)
    pub block_padding: bool,

    /// Filter type applied to data blocks (default: Bloom)
    pub filter: FilterKind,

    /// Bloom filter bits per key (default: 8)
    pub bf_bits_per_key: usize,

    /// Cuckoo fingerprint bits per key (default: 12)
    pub cuckoo_bits_per_key: u8,

    /// Target cuckoo table occupation rate. Negative means allocate the
    /// exact number of buckets for the expected keys (default: 0.95)
    pub cuckoo_frac: f64,

    /// Max cuckoo displacement chain length before the insertion fails
    /// or spills to an auxiliary table (default: 500)
    pub cuckoo_max_moves: usize,

    /// Seed for the cuckoo eviction RNG (default: 301)
    pub cuckoo_seed: u32,

    /// Compression applied to data blocks (default: None)
    pub compression: Compression,

    /// Verify block trailer checksums during reads (default: false)
    pub verify_checksums: bool,

    /// Aggressively check stream placement invariants during reads so we
    /// stop early on errors (default: false)
    pub paranoid_checks: bool,

    /// Zero-pad the log object after the footer so the final object size
    /// is a multiple of `block_size` (default: false)
    pub tail_padding: bool,

    /// Thread pool used to run concurrent background compactions. When
    /// unset, compactions run on spawned threads if `allow_env_threads`
    /// permits it, or inline on the caller's thread otherwise
    /// (default: None)
    pub compaction_pool: Option<Arc<ThreadPool>>,

    /// Allow spawning background threads when no compaction pool is
    /// configured (default: false)
    pub allow_env_threads: bool,
}

impl Default for DirOptions {
    fn default() -> Self {
        Self {
            total_memtable_budget: 4 * 1024 * 1024,
            memtable_util: 0.97,
            memtable_parts: 2,
            block_size: 32 * 1024,
            block_padding: true,
            filter: FilterKind::Bloom,
            bf_bits_per_key: 8,
            cuckoo_bits_per_key: 12,
            cuckoo_frac: 0.95,
            cuckoo_max_moves: 500,
            cuckoo_seed: 301,
            compression: Compression::None,
            verify_checksums: false,
            paranoid_checks: false,
            tail_padding: false,
            compaction_pool: None,
            allow_env_threads: false,
        }
    }
}

impl DirOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total write-buffer budget
    pub fn total_memtable_budget(mut self, bytes: usize) -> Self {
        self.total_memtable_budget = bytes;
        self
    }

    /// Set the buffer rotation threshold fraction
    pub fn memtable_util(mut self, util: f64) -> Self {
        self.memtable_util = util;
        self
    }

    /// Set the number of write buffers
    pub fn memtable_parts(mut self, parts: usize) -> Self {
        self.memtable_parts = parts;
        self
    }

    /// Set the target data block size
    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Enable or disable data block zero padding
    pub fn block_padding(mut self, enabled: bool) -> Self {
        self.block_padding = enabled;
        self
    }

    /// Set the filter type
    pub fn filter(mut self, kind: FilterKind) -> Self {
        self.filter = kind;
        self
    }

    /// Set bloom filter bits per key
    pub fn bf_bits_per_key(mut self, bits: usize) -> Self {
        self.bf_bits_per_key = bits;
        self
    }

    /// Set the cuckoo target occupation rate
    pub fn cuckoo_frac(mut self, frac: f64) -> Self {
        self.cuckoo_frac = frac;
        self
    }

    /// Configure a shared compaction pool
    pub fn compaction_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.compaction_pool = Some(pool);
        self
    }

    /// Allow background threads without an explicit pool
    pub fn allow_env_threads(mut self, allowed: bool) -> Self {
        self.allow_env_threads = allowed;
        self
    }

    /// Parses a `key=value;key=value` configuration string on top of the
    /// defaults. Sizes accept `k`/`m`/`g` suffixes and bools accept
    /// `true/false/yes/no/1/0`. Unknown keys are ignored with a warning;
    /// unparsable values are rejected.
    pub fn from_option_string(conf: &str) -> Result<Self> {
        let mut options = Self::default();
        for clause in conf.split(&[';', ','][..]) {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            let (key, value) = clause
                .split_once('=')
                .ok_or_else(|| Error::InvalidArgument(format!("bad option clause: {clause:?}")))?;
            match key.trim() {
                "total_memtable_budget" | "memtable_budget" => {
                    options.total_memtable_budget = parse_pretty_size(value)?;
                }
                "memtable_util" => options.memtable_util = parse_float(value)?,
                "memtable_parts" => options.memtable_parts = parse_pretty_size(value)?,
                "block_size" => options.block_size = parse_pretty_size(value)?,
                "block_padding" => options.block_padding = parse_pretty_bool(value)?,
                "filter" => options.filter = parse_filter(value)?,
                "bf_bits_per_key" => options.bf_bits_per_key = parse_pretty_size(value)?,
                "cuckoo_bits_per_key" => {
                    options.cuckoo_bits_per_key = parse_pretty_size(value)? as u8;
                }
                "cuckoo_frac" => options.cuckoo_frac = parse_float(value)?,
                "cuckoo_max_moves" => options.cuckoo_max_moves = parse_pretty_size(value)?,
                "cuckoo_seed" => options.cuckoo_seed = parse_pretty_size(value)? as u32,
                "compression" => options.compression = parse_compression(value)?,
                "verify_checksums" => options.verify_checksums = parse_pretty_bool(value)?,
                "paranoid_checks" => options.paranoid_checks = parse_pretty_bool(value)?,
                "tail_padding" => options.tail_padding = parse_pretty_bool(value)?,
                "allow_env_threads" => options.allow_env_threads = parse_pretty_bool(value)?,
                unknown => {
                    tracing::warn!(key = unknown, "Ignoring unknown directory option");
                }
            }
        }
        Ok(options)
    }
}

fn parse_filter(value: &str) -> Result<FilterKind> {
    match value.trim().to_ascii_lowercase().as_str() {
        "none" | "nofilter" => Ok(FilterKind::NoFilter),
        "bloom" => Ok(FilterKind::Bloom),
        "cuckoo" => Ok(FilterKind::Cuckoo),
        "bitmap" => crate::errinput!("bitmap filters are not supported"),
        other => crate::errinput!("unknown filter type: {other:?}"),
    }
}

fn parse_compression(value: &str) -> Result<Compression> {
    match value.trim().to_ascii_lowercase().as_str() {
        "none" => Ok(Compression::None),
        other => crate::errinput!("unknown compression type: {other:?}"),
    }
}

fn parse_float(value: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| Error::InvalidArgument(format!("bad float: {value:?}")))
}

/// Parses a boolean in its common spellings.
fn parse_pretty_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Ok(true),
        "false" | "no" | "n" | "0" => Ok(false),
        other => crate::errinput!("bad bool: {other:?}"),
    }
}

/// Parses a non-negative integer with an optional `k`/`m`/`g` suffix.
fn parse_pretty_size(value: &str) -> Result<usize> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = match value.strip_suffix(&['k', 'm', 'g'][..]) {
        Some(digits) => {
            let multiplier = match value.as_bytes()[value.len() - 1] {
                b'k' => 1024usize,
                b'm' => 1024 * 1024,
                _ => 1024 * 1024 * 1024,
            };
            (digits, multiplier)
        }
        None => (value.as_str(), 1),
    };
    let number: usize = digits
        .trim()
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("bad size: {value:?}")))?;
    number
        .checked_mul(multiplier)
        .ok_or_else(|| Error::InvalidArgument(format!("size overflow: {value:?}")))
}
