//! Self-describing data blocks.
//!
//! A block packs a batch of key/value records and ends with a fixed
//! trailer. Two payload formats exist, chosen at build time:
//!
//! ```text
//! Sorted (prefix-compressed, restart-indexed; keys strictly increasing):
//! +---------+---------+----------------------+-------+-------+
//! | entries | padding | restart offsets: u32 | R:u32 | n:u32 |
//! +---------+---------+----------------------+-------+-------+
//! entry: [shared:u16][unshared:u16][value_len:u32][key suffix][value]
//!
//! Unordered (length-prefixed; duplicates and any order admitted):
//! +-------+---------+---------+
//! | n:u32 | entries | padding |
//! +-------+---------+---------+
//! entry: [key_len:u32][key][value_len:u32][value]
//! ```
//!
//! Every block is terminated by the same 5-byte trailer:
//!
//! ```text
//! [compression_type:u8][masked crc32c:u32]
//! ```
//!
//! The checksum covers the payload and the compression byte. When block
//! padding is enabled the payload is zero-extended so the finished block
//! is a multiple of the configured block size, with the trailer always
//! at the physical end. All integers are little-endian.

pub mod builder;
pub mod handle;
pub mod reader;

pub use builder::{BlockBuilder, BlockFormat};
pub use handle::{BlockHandle, Footer, FOOTER_SIZE};
pub use reader::{verify_trailer, Block, BlockIter};

/// A restart point is emitted every this many entries in sorted blocks.
pub const RESTART_INTERVAL: usize = 16;

/// Compression byte plus the masked crc32c.
pub const TRAILER_SIZE: usize = 5;
