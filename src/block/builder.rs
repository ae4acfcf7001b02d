use byteorder::{LittleEndian, WriteBytesExt};

use super::{RESTART_INTERVAL, TRAILER_SIZE};
use crate::config::{Compression, DirOptions};
use crate::encoding::{mask_crc, put_fixed32, CRC32C};
use crate::error::Result;
use crate::Error;

/// Payload layout of a block, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFormat {
    /// Prefix-compressed entries with a restart array. Keys must be
    /// added in strictly increasing order.
    Sorted,
    /// Length-prefixed entries in insertion order. Duplicate and empty
    /// keys admitted.
    Unordered,
}

/// Serializes a batch of key/value records into one block.
pub struct BlockBuilder {
    format: BlockFormat,
    block_size: usize,
    padding: bool,
    buf: Vec<u8>,
    restarts: Vec<u32>,
    num_entries: u32,
    last_key: Vec<u8>,
    finished: bool,
}

impl BlockBuilder {
    pub fn new(format: BlockFormat, options: &DirOptions) -> Self {
        let mut builder = Self {
            format,
            block_size: options.block_size,
            padding: options.block_padding,
            buf: Vec::new(),
            restarts: Vec::new(),
            num_entries: 0,
            last_key: Vec::new(),
            finished: false,
        };
        builder.start_payload();
        builder
    }

    fn start_payload(&mut self) {
        if self.format == BlockFormat::Unordered {
            // Entry count placeholder, patched by finish().
            self.buf.extend_from_slice(&[0u8; 4]);
        }
    }

    /// Pre-allocates buffer space.
    pub fn reserve(&mut self, bytes: usize) {
        self.buf.reserve(bytes);
    }

    /// Appends one record.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.finished {
            return Err(Error::Disconnected("block already finished".to_string()));
        }
        if value.len() > u32::MAX as usize {
            return crate::errinput!("value too large: {} bytes", value.len());
        }
        match self.format {
            BlockFormat::Sorted => self.add_sorted(key, value),
            BlockFormat::Unordered => self.add_unordered(key, value),
        }
    }

    fn add_sorted(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > u16::MAX as usize {
            return crate::errinput!("key too large: {} bytes", key.len());
        }
        if self.num_entries > 0 && key <= self.last_key.as_slice() {
            return crate::errcorrupt!("keys added out of order");
        }

        let shared = if self.num_entries as usize % RESTART_INTERVAL == 0 {
            self.restarts.push(self.buf.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };
        let unshared = key.len() - shared;

        self.buf
            .write_u16::<LittleEndian>(shared as u16)
            .expect("write to vec");
        self.buf
            .write_u16::<LittleEndian>(unshared as u16)
            .expect("write to vec");
        self.buf
            .write_u32::<LittleEndian>(value.len() as u32)
            .expect("write to vec");
        self.buf.extend_from_slice(&key[shared..]);
        self.buf.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        Ok(())
    }

    fn add_unordered(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > u32::MAX as usize {
            return crate::errinput!("key too large: {} bytes", key.len());
        }
        self.buf
            .write_u32::<LittleEndian>(key.len() as u32)
            .expect("write to vec");
        self.buf.extend_from_slice(key);
        self.buf
            .write_u32::<LittleEndian>(value.len() as u32)
            .expect("write to vec");
        self.buf.extend_from_slice(value);
        self.num_entries += 1;
        Ok(())
    }

    /// Finalizes the block: zero padding, end-fixed arrays, compression
    /// byte, and the masked crc32c trailer. Subsequent `add`s fail until
    /// `reset`.
    pub fn finish(&mut self, compression: Compression) -> Result<&[u8]> {
        if self.finished {
            return Err(Error::Disconnected("block already finished".to_string()));
        }

        let end_fixed = match self.format {
            BlockFormat::Sorted => self.restarts.len() * 4 + 8,
            BlockFormat::Unordered => 0,
        };
        if self.padding && self.block_size > 0 {
            let total = self.buf.len() + end_fixed + TRAILER_SIZE;
            let pad = (self.block_size - total % self.block_size) % self.block_size;
            self.buf.resize(self.buf.len() + pad, 0);
        }

        match self.format {
            BlockFormat::Sorted => {
                for offset in &self.restarts {
                    self.buf
                        .write_u32::<LittleEndian>(*offset)
                        .expect("write to vec");
                }
                self.buf
                    .write_u32::<LittleEndian>(self.restarts.len() as u32)
                    .expect("write to vec");
                self.buf
                    .write_u32::<LittleEndian>(self.num_entries)
                    .expect("write to vec");
            }
            BlockFormat::Unordered => {
                self.buf[..4].copy_from_slice(&self.num_entries.to_le_bytes());
            }
        }

        self.buf.push(compression.to_byte());
        let crc = CRC32C.checksum(&self.buf);
        put_fixed32(&mut self.buf, mask_crc(crc));

        self.finished = true;
        Ok(&self.buf)
    }

    /// The finished block bytes.
    ///
    /// Only meaningful after `finish`.
    pub fn finished_data(&self) -> &[u8] {
        debug_assert!(self.finished);
        &self.buf
    }

    /// Returns the builder to an empty state for reuse.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.restarts.clear();
        self.num_entries = 0;
        self.last_key.clear();
        self.finished = false;
        self.start_payload();
    }

    pub fn num_entries(&self) -> u32 {
        self.num_entries
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// Size the finished block would have before padding. Used for
    /// buffer rotation decisions.
    pub fn estimated_size(&self) -> usize {
        let end_fixed = match self.format {
            BlockFormat::Sorted => self.restarts.len() * 4 + 8,
            BlockFormat::Unordered => 0,
        };
        self.buf.len() + end_fixed + TRAILER_SIZE
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::reader::{verify_trailer, Block};

    fn options_unpadded() -> DirOptions {
        DirOptions::default().block_padding(false)
    }

    #[test]
    fn test_sorted_rejects_out_of_order_keys() {
        let options = options_unpadded();
        let mut builder = BlockBuilder::new(BlockFormat::Sorted, &options);
        builder.add(b"banana", b"1").expect("Failed to add");
        assert!(matches!(
            builder.add(b"apple", b"2"),
            Err(Error::Corruption(_))
        ));
        assert!(matches!(
            builder.add(b"banana", b"2"),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_unordered_accepts_any_order_and_duplicates() {
        let options = options_unpadded();
        let mut builder = BlockBuilder::new(BlockFormat::Unordered, &options);
        builder.add(b"zebra", b"1").expect("Failed to add");
        builder.add(b"apple", b"2").expect("Failed to add");
        builder.add(b"", b"empty key").expect("Failed to add");
        builder.add(b"apple", b"3").expect("Failed to add");
        assert_eq!(builder.num_entries(), 4);
    }

    #[test]
    fn test_add_after_finish_fails_until_reset() {
        let options = options_unpadded();
        let mut builder = BlockBuilder::new(BlockFormat::Unordered, &options);
        builder.add(b"k", b"v").expect("Failed to add");
        builder.finish(Compression::None).expect("Failed to finish");
        assert!(matches!(
            builder.add(b"k2", b"v2"),
            Err(Error::Disconnected(_))
        ));

        builder.reset();
        assert!(builder.is_empty());
        builder.add(b"k2", b"v2").expect("Failed to add after reset");
    }

    #[test]
    fn test_trailer_crc_detects_any_flipped_byte() {
        let options = options_unpadded();
        let mut builder = BlockBuilder::new(BlockFormat::Unordered, &options);
        builder.add(b"key", b"value").expect("Failed to add");
        let block = builder
            .finish(Compression::None)
            .expect("Failed to finish")
            .to_vec();

        verify_trailer(&block).expect("Fresh block should verify");
        for i in 0..block.len() {
            let mut corrupted = block.clone();
            corrupted[i] ^= 0x01;
            assert!(
                verify_trailer(&corrupted).is_err(),
                "flipping byte {i} went undetected"
            );
        }
    }

    #[test]
    fn test_padding_rounds_to_block_size() {
        let options = DirOptions::default().block_size(512).block_padding(true);
        for format in [BlockFormat::Sorted, BlockFormat::Unordered] {
            let mut builder = BlockBuilder::new(format, &options);
            builder.add(b"aaa", b"1").expect("Failed to add");
            builder.add(b"bbb", b"2").expect("Failed to add");
            let data = builder
                .finish(Compression::None)
                .expect("Failed to finish")
                .to_vec();
            assert_eq!(data.len() % 512, 0, "{format:?} block not padded");
            verify_trailer(&data).expect("Padded block should verify");

            // Padding must not disturb the records.
            let block = Block::new(&data, format).expect("Failed to parse padded block");
            let entries: Vec<_> = block
                .iter()
                .collect::<Result<Vec<_>>>()
                .expect("Failed to iterate padded block");
            assert_eq!(
                entries,
                vec![
                    (b"aaa".to_vec(), b"1".to_vec()),
                    (b"bbb".to_vec(), b"2".to_vec())
                ]
            );
        }
    }

    #[test]
    fn test_estimated_size_tracks_finished_size() {
        let options = options_unpadded();
        let mut builder = BlockBuilder::new(BlockFormat::Sorted, &options);
        for i in 0..100u32 {
            let key = format!("key_{i:04}");
            builder.add(key.as_bytes(), b"value").expect("Failed to add");
        }
        let estimate = builder.estimated_size();
        let actual = builder
            .finish(Compression::None)
            .expect("Failed to finish")
            .len();
        assert_eq!(estimate, actual);
    }
}
