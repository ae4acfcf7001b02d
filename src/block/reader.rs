use std::cmp::Ordering;

use super::{BlockFormat, RESTART_INTERVAL, TRAILER_SIZE};
use crate::config::Compression;
use crate::encoding::{decode_fixed32, unmask_crc, CRC32C};
use crate::error::Result;

/// Checks the block trailer: the masked crc32c must cover the payload
/// and the compression byte.
pub fn verify_trailer(data: &[u8]) -> Result<()> {
    if data.len() < TRAILER_SIZE {
        return crate::errcorrupt!("block too short for a trailer: {} bytes", data.len());
    }
    let crc_pos = data.len() - 4;
    let expected = unmask_crc(decode_fixed32(&data[crc_pos..]));
    let actual = CRC32C.checksum(&data[..crc_pos]);
    if actual != expected {
        return crate::errcorrupt!("block checksum mismatch");
    }
    Ok(())
}

/// A parsed, immutable view over one block's bytes.
pub struct Block<'a> {
    /// Entry region. May end in zero padding; iteration is bounded by
    /// `num_entries`, not by the region length.
    entries: &'a [u8],
    restarts: Vec<u32>,
    num_entries: u32,
    format: BlockFormat,
}

impl<'a> Block<'a> {
    /// Parses the structural frame of a block. The checksum is not
    /// verified here; see [`verify_trailer`].
    pub fn new(data: &'a [u8], format: BlockFormat) -> Result<Self> {
        if data.len() < TRAILER_SIZE {
            return crate::errcorrupt!("block too short: {} bytes", data.len());
        }
        Compression::from_byte(data[data.len() - TRAILER_SIZE])?;
        let content = &data[..data.len() - TRAILER_SIZE];

        match format {
            BlockFormat::Sorted => {
                if content.len() < 8 {
                    return crate::errcorrupt!("sorted block too short for its counts");
                }
                let num_entries = decode_fixed32(&content[content.len() - 4..]);
                let num_restarts = decode_fixed32(&content[content.len() - 8..content.len() - 4]);
                let array_len = num_restarts as usize * 4;
                if content.len() < 8 + array_len {
                    return crate::errcorrupt!("sorted block too short for its restart array");
                }
                let restart_base = content.len() - 8 - array_len;
                let restarts = content[restart_base..content.len() - 8]
                    .chunks_exact(4)
                    .map(decode_fixed32)
                    .collect::<Vec<_>>();
                if restarts.iter().any(|&off| off as usize > restart_base) {
                    return crate::errcorrupt!("restart offset out of bounds");
                }
                Ok(Self {
                    entries: &content[..restart_base],
                    restarts,
                    num_entries,
                    format,
                })
            }
            BlockFormat::Unordered => {
                if content.len() < 4 {
                    return crate::errcorrupt!("unordered block too short for its count");
                }
                Ok(Self {
                    entries: &content[4..],
                    restarts: Vec::new(),
                    num_entries: decode_fixed32(&content[..4]),
                    format,
                })
            }
        }
    }

    pub fn num_entries(&self) -> u32 {
        self.num_entries
    }

    pub fn iter(&self) -> BlockIter<'a, '_> {
        BlockIter {
            block: self,
            offset: 0,
            index: 0,
            last_key: Vec::new(),
            pending: None,
        }
    }

    /// Finds the value for `key`.
    ///
    /// Sorted blocks are searched through the restart array; unordered
    /// blocks are scanned linearly and the first exact match wins.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.format {
            BlockFormat::Sorted => {
                let mut iter = self.iter();
                iter.seek(key)?;
                match iter.next() {
                    Some(Ok((found, value))) if found == key => Ok(Some(value)),
                    Some(Err(e)) => Err(e),
                    _ => Ok(None),
                }
            }
            BlockFormat::Unordered => {
                for entry in self.iter() {
                    let (found, value) = entry?;
                    if found == key {
                        return Ok(Some(value));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Reads the full key stored at a restart point.
    fn key_at_restart(&self, restart: usize) -> Result<Vec<u8>> {
        let offset = self.restarts[restart] as usize;
        let (shared, unshared, _, key_pos) = self.parse_sorted_header(offset)?;
        if shared != 0 {
            return crate::errcorrupt!("restart entry has a shared prefix");
        }
        Ok(self.entries[key_pos..key_pos + unshared].to_vec())
    }

    fn parse_sorted_header(&self, offset: usize) -> Result<(usize, usize, usize, usize)> {
        let data = self.entries;
        if offset + 8 > data.len() {
            return crate::errcorrupt!("block entry header out of bounds");
        }
        let shared = u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap()) as usize;
        let unshared = u16::from_le_bytes(data[offset + 2..offset + 4].try_into().unwrap()) as usize;
        let value_len =
            u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap()) as usize;
        let key_pos = offset + 8;
        if key_pos + unshared + value_len > data.len() {
            return crate::errcorrupt!("block entry out of bounds");
        }
        Ok((shared, unshared, value_len, key_pos))
    }
}

/// Iterates a block's records in storage order, yielding owned pairs.
pub struct BlockIter<'a, 'b> {
    block: &'b Block<'a>,
    offset: usize,
    index: u32,
    last_key: Vec<u8>,
    /// An entry read ahead by `seek` and handed back on the next call.
    pending: Option<(Vec<u8>, Vec<u8>)>,
}

impl<'a, 'b> BlockIter<'a, 'b> {
    /// Positions the iterator so the next entry is the first one with a
    /// key `>= target`. Sorted blocks only.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        debug_assert_eq!(self.block.format, BlockFormat::Sorted);
        self.pending = None;

        // Binary search for the last restart point with a key <= target.
        let mut left = 0;
        let mut right = self.block.restarts.len();
        while left < right {
            let mid = left + (right - left) / 2;
            match self.block.key_at_restart(mid)?.as_slice().cmp(target) {
                Ordering::Less => left = mid + 1,
                _ => right = mid,
            }
        }
        let restart = left.saturating_sub(1);

        self.offset = self.block.restarts.get(restart).copied().unwrap_or(0) as usize;
        self.index = (restart * RESTART_INTERVAL) as u32;
        self.last_key.clear();

        while let Some(entry) = self.next() {
            let (key, value) = entry?;
            if key.as_slice() >= target {
                self.pending = Some((key, value));
                break;
            }
        }
        Ok(())
    }

    fn next_sorted(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let (shared, unshared, value_len, key_pos) = self.block.parse_sorted_header(self.offset)?;
        if shared > self.last_key.len() {
            return crate::errcorrupt!("shared prefix longer than previous key");
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&self.last_key[..shared]);
        key.extend_from_slice(&self.block.entries[key_pos..key_pos + unshared]);
        let value_pos = key_pos + unshared;
        let value = self.block.entries[value_pos..value_pos + value_len].to_vec();

        self.offset = value_pos + value_len;
        self.last_key = key.clone();
        Ok((key, value))
    }

    fn next_unordered(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let data = self.block.entries;
        let mut pos = self.offset;
        if pos + 4 > data.len() {
            return crate::errcorrupt!("block entry header out of bounds");
        }
        let key_len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + key_len + 4 > data.len() {
            return crate::errcorrupt!("block entry out of bounds");
        }
        let key = data[pos..pos + key_len].to_vec();
        pos += key_len;
        let value_len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + value_len > data.len() {
            return crate::errcorrupt!("block entry out of bounds");
        }
        let value = data[pos..pos + value_len].to_vec();
        pos += value_len;

        self.offset = pos;
        Ok((key, value))
    }
}

impl Iterator for BlockIter<'_, '_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.pending.take() {
            return Some(Ok(entry));
        }
        if self.index >= self.block.num_entries {
            return None;
        }
        let result = match self.block.format {
            BlockFormat::Sorted => self.next_sorted(),
            BlockFormat::Unordered => self.next_unordered(),
        };
        self.index += 1;
        Some(result)
    }
}
