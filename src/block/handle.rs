//! Block handles and the log footer.

use crate::encoding::{get_varint64, put_varint64};
use crate::error::Result;

/// Max bytes of one encoded handle: two varint64 values.
pub const MAX_HANDLE_ENCODED_LENGTH: usize = 20;

/// Fixed size of the footer: two zero-padded handles, filter stream
/// first, then index stream.
pub const FOOTER_SIZE: usize = 2 * MAX_HANDLE_ENCODED_LENGTH;

/// Locates one byte range inside the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    pub fn decode_from(input: &mut &[u8]) -> Result<Self> {
        let offset = get_varint64(input)?;
        let size = get_varint64(input)?;
        Ok(Self { offset, size })
    }
}

/// The fixed-size suffix that makes a log self-describing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub filter: BlockHandle,
    pub index: BlockHandle,
}

impl Footer {
    /// Encodes to exactly [`FOOTER_SIZE`] bytes; unused bytes are zero.
    pub fn encode(&self) -> Vec<u8> {
        let mut dst = Vec::with_capacity(FOOTER_SIZE);
        self.filter.encode_to(&mut dst);
        self.index.encode_to(&mut dst);
        dst.resize(FOOTER_SIZE, 0);
        dst
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FOOTER_SIZE {
            return crate::errcorrupt!(
                "footer too short: {} < {FOOTER_SIZE} bytes",
                data.len()
            );
        }
        let mut input = &data[..FOOTER_SIZE];
        let filter = BlockHandle::decode_from(&mut input)?;
        let index = BlockHandle::decode_from(&mut input)?;
        Ok(Self { filter, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_roundtrip() {
        let handle = BlockHandle::new(1 << 40, 12_345);
        let mut buf = Vec::new();
        handle.encode_to(&mut buf);
        assert!(buf.len() <= MAX_HANDLE_ENCODED_LENGTH);
        let mut input = buf.as_slice();
        assert_eq!(
            BlockHandle::decode_from(&mut input).expect("Failed to decode handle"),
            handle
        );
        assert!(input.is_empty());
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer {
            filter: BlockHandle::new(4096, 512),
            index: BlockHandle::new(4608, 160),
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);
        assert_eq!(Footer::decode(&encoded).expect("Failed to decode footer"), footer);
    }

    #[test]
    fn test_footer_rejects_truncation() {
        let footer = Footer {
            filter: BlockHandle::new(0, 0),
            index: BlockHandle::new(0, 0),
        };
        let encoded = footer.encode();
        assert!(Footer::decode(&encoded[..FOOTER_SIZE - 1]).is_err());
    }
}
