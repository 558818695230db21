//! Layout of a decompressed disk-segment block.
//!
//! ```text
//! +-----------------------------------------------+
//! | key_len u32 | key | value_len u32 | value      |  entry 0
//! | ...                                           |
//! +-----------------------------------------------+
//! | entry offset u32 (one per entry)              |
//! | entry count u32                               |
//! +-----------------------------------------------+
//! ```
//!
//! All integers are little-endian. Offsets give random access to the n-th
//! entry so a lookup can binary-search inside a block.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

pub struct BlockBuilder {
    buffer: Vec<u8>,
    offsets: Vec<u32>,
}

impl BlockBuilder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            offsets: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, key: &[u8], value: &[u8]) {
        self.offsets.push(self.buffer.len() as u32);
        put_u32(&mut self.buffer, key.len() as u32);
        self.buffer.extend_from_slice(key);
        put_u32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(value);
    }

    /// Size the block would have if finished now.
    pub fn len(&self) -> usize {
        self.buffer.len() + 4 * self.offsets.len() + 4
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn finish(mut self) -> Vec<u8> {
        for offset in &self.offsets {
            put_u32(&mut self.buffer, *offset);
        }
        put_u32(&mut self.buffer, self.offsets.len() as u32);
        self.buffer
    }
}

/// Borrowed view over a finished block.
pub struct BlockView<'a> {
    data: &'a [u8],
    offsets: &'a [u8],
    count: usize,
    block_index: u32,
}

impl<'a> BlockView<'a> {
    pub fn new(data: &'a [u8], block_index: u32) -> Result<Self> {
        let corrupted = |reason: &str| Error::CorruptedBlock {
            block_index,
            reason: reason.to_string(),
        };

        if data.len() < 4 {
            return Err(corrupted("block shorter than its entry count"));
        }
        let count_at = data.len() - 4;
        let count = LittleEndian::read_u32(&data[count_at..]) as usize;
        let offsets_at = count
            .checked_mul(4)
            .and_then(|size| count_at.checked_sub(size))
            .ok_or_else(|| corrupted("entry count exceeds block size"))?;

        Ok(Self {
            data: &data[..offsets_at],
            offsets: &data[offsets_at..count_at],
            count,
            block_index,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn entry(&self, i: usize) -> Result<(&'a [u8], &'a [u8])> {
        let corrupted = || Error::CorruptedBlock {
            block_index: self.block_index,
            reason: format!("entry {} out of bounds", i),
        };
        if i >= self.count {
            return Err(corrupted());
        }
        let start = LittleEndian::read_u32(&self.offsets[4 * i..]) as usize;
        let (key, rest) = length_prefixed(self.data, start).ok_or_else(corrupted)?;
        let (value, _) = length_prefixed(self.data, rest).ok_or_else(corrupted)?;
        Ok((key, value))
    }

    pub fn key(&self, i: usize) -> Result<&'a [u8]> {
        self.entry(i).map(|(key, _)| key)
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    let mut bytes = [0u8; 4];
    LittleEndian::write_u32(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

/// Reads `len u32 | bytes` at `at`, returning the bytes and the next offset.
fn length_prefixed(data: &[u8], at: usize) -> Option<(&[u8], usize)> {
    let len_end = at.checked_add(4)?;
    let len = LittleEndian::read_u32(data.get(at..len_end)?) as usize;
    let end = len_end.checked_add(len)?;
    Some((data.get(len_end..end)?, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_read() {
        let mut builder = BlockBuilder::new();
        assert!(builder.is_empty());
        builder.add_entry(b"apple", b"red");
        builder.add_entry(b"banana", b"");
        builder.add_entry(b"cherry", b"dark red");
        assert_eq!(builder.entry_count(), 3);

        let expected_len = builder.len();
        let data = builder.finish();
        assert_eq!(data.len(), expected_len);

        let view = BlockView::new(&data, 0).unwrap();
        assert_eq!(view.len(), 3);
        assert_eq!(view.entry(0).unwrap(), (&b"apple"[..], &b"red"[..]));
        assert_eq!(view.entry(1).unwrap(), (&b"banana"[..], &b""[..]));
        assert_eq!(view.key(2).unwrap(), b"cherry");
        assert!(view.entry(3).is_err());
    }

    #[test]
    fn test_empty_block() {
        let data = BlockBuilder::new().finish();
        let view = BlockView::new(&data, 0).unwrap();
        assert!(view.is_empty());
    }

    #[test]
    fn test_corrupted_blocks_are_rejected() {
        assert!(BlockView::new(&[1, 2], 4).is_err());

        // Claims 100 entries in an 8-byte block.
        let mut data = vec![0u8; 4];
        data.extend_from_slice(&100u32.to_le_bytes());
        assert!(matches!(
            BlockView::new(&data, 4),
            Err(Error::CorruptedBlock { block_index: 4, .. })
        ));

        // Offset points past the data.
        let mut builder = BlockBuilder::new();
        builder.add_entry(b"k", b"v");
        let mut data = builder.finish();
        let at = data.len() - 8;
        data[at..at + 4].copy_from_slice(&500u32.to_le_bytes());
        let view = BlockView::new(&data, 1).unwrap();
        assert!(view.entry(0).is_err());
    }
}
