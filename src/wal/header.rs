//! Fixed-size headers of the compressed log stream.
//!
//! ```text
//! primary file:  StreamHeader | frame 0 | frame 1 | ...
//! tail file:     generation:u64 | frame n
//! frame:         FrameHeader | compressed payload
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::compression::CompressionMethod;
use crate::error::{Error, Result};

pub const STREAM_HEADER_SIZE: usize = 16;
pub const FRAME_HEADER_SIZE: usize = 16;
pub const TAIL_PREFIX_SIZE: usize = 8;

const MAGIC: &[u8; 4] = b"EMBW";
const VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u16,
    pub codec: CompressionMethod,
    /// Changes on every replacement; a tail file from another generation is stale.
    pub generation: u64,
}

impl StreamHeader {
    pub fn new(codec: CompressionMethod, generation: u64) -> Self {
        Self {
            version: VERSION,
            codec,
            generation,
        }
    }

    pub fn encode(&self) -> [u8; STREAM_HEADER_SIZE] {
        let mut buf = [0u8; STREAM_HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        LittleEndian::write_u16(&mut buf[4..6], self.version);
        buf[6] = self.codec.to_u8();
        LittleEndian::write_u64(&mut buf[8..16], self.generation);
        buf
    }

    pub fn decode(buf: &[u8; STREAM_HEADER_SIZE]) -> Result<Self> {
        if &buf[0..4] != MAGIC {
            return Err(Error::InvalidHeader("bad stream magic".into()));
        }
        let version = LittleEndian::read_u16(&buf[4..6]);
        if version != VERSION {
            return Err(Error::InvalidHeader(format!(
                "unsupported stream version {}",
                version
            )));
        }
        Ok(Self {
            version,
            codec: CompressionMethod::from_u8(buf[6])?,
            generation: LittleEndian::read_u64(&buf[8..16]),
        })
    }
}

impl TryFrom<&[u8]> for StreamHeader {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let buf: &[u8; STREAM_HEADER_SIZE] = bytes
            .get(..STREAM_HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::InvalidHeader("stream header too short".into()))?;
        StreamHeader::decode(buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub block_index: u32,
    pub decompressed_len: u32,
    pub compressed_len: u32,
    /// CRC32C of the compressed payload.
    pub checksum: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.block_index);
        LittleEndian::write_u32(&mut buf[4..8], self.decompressed_len);
        LittleEndian::write_u32(&mut buf[8..12], self.compressed_len);
        LittleEndian::write_u32(&mut buf[12..16], self.checksum);
        buf
    }

    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        Self {
            block_index: LittleEndian::read_u32(&buf[0..4]),
            decompressed_len: LittleEndian::read_u32(&buf[4..8]),
            compressed_len: LittleEndian::read_u32(&buf[8..12]),
            checksum: LittleEndian::read_u32(&buf[12..16]),
        }
    }

    pub fn frame_len(&self) -> u64 {
        FRAME_HEADER_SIZE as u64 + self.compressed_len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_header_encoding_decoding() {
        let header = StreamHeader::new(CompressionMethod::Zstd, 42);
        let encoded = header.encode();
        assert_eq!(encoded.len(), STREAM_HEADER_SIZE);

        let decoded = StreamHeader::decode(&encoded).expect("Failed to decode header");
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_stream_header_magic_validation() {
        let mut encoded = StreamHeader::new(CompressionMethod::Lz4, 1).encode();
        encoded[0..4].copy_from_slice(b"NOPE");
        assert!(matches!(
            StreamHeader::decode(&encoded),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_stream_header_version_validation() {
        let mut encoded = StreamHeader::new(CompressionMethod::Lz4, 1).encode();
        LittleEndian::write_u16(&mut encoded[4..6], 999);
        assert!(StreamHeader::decode(&encoded).is_err());
    }

    #[test]
    fn test_stream_header_too_short() {
        let short = [0u8; STREAM_HEADER_SIZE - 2];
        assert!(matches!(
            StreamHeader::try_from(&short[..]),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_frame_header() {
        let frame = FrameHeader {
            block_index: 3,
            decompressed_len: 4096,
            compressed_len: 1000,
            checksum: 0xdead_beef,
        };
        assert_eq!(FrameHeader::decode(&frame.encode()), frame);
        assert_eq!(frame.frame_len(), 1016);
    }
}
