//! Binary codec for a single log record.
//!
//! ```text
//! +--------------+------------+--------------+-------+-------+-----------+
//! |op_index: i64 |key_len: i32|value_len: i32| key   | value |crc32c: u32|
//! +--------------+------------+--------------+-------+-------+-----------+
//! ```
//!
//! All integers are little-endian. The checksum covers every byte before it.

use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};
use crate::hasher::Crc32Engine;

/// op_index + key_len + value_len
pub const RECORD_HEADER_SIZE: usize = 16;
pub const CHECKSUM_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub op_index: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LogRecord {
    pub fn encoded_len(&self) -> usize {
        encoded_len(&self.key, &self.value)
    }
}

pub fn encoded_len(key: &[u8], value: &[u8]) -> usize {
    RECORD_HEADER_SIZE + key.len() + value.len() + CHECKSUM_SIZE
}

/// Appends the encoded record to `buf`.
pub fn encode_into(
    buf: &mut Vec<u8>,
    engine: Crc32Engine,
    key: &[u8],
    value: &[u8],
    op_index: i64,
) -> Result<()> {
    let key_len = i32::try_from(key.len())
        .map_err(|_| Error::InvalidState(format!("key of {} bytes is too large", key.len())))?;
    let value_len = i32::try_from(value.len()).map_err(|_| {
        Error::InvalidState(format!("value of {} bytes is too large", value.len()))
    })?;

    let start = buf.len();
    buf.reserve(encoded_len(key, value));
    buf.write_i64::<LittleEndian>(op_index)?;
    buf.write_i32::<LittleEndian>(key_len)?;
    buf.write_i32::<LittleEndian>(value_len)?;
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);

    let checksum = engine.checksum(&buf[start..]);
    buf.write_u32::<LittleEndian>(checksum)?;
    Ok(())
}

pub fn encode(engine: Crc32Engine, key: &[u8], value: &[u8], op_index: i64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(&mut buf, engine, key, value, op_index)?;
    Ok(buf)
}

/// Decodes records from any byte source, tracking the logical offset of each
/// record so failures can be reported precisely.
///
/// A checksum mismatch leaves the framing intact and iteration may continue
/// past it. A negative length, an incomplete trailing record or an I/O error
/// ends the iteration.
pub struct RecordReader<R> {
    reader: R,
    engine: Crc32Engine,
    offset: u64,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R, engine: Crc32Engine) -> Self {
        Self {
            reader,
            engine,
            offset: 0,
            done: false,
        }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_record(&mut self) -> Result<Option<LogRecord>> {
        let record_offset = self.offset;

        let mut header = [0u8; RECORD_HEADER_SIZE];
        let n = read_full(&mut self.reader, &mut header)?;
        self.offset += n as u64;
        if n == 0 {
            return Ok(None);
        }
        if n < RECORD_HEADER_SIZE {
            return Err(self.incomplete(record_offset));
        }

        let op_index = LittleEndian::read_i64(&header[0..8]);
        let key_len = LittleEndian::read_i32(&header[8..12]);
        let value_len = LittleEndian::read_i32(&header[12..16]);
        if key_len < 0 || value_len < 0 {
            return Err(Error::CorruptedLog {
                offset: record_offset,
                reason: format!("negative length (key {}, value {})", key_len, value_len),
            });
        }

        let body_len = key_len as u64 + value_len as u64 + CHECKSUM_SIZE as u64;
        let mut body = Vec::new();
        let n = (&mut self.reader).take(body_len).read_to_end(&mut body)?;
        self.offset += n as u64;
        if (n as u64) < body_len {
            return Err(self.incomplete(record_offset));
        }

        let payload_len = body.len() - CHECKSUM_SIZE;
        let stored = LittleEndian::read_u32(&body[payload_len..]);
        let mut hasher = self.engine.hasher();
        hasher.write(&header);
        hasher.write(&body[..payload_len]);
        let computed = hasher.checksum();
        if stored != computed {
            return Err(Error::ChecksumMismatch {
                offset: record_offset,
                stored,
                computed,
            });
        }

        body.truncate(payload_len);
        let value = body.split_off(key_len as usize);
        Ok(Some(LogRecord {
            op_index,
            key: body,
            value,
        }))
    }

    fn incomplete(&mut self, record_offset: u64) -> Error {
        // Drain the rest so file_length reflects the whole source.
        if let Ok(rest) = io::copy(&mut self.reader, &mut io::sink()) {
            self.offset += rest;
        }
        Error::IncompleteTailRecord {
            record_offset,
            file_length: self.offset,
        }
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                if !e.is_checksum_mismatch() {
                    self.done = true;
                }
                Some(Err(e))
            }
        }
    }
}

/// Reads until `buf` is full or the source ends. Returns the bytes read.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Crc32Engine {
        Crc32Engine::detect().unwrap()
    }

    fn records(data: &[u8]) -> Vec<Result<LogRecord>> {
        RecordReader::new(data, engine()).collect()
    }

    #[test]
    fn test_encode_layout() {
        let buf = encode(engine(), b"ab", b"xyz", 7).unwrap();
        assert_eq!(buf.len(), encoded_len(b"ab", b"xyz"));
        assert_eq!(&buf[0..8], &7i64.to_le_bytes());
        assert_eq!(&buf[8..12], &2i32.to_le_bytes());
        assert_eq!(&buf[12..16], &3i32.to_le_bytes());
        assert_eq!(&buf[16..18], b"ab");
        assert_eq!(&buf[18..21], b"xyz");
        let crc = engine().checksum(&buf[..21]);
        assert_eq!(&buf[21..], &crc.to_le_bytes());
    }

    #[test]
    fn test_read_sequence() {
        let mut buf = Vec::new();
        encode_into(&mut buf, engine(), b"key1", b"value1", 0).unwrap();
        encode_into(&mut buf, engine(), b"key2", b"", 1).unwrap();

        let read: Vec<LogRecord> = records(&buf).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].key, b"key1");
        assert_eq!(read[0].value, b"value1");
        assert_eq!(read[1].op_index, 1);
        assert!(read[1].value.is_empty());
    }

    #[test]
    fn test_truncated_record_reports_offset() {
        let mut buf = Vec::new();
        encode_into(&mut buf, engine(), b"key1", b"value1", 0).unwrap();
        let second = buf.len() as u64;
        encode_into(&mut buf, engine(), b"key2", b"value2", 1).unwrap();

        for cut in [second as usize + 3, buf.len() - 1] {
            let result = records(&buf[..cut]);
            assert_eq!(result.len(), 2);
            assert!(result[0].is_ok());
            match &result[1] {
                Err(Error::IncompleteTailRecord {
                    record_offset,
                    file_length,
                }) => {
                    assert_eq!(*record_offset, second);
                    assert_eq!(*file_length, cut as u64);
                }
                other => panic!("expected incomplete tail, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_flipped_bit_fails_checksum_and_continues() {
        let mut buf = Vec::new();
        encode_into(&mut buf, engine(), b"key1", b"value1", 0).unwrap();
        encode_into(&mut buf, engine(), b"key2", b"value2", 1).unwrap();
        buf[RECORD_HEADER_SIZE + 5] ^= 0x04;

        let result = records(&buf);
        assert_eq!(result.len(), 2);
        match &result[0] {
            Err(Error::ChecksumMismatch { offset, .. }) => assert_eq!(*offset, 0),
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
        assert_eq!(result[1].as_ref().unwrap().key, b"key2");
    }

    #[test]
    fn test_negative_length_stops_reading() {
        let mut buf = Vec::new();
        encode_into(&mut buf, engine(), b"key1", b"value1", 0).unwrap();
        buf[8..12].copy_from_slice(&(-5i32).to_le_bytes());
        encode_into(&mut buf, engine(), b"key2", b"value2", 1).unwrap();

        let result = records(&buf);
        assert_eq!(result.len(), 1);
        assert!(matches!(result[0], Err(Error::CorruptedLog { offset: 0, .. })));
    }
}
