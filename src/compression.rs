//! Block codecs shared by the compressed log stream and disk segments.
//!
//! Every codec is used in one-shot mode: a whole block goes in, a whole block
//! comes out. Callers store the decompressed length next to the payload, so
//! `decompress` always knows the exact output size.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionMethod {
    None,
    Lz4,
    Zstd,
    Brotli,
    Gzip,
}

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_WINDOW: u32 = 22;

impl CompressionMethod {
    pub fn name(self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Lz4 => "lz4",
            CompressionMethod::Zstd => "zstd",
            CompressionMethod::Brotli => "brotli",
            CompressionMethod::Gzip => "gzip",
        }
    }

    /// On-disk tag stored in stream headers and segment footers.
    pub fn to_u8(self) -> u8 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Lz4 => 1,
            CompressionMethod::Zstd => 2,
            CompressionMethod::Brotli => 3,
            CompressionMethod::Gzip => 4,
        }
    }

    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CompressionMethod::None),
            1 => Ok(CompressionMethod::Lz4),
            2 => Ok(CompressionMethod::Zstd),
            3 => Ok(CompressionMethod::Brotli),
            4 => Ok(CompressionMethod::Gzip),
            other => Err(Error::InvalidHeader(format!("unknown codec tag {}", other))),
        }
    }

    /// Compresses one block. `level` is codec specific; values at or below
    /// zero select the codec's default.
    pub fn compress(self, data: &[u8], level: i32) -> Result<Vec<u8>> {
        match self {
            CompressionMethod::None => Ok(data.to_vec()),
            CompressionMethod::Lz4 => Ok(lz4_flex::block::compress(data)),
            CompressionMethod::Zstd => {
                zstd::bulk::compress(data, level).map_err(|e| self.failure(e))
            }
            CompressionMethod::Gzip => {
                let level = if level <= 0 {
                    flate2::Compression::default()
                } else {
                    flate2::Compression::new(level.min(9) as u32)
                };
                let mut encoder = flate2::write::GzEncoder::new(Vec::new(), level);
                encoder.write_all(data).map_err(|e| self.failure(e))?;
                encoder.finish().map_err(|e| self.failure(e))
            }
            CompressionMethod::Brotli => {
                let quality = if level <= 0 { 5 } else { level.min(11) as u32 };
                let mut out = Vec::new();
                {
                    let mut writer = brotli::CompressorWriter::new(
                        &mut out,
                        BROTLI_BUFFER_SIZE,
                        quality,
                        BROTLI_WINDOW,
                    );
                    writer.write_all(data).map_err(|e| self.failure(e))?;
                    writer.flush().map_err(|e| self.failure(e))?;
                }
                Ok(out)
            }
        }
    }

    /// Restores a block compressed with [`compress`](Self::compress).
    pub fn decompress(self, data: &[u8], decompressed_len: usize) -> Result<Vec<u8>> {
        let out = match self {
            CompressionMethod::None => data.to_vec(),
            CompressionMethod::Lz4 => lz4_flex::block::decompress(data, decompressed_len)
                .map_err(|e| self.failure(e))?,
            CompressionMethod::Zstd => {
                zstd::bulk::decompress(data, decompressed_len).map_err(|e| self.failure(e))?
            }
            CompressionMethod::Gzip => {
                let mut out = Vec::with_capacity(decompressed_len);
                flate2::read::GzDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| self.failure(e))?;
                out
            }
            CompressionMethod::Brotli => {
                let mut out = Vec::with_capacity(decompressed_len);
                brotli::Decompressor::new(data, BROTLI_BUFFER_SIZE)
                    .read_to_end(&mut out)
                    .map_err(|e| self.failure(e))?;
                out
            }
        };
        if out.len() != decompressed_len {
            return Err(Error::Compression {
                method: self.name(),
                reason: format!(
                    "expected {} decompressed bytes, got {}",
                    decompressed_len,
                    out.len()
                ),
            });
        }
        Ok(out)
    }

    fn failure(self, err: impl std::fmt::Display) -> Error {
        Error::Compression {
            method: self.name(),
            reason: err.to_string(),
        }
    }
}
