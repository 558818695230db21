//! Block-compressing byte stream backing the compressed log strategies.
//!
//! Bytes accumulate in an in-memory block. A full block is compressed and
//! appended to the primary file as one frame. The partially filled block is
//! persisted on demand to the companion `<path>.tail` file, so a crash loses at
//! most what was written since the last tail write. A tail is only honoured
//! when it belongs to the primary's generation and carries the next expected
//! block index; anything else is a leftover of an earlier state.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use super::header::{
    FrameHeader, StreamHeader, FRAME_HEADER_SIZE, STREAM_HEADER_SIZE, TAIL_PREFIX_SIZE,
};
use super::record::read_full;
use super::{sibling, TAIL_SUFFIX};
use crate::compression::CompressionMethod;
use crate::error::{Error, Result};
use crate::hasher::Crc32Engine;

#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub codec: CompressionMethod,
    pub level: i32,
    pub block_size: usize,
    pub engine: Crc32Engine,
}

pub struct CompressedStreamWriter {
    path: PathBuf,
    tail_path: PathBuf,
    file: File,
    header: StreamHeader,
    options: StreamOptions,
    next_block_index: u32,
    buffer: Vec<u8>,
    tail_dirty: bool,
}

impl std::fmt::Debug for CompressedStreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedStreamWriter")
            .field("path", &self.path)
            .field("generation", &self.header.generation)
            .field("next_block_index", &self.next_block_index)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl CompressedStreamWriter {
    /// Creates an empty stream at `path`, replacing whatever was there.
    pub fn create(path: &Path, options: StreamOptions, generation: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        let header = StreamHeader::new(options.codec, generation);
        file.write_all(&header.encode())?;
        file.sync_all()?;

        let tail_path = sibling(path, TAIL_SUFFIX);
        remove_if_exists(&tail_path)?;

        Ok(Self {
            path: path.to_path_buf(),
            tail_path,
            file,
            header,
            options,
            next_block_index: 0,
            buffer: Vec::with_capacity(options.block_size),
            tail_dirty: false,
        })
    }

    /// Opens an existing stream for appending, dropping a torn trailing frame
    /// and restoring the partial block from a matching tail file.
    pub fn open(path: &Path, options: StreamOptions) -> Result<Self> {
        let len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if len < STREAM_HEADER_SIZE as u64 {
            return Self::create(path, options, 1);
        }

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut buf = [0u8; STREAM_HEADER_SIZE];
        file.read_exact(&mut buf)?;
        let header = StreamHeader::decode(&buf)?;

        let (valid_end, frames) = scan_frames(&mut file, len)?;
        if valid_end < len {
            file.set_len(valid_end)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_end))?;

        let tail_path = sibling(path, TAIL_SUFFIX);
        let buffer = match read_tail(&tail_path, &header, frames, options.engine)? {
            Some(data) => data,
            None => Vec::with_capacity(options.block_size),
        };

        Ok(Self {
            path: path.to_path_buf(),
            tail_path,
            file,
            options: StreamOptions {
                codec: header.codec,
                ..options
            },
            header,
            next_block_index: frames,
            buffer,
            tail_dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn generation(&self) -> u64 {
        self.header.generation
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            if self.buffer.len() >= self.options.block_size {
                self.write_frame()?;
                continue;
            }
            let room = self.options.block_size - self.buffer.len();
            let take = room.min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buffer.len() == self.options.block_size {
                self.write_frame()?;
            }
        }
        self.tail_dirty = true;
        Ok(())
    }

    /// Persists the partially filled block to the tail file.
    pub fn write_tail(&mut self) -> Result<()> {
        if !self.tail_dirty {
            return Ok(());
        }
        if self.buffer.is_empty() {
            remove_if_exists(&self.tail_path)?;
        } else {
            let frame = self.encode_frame(&self.buffer)?;
            let mut out = Vec::with_capacity(TAIL_PREFIX_SIZE + frame.len());
            out.extend_from_slice(&self.header.generation.to_le_bytes());
            out.extend_from_slice(&frame);

            let mut tail = File::create(&self.tail_path)?;
            tail.write_all(&out)?;
            tail.sync_data()?;
        }
        self.tail_dirty = false;
        Ok(())
    }

    /// Makes everything written so far durable.
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.write_tail()
    }

    /// Writes the partial block as a short frame so the primary file holds
    /// the complete stream, then removes the tail.
    pub fn seal(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.write_frame()?;
        }
        self.file.sync_data()?;
        remove_if_exists(&self.tail_path)?;
        self.tail_dirty = false;
        Ok(())
    }

    /// Primary plus tail size on disk.
    pub fn disk_size(&self) -> u64 {
        let primary = self.file.metadata().map_or(0, |m| m.len());
        let tail = fs::metadata(&self.tail_path).map_or(0, |m| m.len());
        primary + tail
    }

    /// Atomically swaps the stream content for `data`.
    ///
    /// The new generation is written completely to `<path>.tmp` and sealed,
    /// optionally the previous generation is appended to `backup`, and the
    /// temporary file is renamed over the primary. The stale tail is removed
    /// afterwards; its generation no longer matches, so a crash before the
    /// removal cannot resurrect it.
    pub fn rewrite(&mut self, data: &[u8], tmp_path: &Path, backup: Option<&Path>) -> Result<()> {
        let generation = self.header.generation.wrapping_add(1);
        let mut next = Self::create(tmp_path, self.options, generation)?;
        next.write(data)?;
        next.seal()?;

        if let Some(backup) = backup {
            self.append_generation_to(backup)?;
        }

        fs::rename(tmp_path, &self.path)?;
        sync_parent_dir(&self.path)?;
        remove_if_exists(&self.tail_path)?;

        next.path = self.path.clone();
        next.tail_path = self.tail_path.clone();
        *self = next;
        Ok(())
    }

    fn append_generation_to(&self, backup: &Path) -> Result<()> {
        let mut out = OpenOptions::new().create(true).append(true).open(backup)?;
        out.write_all(&fs::read(&self.path)?)?;
        match fs::read(&self.tail_path) {
            Ok(tail) => out.write_all(&tail)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        out.sync_all()?;
        Ok(())
    }

    fn write_frame(&mut self) -> Result<()> {
        let frame = self.encode_frame(&self.buffer)?;
        self.file.write_all(&frame)?;
        self.next_block_index += 1;
        self.buffer.clear();
        Ok(())
    }

    fn encode_frame(&self, block: &[u8]) -> Result<Vec<u8>> {
        let payload = self.options.codec.compress(block, self.options.level)?;
        let header = FrameHeader {
            block_index: self.next_block_index,
            decompressed_len: block.len() as u32,
            compressed_len: payload.len() as u32,
            checksum: self.options.engine.checksum(&payload),
        };
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }
}

/// The logical content of a stream, decoded up to the first unreadable frame.
#[derive(Debug, Default)]
pub struct DecodedStream {
    pub data: Vec<u8>,
    /// Set when a frame failed its checksum or could not be decompressed.
    pub error: Option<Error>,
}

pub fn read_stream(path: &Path, engine: Crc32Engine) -> Result<DecodedStream> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DecodedStream::default()),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    if len < STREAM_HEADER_SIZE as u64 {
        return Ok(DecodedStream::default());
    }

    let mut buf = [0u8; STREAM_HEADER_SIZE];
    file.read_exact(&mut buf)?;
    let header = StreamHeader::decode(&buf)?;

    let mut reader = io::BufReader::new(file);
    let mut decoded = DecodedStream::default();
    let mut block_index = 0u32;
    loop {
        let frame = match read_frame(&mut reader)? {
            Some(frame) => frame,
            None => break,
        };
        match decode_frame(&frame, &header, block_index, engine) {
            Ok(block) => decoded.data.extend_from_slice(&block),
            Err(reason) => {
                decoded.error = Some(Error::CorruptedLog {
                    offset: decoded.data.len() as u64,
                    reason: format!("block {}: {}", block_index, reason),
                });
                return Ok(decoded);
            }
        }
        block_index += 1;
    }

    let tail_path = sibling(path, TAIL_SUFFIX);
    if let Some(tail) = read_tail(&tail_path, &header, block_index, engine)? {
        decoded.data.extend_from_slice(&tail);
    }
    Ok(decoded)
}

struct RawFrame {
    header: FrameHeader,
    payload: Vec<u8>,
}

/// Reads one frame; `None` at end of input or on a torn trailing frame.
fn read_frame<R: Read>(reader: &mut R) -> Result<Option<RawFrame>> {
    let mut buf = [0u8; FRAME_HEADER_SIZE];
    if read_full(reader, &mut buf)? < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let header = FrameHeader::decode(&buf);

    let mut payload = Vec::new();
    reader
        .by_ref()
        .take(header.compressed_len as u64)
        .read_to_end(&mut payload)?;
    if payload.len() < header.compressed_len as usize {
        return Ok(None);
    }
    Ok(Some(RawFrame { header, payload }))
}

fn decode_frame(
    frame: &RawFrame,
    stream: &StreamHeader,
    expected_index: u32,
    engine: Crc32Engine,
) -> std::result::Result<Vec<u8>, String> {
    if frame.header.block_index != expected_index {
        return Err(format!(
            "unexpected block index {}",
            frame.header.block_index
        ));
    }
    let computed = engine.checksum(&frame.payload);
    if computed != frame.header.checksum {
        return Err(format!(
            "checksum mismatch: stored {:#010x}, computed {:#010x}",
            frame.header.checksum, computed
        ));
    }
    stream
        .codec
        .decompress(&frame.payload, frame.header.decompressed_len as usize)
        .map_err(|e| e.to_string())
}

/// Walks frame boundaries without decoding. Returns the end of the last
/// complete frame and the number of complete frames.
fn scan_frames(file: &mut File, len: u64) -> Result<(u64, u32)> {
    let mut pos = STREAM_HEADER_SIZE as u64;
    let mut frames = 0u32;
    let mut buf = [0u8; FRAME_HEADER_SIZE];
    while pos + FRAME_HEADER_SIZE as u64 <= len {
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut buf)?;
        let header = FrameHeader::decode(&buf);
        let end = pos + header.frame_len();
        if end > len {
            break;
        }
        pos = end;
        frames += 1;
    }
    Ok((pos, frames))
}

fn read_tail(
    tail_path: &Path,
    header: &StreamHeader,
    expected_index: u32,
    engine: Crc32Engine,
) -> Result<Option<Vec<u8>>> {
    let bytes = match fs::read(tail_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() < TAIL_PREFIX_SIZE {
        return Ok(None);
    }
    if LittleEndian::read_u64(&bytes[..TAIL_PREFIX_SIZE]) != header.generation {
        return Ok(None);
    }
    let mut rest = &bytes[TAIL_PREFIX_SIZE..];
    let frame = match read_frame(&mut rest)? {
        Some(frame) => frame,
        None => return Ok(None),
    };
    Ok(decode_frame(&frame, header, expected_index, engine).ok())
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn sync_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}
