//! Immutable, block-compressed segment produced by a merge.
//!
//! ## File layout
//!
//! ```text
//! +--------------------------+
//! | Data block 0 (compressed)|
//! | ...                      |
//! | Data block N-1           |
//! +--------------------------+
//! | Block table              |  N x (offset u64 | compressed_len u32 |
//! |                          |       decompressed_len u32 |
//! |                          |       first_record u64 | crc32c u32)
//! +--------------------------+
//! | Footer                   |  table_offset u64 | block_count u32 |
//! |                          |  record_count u64 | merged_segment_id u64 |
//! |                          |  codec u8 | magic u32
//! +--------------------------+
//! ```
//!
//! Records are stored in key order and addressed by their position. Point
//! lookups binary-search record positions, narrowed first by the sparse array
//! (every n-th key kept in memory) when one has been built.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::{Mutex, RwLock};
use tracing::Span;

use super::block::{BlockBuilder, BlockView};
use crate::cache::{new_block_cache, BlockCache, DecompressedBlock};
use crate::compression::CompressionMethod;
use crate::config::DiskSegmentConfig;
use crate::error::{Error, Result};
use crate::hasher::Crc32Engine;
use crate::wal::stream::{remove_if_exists, sync_parent_dir};
use crate::wal::{sibling, TMP_SUFFIX};

pub const SEGMENT_MAGIC: u32 = 0x454D_4253; // "EMBS"
const BLOCK_HANDLE_SIZE: usize = 28;
const FOOTER_SIZE: usize = 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockHandle {
    offset: u64,
    compressed_len: u32,
    decompressed_len: u32,
    first_record: u64,
    checksum: u32,
}

impl BlockHandle {
    fn encode(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_u64::<LittleEndian>(self.offset)?;
        buf.write_u32::<LittleEndian>(self.compressed_len)?;
        buf.write_u32::<LittleEndian>(self.decompressed_len)?;
        buf.write_u64::<LittleEndian>(self.first_record)?;
        buf.write_u32::<LittleEndian>(self.checksum)?;
        Ok(())
    }

    fn decode(mut buf: &[u8]) -> std::io::Result<Self> {
        Ok(Self {
            offset: buf.read_u64::<LittleEndian>()?,
            compressed_len: buf.read_u32::<LittleEndian>()?,
            decompressed_len: buf.read_u32::<LittleEndian>()?,
            first_record: buf.read_u64::<LittleEndian>()?,
            checksum: buf.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Footer {
    table_offset: u64,
    block_count: u32,
    record_count: u64,
    merged_segment_id: u64,
    codec: CompressionMethod,
}

impl Footer {
    fn encode(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        buf.write_u64::<LittleEndian>(self.table_offset)?;
        buf.write_u32::<LittleEndian>(self.block_count)?;
        buf.write_u64::<LittleEndian>(self.record_count)?;
        buf.write_u64::<LittleEndian>(self.merged_segment_id)?;
        buf.write_u8(self.codec.to_u8())?;
        buf.write_u32::<LittleEndian>(SEGMENT_MAGIC)?;
        Ok(buf)
    }

    fn decode(buf: &[u8; FOOTER_SIZE]) -> std::result::Result<Self, String> {
        let magic = LittleEndian::read_u32(&buf[29..33]);
        if magic != SEGMENT_MAGIC {
            return Err(format!("bad magic {:#010x}", magic));
        }
        Ok(Self {
            table_offset: LittleEndian::read_u64(&buf[0..8]),
            block_count: LittleEndian::read_u32(&buf[8..12]),
            record_count: LittleEndian::read_u64(&buf[12..20]),
            merged_segment_id: LittleEndian::read_u64(&buf[20..28]),
            codec: CompressionMethod::from_u8(buf[28]).map_err(|e| e.to_string())?,
        })
    }
}

/// Streams sorted records into a new segment file.
///
/// Data goes to `<path>.tmp`; [`finish`](Self::finish) writes the block table
/// and footer, syncs and renames it into place, so a crash mid-merge never
/// leaves a truncated segment under the final name.
pub struct DiskSegmentWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    offset: u64,
    builder: BlockBuilder,
    block_first_record: u64,
    record_count: u64,
    blocks: Vec<BlockHandle>,
    last_key: Option<Vec<u8>>,
    codec: CompressionMethod,
    level: i32,
    block_size: usize,
    engine: Crc32Engine,
}

impl DiskSegmentWriter {
    pub fn create(
        path: impl Into<PathBuf>,
        config: &DiskSegmentConfig,
        engine: Crc32Engine,
    ) -> Result<Self> {
        let path = path.into();
        let tmp_path = sibling(&path, TMP_SUFFIX);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        Ok(Self {
            path,
            tmp_path,
            writer: BufWriter::new(file),
            offset: 0,
            builder: BlockBuilder::new(),
            block_first_record: 0,
            record_count: 0,
            blocks: Vec::new(),
            last_key: None,
            codec: config.compression_method,
            level: config.compression_level,
            block_size: config.block_size,
            engine,
        })
    }

    /// Keys must arrive in strictly ascending order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(Error::InvalidState(format!(
                    "disk segment keys out of order: {:?} after {:?}",
                    key, last
                )));
            }
        }
        self.builder.add_entry(key, value);
        self.last_key = Some(key.to_vec());
        self.record_count += 1;
        if self.builder.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.builder.is_empty() {
            return Ok(());
        }
        let builder = std::mem::replace(&mut self.builder, BlockBuilder::new());
        let data = builder.finish();
        let compressed = self.codec.compress(&data, self.level)?;
        self.writer.write_all(&compressed)?;
        self.blocks.push(BlockHandle {
            offset: self.offset,
            compressed_len: compressed.len() as u32,
            decompressed_len: data.len() as u32,
            first_record: self.block_first_record,
            checksum: self.engine.checksum(&compressed),
        });
        self.offset += compressed.len() as u64;
        self.block_first_record = self.record_count;
        Ok(())
    }

    /// Completes the file and moves it to its final path.
    pub fn finish(mut self, merged_segment_id: u64) -> Result<PathBuf> {
        self.flush_block()?;

        let mut table = Vec::with_capacity(self.blocks.len() * BLOCK_HANDLE_SIZE);
        for handle in &self.blocks {
            handle.encode(&mut table)?;
        }
        self.writer.write_all(&table)?;

        let footer = Footer {
            table_offset: self.offset,
            block_count: self.blocks.len() as u32,
            record_count: self.record_count,
            merged_segment_id,
            codec: self.codec,
        };
        self.writer.write_all(&footer.encode()?)?;

        let file = self
            .writer
            .into_inner()
            .map_err(|e| Error::IoError(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;
        sync_parent_dir(&self.path)?;
        Ok(self.path)
    }
}

struct SparseEntry {
    key: Vec<u8>,
    record: u64,
}

pub struct DiskSegment {
    path: PathBuf,
    file: Mutex<File>,
    blocks: Vec<BlockHandle>,
    record_count: u64,
    merged_segment_id: u64,
    codec: CompressionMethod,
    engine: Crc32Engine,
    cache: Arc<dyn BlockCache>,
    sparse: RwLock<Vec<SparseEntry>>,
    span: Span,
}

impl std::fmt::Debug for DiskSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskSegment")
            .field("path", &self.path)
            .field("records", &self.record_count)
            .field("blocks", &self.blocks.len())
            .field("merged_segment_id", &self.merged_segment_id)
            .finish()
    }
}

impl DiskSegment {
    pub fn open(
        path: impl Into<PathBuf>,
        config: &DiskSegmentConfig,
        engine: Crc32Engine,
        span: Span,
    ) -> Result<Self> {
        let path = path.into();
        let invalid = |reason: String| Error::InvalidSegment {
            path: path.clone(),
            reason,
        };

        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_SIZE as u64 {
            return Err(invalid(format!("file too short ({} bytes)", file_len)));
        }

        let mut footer = [0u8; FOOTER_SIZE];
        file.seek(SeekFrom::Start(file_len - FOOTER_SIZE as u64))?;
        file.read_exact(&mut footer)?;
        let footer = Footer::decode(&footer).map_err(&invalid)?;

        let table_len = footer.block_count as u64 * BLOCK_HANDLE_SIZE as u64;
        if footer.table_offset.checked_add(table_len) != Some(file_len - FOOTER_SIZE as u64) {
            return Err(invalid("block table does not end at the footer".into()));
        }

        let mut table = vec![0u8; table_len as usize];
        file.seek(SeekFrom::Start(footer.table_offset))?;
        file.read_exact(&mut table)?;
        let blocks = table
            .chunks_exact(BLOCK_HANDLE_SIZE)
            .map(BlockHandle::decode)
            .collect::<std::io::Result<Vec<_>>>()?;

        let ordered = blocks.first().map_or(true, |b| b.first_record == 0)
            && blocks.windows(2).all(|w| w[0].first_record < w[1].first_record)
            && blocks.last().map_or(true, |b| b.first_record < footer.record_count)
            && (footer.record_count == 0) == blocks.is_empty();
        if !ordered {
            return Err(invalid("block table is inconsistent".into()));
        }

        tracing::debug!(
            parent: &span,
            path = ?path,
            records = footer.record_count,
            blocks = blocks.len(),
            "Opened disk segment"
        );

        Ok(Self {
            cache: new_block_cache(&config.block_cache, span.clone()),
            path,
            file: Mutex::new(file),
            blocks,
            record_count: footer.record_count,
            merged_segment_id: footer.merged_segment_id,
            codec: footer.codec,
            engine,
            sparse: RwLock::new(Vec::new()),
            span,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Highest mutable-segment id whose data this segment contains.
    pub fn merged_segment_id(&self) -> u64 {
        self.merged_segment_id
    }

    pub fn cache(&self) -> &Arc<dyn BlockCache> {
        &self.cache
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let index = self.partition_point(|k| k < key)?;
        if index >= self.record_count {
            return Ok(None);
        }
        let (found, value) = self.record_at(index)?;
        Ok((found == key).then_some(value))
    }

    /// Iterates records from `start` to the end of the segment.
    pub fn iter_from(self: &Arc<Self>, start: Bound<&Vec<u8>>) -> Result<DiskSegmentIter> {
        let next = match start {
            Bound::Unbounded => 0,
            Bound::Included(key) => self.partition_point(|k| k < key.as_slice())?,
            Bound::Excluded(key) => self.partition_point(|k| k <= key.as_slice())?,
        };
        Ok(DiskSegmentIter {
            segment: self.clone(),
            next,
            current: None,
        })
    }

    /// Keeps every `record_count / len`-th key in memory to narrow lookups.
    /// Zero drops the array.
    pub fn init_sparse_array(&self, len: usize) -> Result<()> {
        let len = (len as u64).min(self.record_count);
        let mut entries = Vec::with_capacity(len as usize);
        for i in 0..len {
            let record = i * self.record_count / len;
            entries.push(SparseEntry {
                key: self.key_at(record)?,
                record,
            });
        }
        tracing::debug!(
            parent: &self.span,
            path = ?self.path,
            len = entries.len(),
            "Sparse array initialized"
        );
        *self.sparse.write() = entries;
        Ok(())
    }

    pub fn sparse_array_len(&self) -> usize {
        self.sparse.read().len()
    }

    /// Drops cached blocks not read since `ticks`; returns how many.
    pub fn release_inactive_blocks(&self, ticks: i64) -> usize {
        self.cache.remove_blocks_accessed_before(ticks)
    }

    /// Deletes the file. Open handles keep working until dropped.
    pub fn drop_file(&self) -> Result<()> {
        self.cache.clear();
        remove_if_exists(&self.path)
    }

    /// First record position for which `pred(key)` is false. `pred` must be
    /// true for a prefix of the keys and false for the rest.
    fn partition_point(&self, pred: impl Fn(&[u8]) -> bool) -> Result<u64> {
        let (mut lo, mut hi) = {
            let sparse = self.sparse.read();
            let i = sparse.partition_point(|e| pred(&e.key));
            let lo = if i == 0 { 0 } else { sparse[i - 1].record + 1 };
            let hi = sparse.get(i).map_or(self.record_count, |e| e.record);
            (lo, hi)
        };
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(&self.key_at(mid)?) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn block_of(&self, record: u64) -> usize {
        self.blocks.partition_point(|b| b.first_record <= record) - 1
    }

    fn key_at(&self, record: u64) -> Result<Vec<u8>> {
        let block_no = self.block_of(record);
        let block = self.load_block(block_no)?;
        let view = BlockView::new(block.bytes(), block_no as u32)?;
        let key = view.key((record - self.blocks[block_no].first_record) as usize)?;
        Ok(key.to_vec())
    }

    fn record_at(&self, record: u64) -> Result<(Vec<u8>, Vec<u8>)> {
        let block_no = self.block_of(record);
        let block = self.load_block(block_no)?;
        let view = BlockView::new(block.bytes(), block_no as u32)?;
        let (key, value) = view.entry((record - self.blocks[block_no].first_record) as usize)?;
        Ok((key.to_vec(), value.to_vec()))
    }

    fn load_block(&self, block_no: usize) -> Result<Arc<DecompressedBlock>> {
        if let Some(block) = self.cache.try_get_block(block_no as u32) {
            return Ok(block);
        }

        let handle = self.blocks[block_no];
        let mut compressed = vec![0u8; handle.compressed_len as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(handle.offset))?;
            file.read_exact(&mut compressed)?;
        }

        let computed = self.engine.checksum(&compressed);
        if computed != handle.checksum {
            tracing::error!(
                parent: &self.span,
                path = ?self.path,
                block_no,
                "Disk segment block failed checksum"
            );
            return Err(Error::CorruptedBlock {
                block_index: block_no as u32,
                reason: format!(
                    "checksum mismatch: stored {:#010x}, computed {:#010x}",
                    handle.checksum, computed
                ),
            });
        }

        let bytes = self
            .codec
            .decompress(&compressed, handle.decompressed_len as usize)?;
        let block = Arc::new(DecompressedBlock::new(block_no as u32, bytes));
        self.cache.add_block(block.clone());
        Ok(block)
    }
}

/// Forward iterator over a disk segment's records.
pub struct DiskSegmentIter {
    segment: Arc<DiskSegment>,
    next: u64,
    current: Option<(usize, Arc<DecompressedBlock>)>,
}

impl DiskSegmentIter {
    fn read_next(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let block_no = self.segment.block_of(self.next);
        let block = match &self.current {
            Some((current, block)) if *current == block_no => block.clone(),
            _ => {
                let block = self.segment.load_block(block_no)?;
                self.current = Some((block_no, block.clone()));
                block
            }
        };
        let view = BlockView::new(block.bytes(), block_no as u32)?;
        let slot = (self.next - self.segment.blocks[block_no].first_record) as usize;
        let (key, value) = view.entry(slot)?;
        Ok((key.to_vec(), value.to_vec()))
    }
}

impl Iterator for DiskSegmentIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.segment.record_count {
            return None;
        }
        match self.read_next() {
            Ok(record) => {
                self.next += 1;
                Some(Ok(record))
            }
            Err(e) => {
                self.next = self.segment.record_count;
                Some(Err(e))
            }
        }
    }
}
