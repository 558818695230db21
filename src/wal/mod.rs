//! Write-ahead logs: one per in-memory segment.
//!
//! Every write to a segment is recorded here under its operation index before
//! it becomes visible, so the segment can be rebuilt after a restart. Four
//! strategies trade durability for throughput behind the [`WriteAheadLog`]
//! trait:
//!
//! - [`SyncWal`] writes and fsyncs every record before `append` returns.
//! - [`SyncCompressedWal`] appends into a block-compressed stream; a tail
//!   writer persists the unfinished block periodically, so a crash loses at
//!   most one tail-writer interval.
//! - [`AsyncCompressedWal`] only enqueues records; a dedicated writer thread
//!   compresses and writes them. Queued records are lost on a crash.
//! - [`NullWal`] records nothing.
//!
//! # Files
//!
//! ```text
//! <path>        records (sync) or stream header + compressed frames
//! <path>.tail   unfinished compressed block
//! <path>.tmp    replacement being written
//! <path>.full   every replaced generation, appended (incremental backup)
//! ```
//!
//! Replacement writes the new content to `<path>.tmp`, fsyncs it and renames
//! it over `<path>`, so a reader or a restart sees either the old or the new
//! log in full.

pub mod async_compressed;
pub mod header;
pub mod null;
pub mod record;
pub mod stream;
pub mod sync;
pub mod sync_compressed;

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use itertools::{izip, Itertools};
use tracing::Span;

pub use async_compressed::AsyncCompressedWal;
pub use null::NullWal;
pub use record::LogRecord;
pub use sync::SyncWal;
pub use sync_compressed::SyncCompressedWal;

use crate::config::{DurabilityMode, WalConfig};
use crate::error::{Error, Result};
use crate::hasher::Crc32Engine;
use stream::StreamOptions;

pub const TAIL_SUFFIX: &str = ".tail";
pub const TMP_SUFFIX: &str = ".tmp";
pub const BACKUP_SUFFIX: &str = ".full";

pub trait WriteAheadLog: Send + Sync + fmt::Debug {
    fn path(&self) -> &Path;

    /// Records one operation. Durability on return depends on the strategy.
    fn append(&self, key: &[u8], value: &[u8], op_index: i64) -> Result<()>;

    /// Replays the whole log. Decoding failures are collected in
    /// [`LogEntries::errors`]; only I/O failures opening the log are returned
    /// as `Err`.
    fn read_log_entries(&self, options: ReadOptions) -> Result<LogEntries>;

    /// Atomically swaps the log content for the given records, numbered by
    /// position. Returns the bytes reclaimed (negative if the log grew).
    ///
    /// A failed replacement is logged and the original log stays in use; the
    /// returned value is then recomputed from the files on disk.
    fn replace_write_ahead_log(
        &self,
        keys: &[Vec<u8>],
        values: &[Vec<u8>],
        disable_backup: bool,
    ) -> Result<i64>;

    /// Stops accepting appends and releases the file once buffered data is
    /// durable.
    fn mark_frozen(&self) -> Result<()>;

    /// Cuts the log back to `position`, the logical offset of the first
    /// record that could not be read.
    fn truncate_incomplete_tail_record(&self, position: u64) -> Result<()>;

    /// Makes appended records durable where the strategy allows it.
    fn flush(&self) -> Result<()>;

    /// Deletes the log and its companion files.
    fn drop_log(&self) -> Result<()>;
}

/// Replay policy for [`WriteAheadLog::read_log_entries`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Stop at the first failure of any kind. Failures that lose the record
    /// framing always stop the read.
    pub stop_on_error: bool,
    /// Stop at the first record whose checksum does not match instead of
    /// skipping it.
    pub stop_on_checksum_failure: bool,
    /// Return records in operation-index order rather than file order.
    pub sort_by_op_index: bool,
}

impl ReadOptions {
    pub fn new(stop_on_error: bool, stop_on_checksum_failure: bool, sort_by_op_index: bool) -> Self {
        Self {
            stop_on_error,
            stop_on_checksum_failure,
            sort_by_op_index,
        }
    }
}

#[derive(Debug, Default)]
pub struct LogEntries {
    /// True when every record decoded cleanly.
    pub success: bool,
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<Vec<u8>>,
    pub op_indexes: Vec<i64>,
    pub errors: Vec<Error>,
}

impl LogEntries {
    pub fn empty() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Decodes records until the source ends or the policy says stop.
    pub fn collect<I>(records: I, options: ReadOptions) -> Self
    where
        I: IntoIterator<Item = Result<LogRecord>>,
    {
        let mut entries = LogEntries::empty();
        for record in records {
            match record {
                Ok(record) => {
                    entries.keys.push(record.key);
                    entries.values.push(record.value);
                    entries.op_indexes.push(record.op_index);
                }
                Err(e) => {
                    let skippable = e.is_checksum_mismatch()
                        && !options.stop_on_error
                        && !options.stop_on_checksum_failure;
                    entries.success = false;
                    entries.errors.push(e);
                    if !skippable {
                        break;
                    }
                }
            }
        }
        if options.sort_by_op_index {
            entries.sort_by_op_index();
        }
        entries
    }

    fn sort_by_op_index(&mut self) {
        let keys = std::mem::take(&mut self.keys);
        let values = std::mem::take(&mut self.values);
        let op_indexes = std::mem::take(&mut self.op_indexes);
        for (key, value, op_index) in izip!(keys, values, op_indexes).sorted_by_key(|r| r.2) {
            self.keys.push(key);
            self.values.push(value);
            self.op_indexes.push(op_index);
        }
    }

    /// Lowest logical offset at which the log stopped being readable: the
    /// start of an incomplete tail record or of corrupted framing.
    pub fn truncation_point(&self) -> Option<u64> {
        self.errors
            .iter()
            .filter_map(|e| match e {
                Error::IncompleteTailRecord { record_offset, .. } => Some(*record_offset),
                Error::CorruptedLog { offset, .. } => Some(*offset),
                _ => None,
            })
            .min()
    }

    pub fn has_checksum_failures(&self) -> bool {
        self.errors.iter().any(Error::is_checksum_mismatch)
    }

    /// True when the only problem is data past the last complete record.
    pub fn only_incomplete_tail(&self) -> bool {
        !self.errors.is_empty() && self.errors.iter().all(Error::is_incomplete_tail)
    }

    pub fn max_op_index(&self) -> Option<i64> {
        self.op_indexes.iter().copied().max()
    }
}

/// `<path><suffix>`, e.g. `3.wal.tail`.
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Encodes replacement records, numbering them by position.
pub(crate) fn encode_replacement(
    engine: Crc32Engine,
    keys: &[Vec<u8>],
    values: &[Vec<u8>],
) -> Result<Vec<u8>> {
    if keys.len() != values.len() {
        return Err(Error::InvalidState(format!(
            "{} keys but {} values",
            keys.len(),
            values.len()
        )));
    }
    let mut buf = Vec::new();
    for (op_index, (key, value)) in keys.iter().zip(values).enumerate() {
        record::encode_into(&mut buf, engine, key, value, op_index as i64)?;
    }
    Ok(buf)
}

/// Length of the longest run of whole records within `data[..limit]`.
pub(crate) fn record_boundary(data: &[u8], engine: Crc32Engine, limit: u64) -> usize {
    let end = (limit as usize).min(data.len());
    let mut reader = record::RecordReader::new(&data[..end], engine);
    let mut boundary = 0;
    while let Some(record) = reader.next() {
        match record {
            Err(e) if !e.is_checksum_mismatch() => break,
            _ => boundary = reader.offset() as usize,
        }
    }
    boundary
}

pub(crate) fn stream_options(config: &WalConfig, engine: Crc32Engine) -> StreamOptions {
    StreamOptions {
        codec: config.compression_method,
        level: config.compression_level,
        block_size: config.compression_block_size,
        engine,
    }
}

/// Opens (or creates) the log at `path` with the configured strategy.
pub fn open_wal(
    path: impl Into<PathBuf>,
    config: &WalConfig,
    engine: Crc32Engine,
    span: Span,
) -> Result<Arc<dyn WriteAheadLog>> {
    let path = path.into();
    let wal: Arc<dyn WriteAheadLog> = match config.durability_mode {
        DurabilityMode::Sync => Arc::new(SyncWal::open(path, config, engine, span)?),
        DurabilityMode::SyncCompressed => {
            Arc::new(SyncCompressedWal::open(path, config, engine, span)?)
        }
        DurabilityMode::AsyncCompressed => {
            Arc::new(AsyncCompressedWal::open(path, config, engine, span)?)
        }
        DurabilityMode::Null => Arc::new(NullWal::new(path)),
    };
    Ok(wal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const MODES: [DurabilityMode; 3] = [
        DurabilityMode::Sync,
        DurabilityMode::SyncCompressed,
        DurabilityMode::AsyncCompressed,
    ];

    fn engine() -> Crc32Engine {
        Crc32Engine::detect().unwrap()
    }

    fn config(mode: DurabilityMode) -> WalConfig {
        WalConfig::default()
            .durability_mode(mode)
            .compression_block_size(64)
            .empty_queue_poll_interval(std::time::Duration::from_millis(5))
            .enable_tail_writer_job(false)
    }

    fn open(path: &Path, mode: DurabilityMode) -> Arc<dyn WriteAheadLog> {
        open_wal(path, &config(mode), engine(), Span::none()).unwrap()
    }

    #[test]
    fn test_reopened_sync_log_returns_appended_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.wal");

        let wal = open(&path, DurabilityMode::Sync);
        wal.append(&1i32.to_le_bytes(), b"a", 0).unwrap();
        wal.append(&2i32.to_le_bytes(), b"b", 1).unwrap();
        drop(wal);

        let wal = open(&path, DurabilityMode::Sync);
        let entries = wal.read_log_entries(ReadOptions::new(true, true, false)).unwrap();
        assert!(entries.success);
        assert_eq!(
            entries.keys,
            vec![1i32.to_le_bytes().to_vec(), 2i32.to_le_bytes().to_vec()]
        );
        assert_eq!(entries.values, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(entries.op_indexes, vec![0, 1]);
    }

    #[test]
    fn test_every_strategy_replays_what_was_appended() {
        for mode in MODES {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("0.wal");

            let wal = open(&path, mode);
            for i in 0..50i64 {
                let key = format!("key{:03}", i);
                let value = format!("value-{}", i).repeat(3);
                wal.append(key.as_bytes(), value.as_bytes(), i).unwrap();
            }
            wal.flush().unwrap();
            wal.mark_frozen().unwrap();
            drop(wal);

            let wal = open(&path, mode);
            let entries = wal.read_log_entries(ReadOptions::new(true, true, false)).unwrap();
            assert!(entries.success, "{:?}: {:?}", mode, entries.errors);
            assert_eq!(entries.len(), 50, "{:?}", mode);
            for i in 0..50usize {
                assert_eq!(entries.keys[i], format!("key{:03}", i).as_bytes());
                assert_eq!(entries.op_indexes[i], i as i64);
            }
        }
    }

    #[test]
    fn test_replacement_yields_exactly_new_records() {
        for mode in MODES {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("0.wal");

            let wal = open(&path, mode);
            for i in 0..20i64 {
                wal.append(b"same-key", format!("v{}", i).as_bytes(), i).unwrap();
            }
            wal.flush().unwrap();

            let keys = vec![b"same-key".to_vec()];
            let values = vec![b"v19".to_vec()];
            let reclaimed = wal.replace_write_ahead_log(&keys, &values, true).unwrap();
            assert!(reclaimed > 0, "{:?}", mode);

            wal.append(b"after", b"replace", 20).unwrap();
            wal.flush().unwrap();

            let entries = wal.read_log_entries(ReadOptions::new(true, true, false)).unwrap();
            assert!(entries.success, "{:?}", mode);
            assert_eq!(entries.keys, vec![b"same-key".to_vec(), b"after".to_vec()]);
            assert_eq!(entries.values, vec![b"v19".to_vec(), b"replace".to_vec()]);
            assert!(!sibling(&path, TMP_SUFFIX).exists());
        }
    }

    #[test]
    fn test_failed_replacement_keeps_original() {
        for mode in MODES {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("0.wal");

            let wal = open(&path, mode);
            wal.append(b"k1", b"v1", 0).unwrap();
            wal.append(b"k2", b"v2", 1).unwrap();
            wal.flush().unwrap();

            // The temporary file cannot be created, as if the process died
            // before the rename.
            fs::create_dir(sibling(&path, TMP_SUFFIX)).unwrap();
            wal.replace_write_ahead_log(&[b"x".to_vec()], &[b"y".to_vec()], true)
                .unwrap();

            wal.append(b"k3", b"v3", 2).unwrap();
            wal.flush().unwrap();
            let entries = wal.read_log_entries(ReadOptions::new(true, true, false)).unwrap();
            assert!(entries.success, "{:?}", mode);
            assert_eq!(
                entries.keys,
                vec![b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec()],
                "{:?}",
                mode
            );
        }
    }

    #[test]
    fn test_unrenamed_replacement_leaves_original_intact() {
        for mode in MODES {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("0.wal");
            {
                let wal = open(&path, mode);
                wal.append(b"k1", b"v1", 0).unwrap();
                wal.append(b"k2", b"v2", 1).unwrap();
                wal.flush().unwrap();
            }

            // A complete replacement written next to the log, the process
            // gone before the rename.
            let staged = dir.path().join("staged.wal");
            {
                let wal = open(&staged, mode);
                wal.append(b"x", b"y", 0).unwrap();
                wal.mark_frozen().unwrap();
            }
            fs::copy(&staged, sibling(&path, TMP_SUFFIX)).unwrap();

            let wal = open(&path, mode);
            let entries = wal.read_log_entries(ReadOptions::new(true, true, false)).unwrap();
            assert!(entries.success, "{:?}", mode);
            assert_eq!(entries.keys, vec![b"k1".to_vec(), b"k2".to_vec()], "{:?}", mode);
            assert_eq!(entries.values, vec![b"v1".to_vec(), b"v2".to_vec()], "{:?}", mode);

            // The leftover does not get in the way of the next replacement.
            wal.replace_write_ahead_log(&[b"k2".to_vec()], &[b"v2".to_vec()], true)
                .unwrap();
            let entries = wal.read_log_entries(ReadOptions::new(true, true, false)).unwrap();
            assert_eq!(entries.keys, vec![b"k2".to_vec()], "{:?}", mode);
            assert!(!sibling(&path, TMP_SUFFIX).exists(), "{:?}", mode);
        }
    }

    #[test]
    fn test_incremental_backup_accumulates_generations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.wal");
        let config = config(DurabilityMode::Sync).enable_incremental_backup(true);
        let wal = open_wal(&path, &config, engine(), Span::none()).unwrap();

        wal.append(b"k", b"v1", 0).unwrap();
        let first_len = fs::metadata(&path).unwrap().len();
        wal.replace_write_ahead_log(&[b"k".to_vec()], &[b"v2".to_vec()], false)
            .unwrap();
        wal.replace_write_ahead_log(&[b"k".to_vec()], &[b"v3".to_vec()], false)
            .unwrap();
        let backup_len = fs::metadata(sibling(&path, BACKUP_SUFFIX)).unwrap().len();
        assert_eq!(backup_len, first_len * 2);

        wal.replace_write_ahead_log(&[b"k".to_vec()], &[b"v4".to_vec()], true)
            .unwrap();
        let backup_len_after = fs::metadata(sibling(&path, BACKUP_SUFFIX)).unwrap().len();
        assert_eq!(backup_len_after, backup_len);
    }

    #[test]
    fn test_truncating_incomplete_tail() {
        for mode in MODES {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("0.wal");

            let wal = open(&path, mode);
            wal.append(b"k1", b"v1", 0).unwrap();
            wal.append(b"k2", b"v2", 1).unwrap();
            wal.flush().unwrap();
            wal.mark_frozen().unwrap();
            drop(wal);

            // Cut at the end of the first record.
            let first = record::encoded_len(b"k1", b"v1");
            let wal = open(&path, mode);
            wal.truncate_incomplete_tail_record(first as u64).unwrap();
            let entries = wal.read_log_entries(ReadOptions::new(false, false, false)).unwrap();
            assert_eq!(entries.keys, vec![b"k1".to_vec()], "{:?}", mode);
            assert!(entries.success, "{:?}", mode);
        }
    }

    #[test]
    fn test_sort_by_op_index() {
        let records = vec![
            Ok(LogRecord {
                op_index: 5,
                key: b"b".to_vec(),
                value: b"2".to_vec(),
            }),
            Ok(LogRecord {
                op_index: 3,
                key: b"a".to_vec(),
                value: b"1".to_vec(),
            }),
            Ok(LogRecord {
                op_index: 9,
                key: b"c".to_vec(),
                value: b"3".to_vec(),
            }),
        ];
        let entries = LogEntries::collect(records, ReadOptions::new(true, true, true));
        assert_eq!(entries.op_indexes, vec![3, 5, 9]);
        assert_eq!(entries.keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(entries.values, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
    }

    #[test]
    fn test_checksum_policy() {
        let mismatch = || Error::ChecksumMismatch {
            offset: 0,
            stored: 1,
            computed: 2,
        };
        let ok = |op| {
            Ok(LogRecord {
                op_index: op,
                key: vec![op as u8],
                value: vec![],
            })
        };

        let skipped = LogEntries::collect(
            vec![ok(0), Err(mismatch()), ok(2)],
            ReadOptions::new(false, false, false),
        );
        assert!(!skipped.success);
        assert_eq!(skipped.op_indexes, vec![0, 2]);
        assert!(skipped.has_checksum_failures());

        let stopped = LogEntries::collect(
            vec![ok(0), Err(mismatch()), ok(2)],
            ReadOptions::new(false, true, false),
        );
        assert_eq!(stopped.op_indexes, vec![0]);
        assert_eq!(stopped.errors.len(), 1);
    }

    #[test]
    fn test_flipped_bit_is_flagged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.wal");
        let wal = open(&path, DurabilityMode::Sync);
        wal.append(b"key1", b"value1", 0).unwrap();
        wal.append(b"key2", b"value2", 1).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[record::RECORD_HEADER_SIZE + 6] ^= 0x01;
        fs::write(&path, &bytes).unwrap();

        let entries = wal.read_log_entries(ReadOptions::new(false, false, false)).unwrap();
        assert!(!entries.success);
        assert_eq!(entries.keys, vec![b"key2".to_vec()]);
        assert!(matches!(
            entries.errors[0],
            Error::ChecksumMismatch { offset: 0, .. }
        ));
    }

    #[test]
    fn test_drop_removes_companion_files() {
        for mode in MODES {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("0.wal");
            let wal = open(&path, mode);
            wal.append(b"k", b"v", 0).unwrap();
            wal.flush().unwrap();
            wal.drop_log().unwrap();
            assert!(!path.exists(), "{:?}", mode);
            assert!(!sibling(&path, TAIL_SUFFIX).exists(), "{:?}", mode);
            assert!(wal.append(b"k", b"v", 1).is_err(), "{:?}", mode);
        }
    }

    #[test]
    fn test_null_log_records_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.wal");
        let wal = open(&path, DurabilityMode::Null);
        wal.append(b"k", b"v", 0).unwrap();
        let entries = wal.read_log_entries(ReadOptions::default()).unwrap();
        assert!(entries.success);
        assert!(entries.is_empty());
        assert!(!path.exists());
    }
}
