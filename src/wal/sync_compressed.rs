use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::Span;

use super::record::{self, RecordReader};
use super::stream::{self, remove_if_exists, CompressedStreamWriter, StreamOptions};
use super::{
    encode_replacement, record_boundary, sibling, stream_options, LogEntries, ReadOptions,
    WriteAheadLog, BACKUP_SUFFIX, TAIL_SUFFIX, TMP_SUFFIX,
};
use crate::config::WalConfig;
use crate::error::{Error, Result};
use crate::hasher::Crc32Engine;

/// Writer state shared by the compressed strategies. All operations run
/// under the owner's mutex, which also serializes appends against
/// replacement.
pub(crate) struct CompressedLog {
    pub path: PathBuf,
    pub options: StreamOptions,
    pub backup: bool,
    pub writer: Option<CompressedStreamWriter>,
    pub frozen: bool,
}

impl CompressedLog {
    pub fn open(path: PathBuf, config: &WalConfig, options: StreamOptions) -> Result<Self> {
        let writer = CompressedStreamWriter::open(&path, options)?;
        Ok(Self {
            path,
            options,
            backup: config.enable_incremental_backup,
            writer: Some(writer),
            frozen: false,
        })
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(bytes),
            None => Err(Error::LogFrozen(self.path.clone())),
        }
    }

    pub fn write_tail(&mut self) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_tail(),
            None => Ok(()),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    pub fn freeze(&mut self) -> Result<()> {
        self.frozen = true;
        if let Some(mut writer) = self.writer.take() {
            writer.seal()?;
        }
        Ok(())
    }

    pub fn read(&mut self, options: ReadOptions) -> Result<LogEntries> {
        self.write_tail()?;
        let decoded = stream::read_stream(&self.path, self.options.engine)?;
        let mut entries = LogEntries::collect(
            RecordReader::new(decoded.data.as_slice(), self.options.engine),
            options,
        );
        if let Some(error) = decoded.error {
            // The partial record cut off by the bad block is not a tail problem.
            entries.errors.retain(|e| !e.is_incomplete_tail());
            entries.errors.push(error);
            entries.success = false;
        }
        Ok(entries)
    }

    fn disk_size(&self) -> u64 {
        match &self.writer {
            Some(writer) => writer.disk_size(),
            None => [&self.path, &sibling(&self.path, TAIL_SUFFIX)]
                .iter()
                .map(|p| fs::metadata(p).map_or(0, |m| m.len()))
                .sum(),
        }
    }

    fn rewrite(&mut self, content: &[u8], backup: bool) -> Result<()> {
        let mut writer = match self.writer.take() {
            Some(mut writer) => {
                writer.flush()?;
                writer
            }
            None => CompressedStreamWriter::open(&self.path, self.options)?,
        };
        let backup_path = sibling(&self.path, BACKUP_SUFFIX);
        let result = writer.rewrite(
            content,
            &sibling(&self.path, TMP_SUFFIX),
            backup.then_some(backup_path.as_path()),
        );
        match result {
            Ok(()) => {
                if !self.frozen {
                    self.writer = Some(writer);
                }
                Ok(())
            }
            Err(e) => {
                drop(writer);
                if !self.frozen {
                    self.writer = CompressedStreamWriter::open(&self.path, self.options).ok();
                }
                Err(e)
            }
        }
    }

    pub fn replace(&mut self, content: &[u8], disable_backup: bool, span: &Span) -> Result<i64> {
        let old_size = self.disk_size();
        match self.rewrite(content, self.backup && !disable_backup) {
            Ok(()) => Ok(old_size as i64 - self.disk_size() as i64),
            Err(e) => {
                tracing::warn!(
                    parent: span,
                    path = ?self.path,
                    error = %e,
                    "Log replacement failed, reopening original"
                );
                if let Err(e) = remove_if_exists(&sibling(&self.path, TMP_SUFFIX)) {
                    tracing::warn!(
                        parent: span,
                        path = ?self.path,
                        error = %e,
                        "Failed to remove replacement file"
                    );
                }
                Ok(old_size as i64 - self.disk_size() as i64)
            }
        }
    }

    pub fn truncate(&mut self, position: u64, span: &Span) -> Result<()> {
        self.write_tail()?;
        let decoded = stream::read_stream(&self.path, self.options.engine)?;
        let boundary = record_boundary(&decoded.data, self.options.engine, position);
        self.rewrite(&decoded.data[..boundary], false)?;
        tracing::info!(
            parent: span,
            path = ?self.path,
            position,
            kept = boundary,
            "Truncated incomplete tail record"
        );
        Ok(())
    }

    pub fn remove_files(&mut self) -> Result<()> {
        self.frozen = true;
        self.writer = None;
        for suffix in ["", TAIL_SUFFIX, TMP_SUFFIX, BACKUP_SUFFIX] {
            remove_if_exists(&sibling(&self.path, suffix))?;
        }
        Ok(())
    }
}

struct TailWriter {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Block-compressed log written on the caller's thread.
///
/// Full blocks reach the primary file as they fill. The unfinished block is
/// persisted to `<path>.tail` by `flush`, on freeze, and by an optional
/// background tail writer every `tail_writer_interval`.
pub struct SyncCompressedWal {
    path: PathBuf,
    engine: Crc32Engine,
    log: Arc<Mutex<CompressedLog>>,
    tail_writer: Mutex<Option<TailWriter>>,
    span: Span,
}

impl std::fmt::Debug for SyncCompressedWal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCompressedWal")
            .field("path", &self.path)
            .finish()
    }
}

impl SyncCompressedWal {
    pub fn open(
        path: PathBuf,
        config: &WalConfig,
        engine: Crc32Engine,
        span: Span,
    ) -> Result<Self> {
        let log = CompressedLog::open(path.clone(), config, stream_options(config, engine))?;
        let log = Arc::new(Mutex::new(log));

        let tail_writer = if config.enable_tail_writer_job {
            Some(spawn_tail_writer(
                log.clone(),
                config.tail_writer_interval,
                span.clone(),
            )?)
        } else {
            None
        };

        Ok(Self {
            path,
            engine,
            log,
            tail_writer: Mutex::new(tail_writer),
            span,
        })
    }

    fn stop_tail_writer(&self) {
        if let Some(tail_writer) = self.tail_writer.lock().take() {
            drop(tail_writer.stop);
            if tail_writer.handle.join().is_err() {
                tracing::error!(parent: &self.span, path = ?self.path, "Tail writer panicked");
            }
        }
    }
}

fn spawn_tail_writer(
    log: Arc<Mutex<CompressedLog>>,
    interval: Duration,
    span: Span,
) -> Result<TailWriter> {
    let (stop, stopped) = bounded::<()>(1);
    let handle = std::thread::Builder::new()
        .name("wal-tail-writer".into())
        .spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = log.lock().write_tail() {
                        tracing::warn!(parent: &span, error = %e, "Tail write failed");
                    }
                }
                _ => break,
            }
        })?;
    Ok(TailWriter { stop, handle })
}

impl WriteAheadLog for SyncCompressedWal {
    fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, key: &[u8], value: &[u8], op_index: i64) -> Result<()> {
        let buf = record::encode(self.engine, key, value, op_index)?;
        self.log.lock().write(&buf)
    }

    fn read_log_entries(&self, options: ReadOptions) -> Result<LogEntries> {
        self.log.lock().read(options)
    }

    fn replace_write_ahead_log(
        &self,
        keys: &[Vec<u8>],
        values: &[Vec<u8>],
        disable_backup: bool,
    ) -> Result<i64> {
        let content = encode_replacement(self.engine, keys, values)?;
        self.log.lock().replace(&content, disable_backup, &self.span)
    }

    fn mark_frozen(&self) -> Result<()> {
        self.stop_tail_writer();
        self.log.lock().freeze()
    }

    fn truncate_incomplete_tail_record(&self, position: u64) -> Result<()> {
        self.log.lock().truncate(position, &self.span)
    }

    fn flush(&self) -> Result<()> {
        self.log.lock().flush()
    }

    fn drop_log(&self) -> Result<()> {
        self.stop_tail_writer();
        self.log.lock().remove_files()
    }
}

impl Drop for SyncCompressedWal {
    fn drop(&mut self) {
        self.stop_tail_writer();
        if let Err(e) = self.log.lock().flush() {
            tracing::warn!(parent: &self.span, path = ?self.path, error = %e, "Final flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurabilityMode;
    use tempfile::TempDir;

    #[test]
    fn test_tail_writer_persists_unfinished_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.wal");
        let config = WalConfig::default()
            .durability_mode(DurabilityMode::SyncCompressed)
            .compression_block_size(4096)
            .tail_writer_interval(Duration::from_millis(10));
        let wal = SyncCompressedWal::open(
            path.clone(),
            &config,
            Crc32Engine::detect().unwrap(),
            Span::none(),
        )
        .unwrap();

        wal.append(b"k", b"v", 0).unwrap();

        // Recovered from disk alone, as after a crash.
        let engine = Crc32Engine::detect().unwrap();
        let recovered = || {
            let decoded = stream::read_stream(&path, engine).unwrap();
            RecordReader::new(decoded.data.as_slice(), engine)
                .filter_map(|r| r.ok())
                .collect::<Vec<_>>()
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut records = recovered();
        while records.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
            records = recovered();
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, b"k");
        assert!(sibling(&path, TAIL_SUFFIX).exists());
    }

    #[test]
    fn test_frozen_log_rejects_appends_but_can_be_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.wal");
        let config = WalConfig::default()
            .durability_mode(DurabilityMode::SyncCompressed)
            .enable_tail_writer_job(false);
        let wal = SyncCompressedWal::open(
            path.clone(),
            &config,
            Crc32Engine::detect().unwrap(),
            Span::none(),
        )
        .unwrap();

        wal.append(b"a", b"1", 0).unwrap();
        wal.append(b"a", b"2", 1).unwrap();
        wal.mark_frozen().unwrap();
        assert!(matches!(wal.append(b"b", b"3", 2), Err(Error::LogFrozen(_))));
        assert!(!sibling(&path, TAIL_SUFFIX).exists());

        wal.replace_write_ahead_log(&[b"a".to_vec()], &[b"2".to_vec()], true)
            .unwrap();
        let entries = wal.read_log_entries(ReadOptions::default()).unwrap();
        assert_eq!(entries.keys, vec![b"a".to_vec()]);
        assert_eq!(entries.values, vec![b"2".to_vec()]);
    }
}
