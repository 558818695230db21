use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::Span;

use super::record::{self, RecordReader};
use super::stream::{remove_if_exists, sync_parent_dir};
use super::{
    encode_replacement, sibling, LogEntries, ReadOptions, WriteAheadLog, BACKUP_SUFFIX,
    TAIL_SUFFIX, TMP_SUFFIX,
};
use crate::config::WalConfig;
use crate::error::{Error, Result};
use crate::hasher::Crc32Engine;

/// Uncompressed log that fsyncs every record before `append` returns.
pub struct SyncWal {
    path: PathBuf,
    engine: Crc32Engine,
    backup: bool,
    state: Mutex<SyncState>,
    span: Span,
}

struct SyncState {
    writer: Option<BufWriter<File>>,
    frozen: bool,
}

impl std::fmt::Debug for SyncWal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWal")
            .field("path", &self.path)
            .field("frozen", &self.state.try_lock().map(|s| s.frozen))
            .finish()
    }
}

impl SyncWal {
    pub fn open(path: PathBuf, config: &WalConfig, engine: Crc32Engine, span: Span) -> Result<Self> {
        let writer = open_writer(&path)?;
        Ok(Self {
            path,
            engine,
            backup: config.enable_incremental_backup,
            state: Mutex::new(SyncState {
                writer: Some(writer),
                frozen: false,
            }),
            span,
        })
    }

    fn file_len(&self) -> u64 {
        fs::metadata(&self.path).map_or(0, |m| m.len())
    }

    fn try_replace(&self, state: &mut SyncState, content: &[u8], backup: bool) -> Result<()> {
        if let Some(mut writer) = state.writer.take() {
            writer.flush()?;
        }

        let tmp_path = sibling(&self.path, TMP_SUFFIX);
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(content)?;
        tmp.sync_all()?;
        drop(tmp);

        if backup {
            let mut out = OpenOptions::new()
                .create(true)
                .append(true)
                .open(sibling(&self.path, BACKUP_SUFFIX))?;
            out.write_all(&fs::read(&self.path)?)?;
            out.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path)?;

        if !state.frozen {
            state.writer = Some(open_writer(&self.path)?);
        }
        Ok(())
    }
}

fn open_writer(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

impl WriteAheadLog for SyncWal {
    fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, key: &[u8], value: &[u8], op_index: i64) -> Result<()> {
        let buf = record::encode(self.engine, key, value, op_index)?;

        let mut state = self.state.lock();
        let writer = match state.writer.as_mut() {
            Some(writer) => writer,
            None => return Err(Error::LogFrozen(self.path.clone())),
        };
        writer.write_all(&buf)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn read_log_entries(&self, options: ReadOptions) -> Result<LogEntries> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LogEntries::empty()),
            Err(e) => return Err(e.into()),
        };
        let reader = RecordReader::new(BufReader::new(file), self.engine);
        Ok(LogEntries::collect(reader, options))
    }

    fn replace_write_ahead_log(
        &self,
        keys: &[Vec<u8>],
        values: &[Vec<u8>],
        disable_backup: bool,
    ) -> Result<i64> {
        let content = encode_replacement(self.engine, keys, values)?;

        let mut state = self.state.lock();
        let old_len = self.file_len();
        match self.try_replace(&mut state, &content, self.backup && !disable_backup) {
            Ok(()) => Ok(old_len as i64 - content.len() as i64),
            Err(e) => {
                tracing::warn!(
                    parent: &self.span,
                    path = ?self.path,
                    error = %e,
                    "Log replacement failed, keeping original"
                );
                if let Err(e) = remove_if_exists(&sibling(&self.path, TMP_SUFFIX)) {
                    tracing::warn!(
                        parent: &self.span,
                        path = ?self.path,
                        error = %e,
                        "Failed to remove replacement file"
                    );
                }
                if !state.frozen && state.writer.is_none() {
                    state.writer = Some(open_writer(&self.path)?);
                }
                Ok(old_len as i64 - self.file_len() as i64)
            }
        }
    }

    fn mark_frozen(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.frozen = true;
        if let Some(mut writer) = state.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn truncate_incomplete_tail_record(&self, position: u64) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(mut writer) = state.writer.take() {
            writer.flush()?;
        }
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(position)?;
        file.sync_all()?;
        drop(file);

        tracing::info!(
            parent: &self.span,
            path = ?self.path,
            position,
            "Truncated incomplete tail record"
        );
        if !state.frozen {
            state.writer = Some(open_writer(&self.path)?);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn drop_log(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.frozen = true;
        state.writer = None;
        for suffix in ["", TAIL_SUFFIX, TMP_SUFFIX, BACKUP_SUFFIX] {
            remove_if_exists(&sibling(&self.path, suffix))?;
        }
        Ok(())
    }
}
