use std::path::{Path, PathBuf};

use super::{LogEntries, ReadOptions, WriteAheadLog};
use crate::error::Result;

/// Log for segments that never need to survive a restart.
#[derive(Debug)]
pub struct NullWal {
    path: PathBuf,
}

impl NullWal {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl WriteAheadLog for NullWal {
    fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, _key: &[u8], _value: &[u8], _op_index: i64) -> Result<()> {
        Ok(())
    }

    fn read_log_entries(&self, _options: ReadOptions) -> Result<LogEntries> {
        Ok(LogEntries::empty())
    }

    fn replace_write_ahead_log(
        &self,
        _keys: &[Vec<u8>],
        _values: &[Vec<u8>],
        _disable_backup: bool,
    ) -> Result<i64> {
        Ok(0)
    }

    fn mark_frozen(&self) -> Result<()> {
        Ok(())
    }

    fn truncate_incomplete_tail_record(&self, _position: u64) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn drop_log(&self) -> Result<()> {
        Ok(())
    }
}
