use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn, Span};

use super::maintainer::sparse_array_len;
use super::state::{LsmState, Segments};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::hasher::Crc32Engine;
use crate::segment::{encode_value, DiskSegment, MutableSegment, ReadOnlySegment};
use crate::wal::{self, open_wal, ReadOptions, WriteAheadLog};

pub(crate) const WAL_DIR: &str = "wal";
pub(crate) const DISK_DIR: &str = "disk";
const WAL_EXTENSION: &str = "wal";
const SEGMENT_EXTENSION: &str = "seg";

pub(crate) fn wal_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(WAL_DIR).join(format!("{:08}.{}", id, WAL_EXTENSION))
}

pub(crate) fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(DISK_DIR).join(format!("{:08}.{}", id, SEGMENT_EXTENSION))
}

/// Lists `<id>.<extension>` files in `dir`, sorted by id.
fn list_numbered(dir: &Path, extension: &str) -> Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some(extension) {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            files.push((id, path));
        }
    }
    files.sort_by_key(|(id, _)| *id);
    Ok(files)
}

/// Rebuilds the store from its directory: the newest disk segment plus every
/// log written after the segments it absorbed.
pub(crate) fn recover_state(config: &StoreConfig, engine: Crc32Engine, span: &Span) -> Result<LsmState> {
    let dir = &config.dir;
    let disk = recover_disk_segment(config, engine, span)?;
    let merged_id = disk.as_ref().map_or(0, |d| d.merged_segment_id());

    let mut live = Vec::new();
    let mut max_id = merged_id;
    for (id, path) in list_numbered(&dir.join(WAL_DIR), WAL_EXTENSION)? {
        max_id = max_id.max(id);
        if id <= merged_id {
            // Absorbed by the disk segment before the log could be deleted.
            info!(parent: span, wal = ?path, "Removing merged write-ahead log");
            open_wal(&path, &config.wal, engine, span.clone())?.drop_log()?;
        } else {
            live.push((id, path));
        }
    }

    let mut read_only = Vec::new();
    let mut mutable = None;
    let mut max_op_index = -1;
    let last = live.len().checked_sub(1);
    for (i, (id, path)) in live.into_iter().enumerate() {
        let segment = recover_segment(id, &path, config, engine, span)?;
        max_op_index = max_op_index.max(segment.max_op_index());
        if Some(i) == last {
            mutable = Some(segment);
        } else {
            read_only.push(Arc::new(segment.freeze()?));
        }
    }

    let mutable = match mutable {
        Some(segment) => segment,
        None => {
            max_id += 1;
            let wal = open_wal(wal_path(dir, max_id), &config.wal, engine, span.clone())?;
            MutableSegment::new(max_id, wal, config.lock_mode, config.btree_node_size)
        }
    };
    let next_segment_id = mutable.id() + 1;

    info!(
        parent: span,
        read_only = read_only.len(),
        disk_records = disk.as_ref().map_or(0, |d| d.record_count()),
        mutable_records = mutable.len(),
        "Recovery completed"
    );

    let segments = Segments {
        mutable: Arc::new(mutable),
        read_only,
        disk,
    };
    Ok(LsmState::new(segments, next_segment_id, max_op_index + 1))
}

/// Opens the newest disk segment and removes older generations and
/// unfinished merge output.
fn recover_disk_segment(
    config: &StoreConfig,
    engine: Crc32Engine,
    span: &Span,
) -> Result<Option<Arc<DiskSegment>>> {
    let disk_dir = config.dir.join(DISK_DIR);
    for entry in fs::read_dir(&disk_dir)? {
        let path = entry?.path();
        if path.to_string_lossy().ends_with(wal::TMP_SUFFIX) {
            warn!(parent: span, file = ?path, "Removing unfinished disk segment");
            fs::remove_file(&path)?;
        }
    }

    let mut segments = list_numbered(&disk_dir, SEGMENT_EXTENSION)?;
    let Some((_, newest)) = segments.pop() else {
        return Ok(None);
    };
    for (_, stale) in segments {
        info!(parent: span, file = ?stale, "Removing superseded disk segment");
        fs::remove_file(&stale)?;
    }

    let segment = DiskSegment::open(&newest, &config.disk, engine, span.clone())?;
    segment.init_sparse_array(sparse_array_len(segment.record_count(), &config.maintenance))?;
    Ok(Some(Arc::new(segment)))
}

/// Replays one log, repairing what the configured policy allows.
fn recover_segment(
    id: u64,
    path: &Path,
    config: &StoreConfig,
    engine: Crc32Engine,
    span: &Span,
) -> Result<MutableSegment> {
    let wal = open_wal(path, &config.wal, engine, span.clone())?;
    let options = ReadOptions::new(false, config.wal.stop_on_checksum_failure, true);
    let (segment, entries) = MutableSegment::recover(
        id,
        wal.clone(),
        config.lock_mode,
        config.btree_node_size,
        options,
    )?;

    if entries.has_checksum_failures() {
        if config.wal.stop_on_checksum_failure {
            return Err(Error::Recovery {
                path: path.to_path_buf(),
                reason: format!("{} unreadable records", entries.errors.len()),
            });
        }
        warn!(
            parent: span,
            wal = ?path,
            skipped = entries.errors.len(),
            "Skipped records with checksum failures"
        );
    }

    if let Some(position) = entries.truncation_point() {
        warn!(parent: span, wal = ?path, position, "Truncating incomplete tail record");
        wal.truncate_incomplete_tail_record(position)?;
    }

    if config.wal.compact_on_load && entries.len() > segment.len() {
        compact_log(&segment, wal.as_ref(), span)?;
    }

    Ok(segment)
}

/// Rewrites a log with one record per key.
fn compact_log(segment: &MutableSegment, wal: &dyn WriteAheadLog, span: &Span) -> Result<()> {
    let (keys, values): (Vec<Vec<u8>>, Vec<Vec<u8>>) = segment
        .cursor()
        .map(|(key, value)| (key, encode_value(value.as_deref())))
        .unzip();
    let reclaimed = wal.replace_write_ahead_log(&keys, &values, false)?;
    info!(
        parent: span,
        wal = ?wal.path(),
        records = keys.len(),
        reclaimed,
        "Compacted write-ahead log on load"
    );
    Ok(())
}

/// Deletes a read-only segment's log, logging instead of failing.
pub(crate) fn drop_merged_log(segment: &ReadOnlySegment, span: &Span) {
    if let Err(e) = segment.drop_log() {
        warn!(parent: span, segment = segment.id(), error = %e, "Failed to delete merged write-ahead log");
    }
}
