use super::{
    super::Store,
    events::{DiskSegmentCreated, SegmentAdvanced, StoreEvents},
    filter::RangeFilter,
    iterator::{live_entries, EntryIterator, MergeIterator},
    recovery::{self, drop_merged_log, segment_path, wal_path},
    state::{LsmState, Segments},
};

use crate::{
    cache::now_ticks,
    config::StoreConfig,
    error::{Error, Result},
    flock::FileLock,
    hasher::Crc32Engine,
    segment::{tree_entries, DiskSegment, DiskSegmentWriter, MutableSegment, ReadOnlySegment},
    wal::{self, open_wal, stream::remove_if_exists},
};

use std::{
    fs,
    ops::{Bound, RangeBounds},
    sync::Arc,
    time::Duration,
};

use tracing::{debug, info, warn, Span};

const LOCK_FILE: &str = "LOCK";

type OwnedRange = (Bound<Vec<u8>>, Bound<Vec<u8>>);

/// LSM store over mutable, read-only and disk segments.
///
/// Writes go to the mutable segment. When it reaches
/// `mutable_segment_max_item_count` records it is frozen into a read-only
/// segment and a fresh one takes its place. [`LsmStore::start_merge`] folds
/// every read-only segment and the current disk segment into a new disk
/// segment. Merges are triggered by the [`Maintainer`](super::Maintainer),
/// or directly by callers that manage maintenance themselves.
pub struct LsmStore {
    pub(crate) config: StoreConfig,
    engine: Crc32Engine,
    state: LsmState,
    events: StoreEvents,
    _lock: FileLock,
    span: Span,
}

impl std::fmt::Debug for LsmStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let segments = self.state.snapshot();
        f.debug_struct("LsmStore")
            .field("dir", &self.config.dir)
            .field("mutable", &segments.mutable)
            .field("read_only", &segments.read_only.len())
            .field("disk", &segments.disk)
            .finish()
    }
}

impl LsmStore {
    /// Open store with default configuration
    pub fn open(dir: impl Into<std::path::PathBuf>) -> Result<Self> {
        Self::open_with_config(StoreConfig::new(dir), Span::none())
    }

    /// Opens or creates the store in `config.dir`. Log output is attached to
    /// `span`.
    pub fn open_with_config(config: StoreConfig, span: Span) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(config.dir.join(recovery::WAL_DIR))?;
        fs::create_dir_all(config.dir.join(recovery::DISK_DIR))?;

        let lock = FileLock::lock(config.dir.join(LOCK_FILE)).map_err(Error::LockError)?;
        let engine = Crc32Engine::detect()?;
        let state = recovery::recover_state(&config, engine, &span)?;

        info!(parent: &span, dir = ?config.dir, "Store opened");
        Ok(Self {
            config,
            engine,
            state,
            events: StoreEvents::new(),
            _lock: lock,
            span,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn events(&self) -> &StoreEvents {
        &self.events
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    fn write(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        loop {
            let mutable = self.state.mutable();

            match mutable.upsert_ordered(key, value, || self.state.next_op_index()) {
                Ok(_) => {
                    if mutable.len() >= self.config.mutable_segment_max_item_count {
                        self.advance_mutable_segment(&mutable)?;
                    }
                    return Ok(());
                }
                // Retry with the segment that replaced it
                Err(Error::Frozen) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Freezes the mutable segment even if it is not full. Returns false when
    /// it holds no records.
    pub fn move_mutable_to_read_only(&self) -> Result<bool> {
        let mutable = self.state.mutable();
        if mutable.is_empty() {
            return Ok(false);
        }
        self.advance_mutable_segment(&mutable)
    }

    /// Replaces `expected` with a fresh mutable segment, unless another
    /// writer already did.
    fn advance_mutable_segment(&self, expected: &Arc<MutableSegment>) -> Result<bool> {
        let frozen = self.state.update(|segments| -> Result<Option<Arc<ReadOnlySegment>>> {
            if !Arc::ptr_eq(&segments.mutable, expected) {
                return Ok(None);
            }

            let id = self.state.next_segment_id();
            let wal = open_wal(
                wal_path(&self.config.dir, id),
                &self.config.wal,
                self.engine,
                self.span.clone(),
            )?;
            let fresh = MutableSegment::new(
                id,
                wal,
                self.config.lock_mode,
                self.config.btree_node_size,
            );

            let frozen = match segments.mutable.freeze() {
                Ok(segment) => Arc::new(segment),
                Err(e) => {
                    if let Err(drop_err) = fresh.wal().drop_log() {
                        warn!(
                            parent: &self.span,
                            segment = id,
                            error = %drop_err,
                            "Failed to remove log of unused segment"
                        );
                    }
                    return Err(e);
                }
            };
            segments.mutable = Arc::new(fresh);
            segments.read_only.push(frozen.clone());
            Ok(Some(frozen))
        })?;

        let Some(segment) = frozen else {
            return Ok(false);
        };
        info!(
            parent: &self.span,
            segment = segment.id(),
            records = segment.len(),
            "Mutable segment moved to read-only"
        );
        self.events.emit_segment_advanced(SegmentAdvanced { segment });
        Ok(true)
    }

    pub fn read_only_record_count(&self) -> u64 {
        self.state.snapshot().read_only_record_count()
    }

    pub fn read_only_segment_count(&self) -> usize {
        self.state.snapshot().read_only.len()
    }

    pub fn mutable_record_count(&self) -> usize {
        self.state.mutable().len()
    }

    pub fn disk_segment(&self) -> Option<Arc<DiskSegment>> {
        self.state.snapshot().disk
    }

    pub fn is_merging(&self) -> bool {
        self.state.is_merging()
    }

    /// Merges all read-only segments and the disk segment into a new disk
    /// segment. Returns false if another merge is running or there is
    /// nothing to merge.
    pub fn start_merge(&self) -> Result<bool> {
        let Some(_guard) = self.state.try_start_merge() else {
            debug!(parent: &self.span, "Merge already in progress");
            return Ok(false);
        };

        let snapshot = self.state.snapshot();
        let Some(merged_id) = snapshot.read_only.last().map(|s| s.id()) else {
            return Ok(false);
        };

        let path = segment_path(&self.config.dir, merged_id);
        let disk = match self.write_disk_segment(&snapshot, &path, merged_id) {
            Ok(disk) => Arc::new(disk),
            Err(e) => {
                warn!(parent: &self.span, error = %e, "Merge failed");
                let tmp = wal::sibling(&path, wal::TMP_SUFFIX);
                if let Err(e) = remove_if_exists(&tmp) {
                    warn!(parent: &self.span, path = ?tmp, error = %e, "Failed to remove partial segment");
                }
                return Err(e);
            }
        };

        let (merged, previous) = self.state.update(|segments| {
            let merged: Vec<_> = segments
                .read_only
                .iter()
                .filter(|s| s.id() <= merged_id)
                .cloned()
                .collect();
            segments.read_only.retain(|s| s.id() > merged_id);
            let previous = segments.disk.replace(disk.clone());
            (merged, previous)
        });

        info!(
            parent: &self.span,
            segment = merged_id,
            merged = merged.len(),
            records = disk.record_count(),
            blocks = disk.block_count(),
            "Disk segment created"
        );
        self.events
            .emit_disk_segment_created(DiskSegmentCreated { segment: disk });

        for segment in &merged {
            drop_merged_log(segment, &self.span);
        }
        if let Some(previous) = previous {
            if let Err(e) = previous.drop_file() {
                warn!(parent: &self.span, file = ?previous.path(), error = %e, "Failed to delete old disk segment");
            }
        }
        Ok(true)
    }

    fn write_disk_segment(
        &self,
        snapshot: &Segments,
        path: &std::path::Path,
        merged_id: u64,
    ) -> Result<DiskSegment> {
        let mut sources: Vec<EntryIterator<'static>> = snapshot
            .read_only
            .iter()
            .rev()
            .map(|s| Box::new(tree_entries(s.cursor(), None)) as EntryIterator<'static>)
            .collect();
        if let Some(disk) = &snapshot.disk {
            sources.push(Box::new(
                disk.iter_from(Bound::Unbounded)?
                    .map(|entry| entry.map(|(key, value)| (key, Some(value)))),
            ));
        }

        let mut writer = DiskSegmentWriter::create(path, &self.config.disk, self.engine)?;
        // Older sources are folded in, so tombstones have nothing left to hide.
        for entry in live_entries(MergeIterator::new(sources)) {
            let (key, value) = entry?;
            writer.add(&key, &value)?;
        }
        let path = writer.finish(merged_id)?;
        DiskSegment::open(path, &self.config.disk, self.engine, self.span.clone())
    }

    /// Drops disk blocks nobody read within `lifetime`; returns how many.
    pub fn release_inactive_blocks(&self, lifetime: Duration) -> usize {
        let Some(disk) = self.disk_segment() else {
            return 0;
        };
        let ticks = now_ticks() - lifetime.as_millis() as i64;
        disk.release_inactive_blocks(ticks)
    }

    fn scan_sources(&self, range: &OwnedRange) -> Vec<EntryIterator<'static>> {
        let snapshot = self.state.snapshot();
        let start = match &range.0 {
            Bound::Included(key) | Bound::Excluded(key) => Some(key),
            Bound::Unbounded => None,
        };

        let mut sources: Vec<EntryIterator<'static>> = Vec::new();
        let trees = std::iter::once(snapshot.mutable.cursor())
            .chain(snapshot.read_only.iter().rev().map(|s| s.cursor()));
        for cursor in trees {
            sources.push(Box::new(RangeFilter::new(
                tree_entries(cursor, start),
                range.clone(),
            )));
        }

        if let Some(disk) = &snapshot.disk {
            let entries: EntryIterator<'static> = match disk.iter_from(range.0.as_ref()) {
                Ok(iter) => Box::new(iter.map(|entry| entry.map(|(key, value)| (key, Some(value))))),
                Err(e) => Box::new(std::iter::once(Err(e))),
            };
            sources.push(Box::new(RangeFilter::new(entries, range.clone())));
        }
        sources
    }
}

/// Iterator returned by [`LsmStore::scan`]. It owns its sources and does not
/// block writers.
pub struct LsmScanIterator {
    inner: Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + Send>,
}

impl Iterator for LsmScanIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl Store for LsmStore {
    type ScanIterator<'a> = LsmScanIterator;

    fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.write(key, Some(value.as_slice()))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.write(key, None)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let segments = self.state.snapshot();

        if let Some(value) = segments.mutable.get(key) {
            return Ok(value);
        }
        // Newest first
        for segment in segments.read_only.iter().rev() {
            if let Some(value) = segment.get(key) {
                return Ok(value);
            }
        }
        match &segments.disk {
            Some(disk) => disk.get(key),
            None => Ok(None),
        }
    }

    fn scan<'a>(
        &'a self,
        range: impl RangeBounds<Vec<u8>> + Clone + Send + Sync + 'a,
    ) -> Self::ScanIterator<'a> {
        let range: OwnedRange = (range.start_bound().cloned(), range.end_bound().cloned());
        let sources = self.scan_sources(&range);
        LsmScanIterator {
            inner: Box::new(live_entries(MergeIterator::new(sources))),
        }
    }

    fn sync(&self) -> Result<()> {
        self.state.mutable().sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DurabilityMode, WalConfig};
    use tempfile::TempDir;

    const DURABLE_MODES: [DurabilityMode; 3] = [
        DurabilityMode::Sync,
        DurabilityMode::SyncCompressed,
        DurabilityMode::AsyncCompressed,
    ];

    fn config(dir: &TempDir, mode: DurabilityMode) -> StoreConfig {
        StoreConfig::new(dir.path())
            .mutable_segment_max_item_count(10)
            .btree_node_size(4)
            .wal(WalConfig::default().durability_mode(mode))
    }

    fn open(config: &StoreConfig) -> LsmStore {
        LsmStore::open_with_config(config.clone(), Span::none()).expect("Failed to open store")
    }

    fn key(i: usize) -> Vec<u8> {
        format!("key_{:04}", i).into_bytes()
    }

    fn collect(iter: LsmScanIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
        iter.collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_set_get_delete() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = open(&config(&dir, DurabilityMode::Sync));

        store.set(b"a", b"1".to_vec())?;
        store.set(b"b", b"2".to_vec())?;
        store.set(b"a", b"3".to_vec())?;
        store.delete(b"b")?;
        store.delete(b"never")?;

        assert_eq!(store.get(b"a")?, Some(b"3".to_vec()));
        assert_eq!(store.get(b"b")?, None);
        assert_eq!(store.get(b"c")?, None);
        Ok(())
    }

    #[test]
    fn test_segments_advance_at_item_count() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = open(&config(&dir, DurabilityMode::Sync));

        for i in 0..25 {
            store.set(&key(i), b"v".to_vec())?;
        }
        assert_eq!(store.read_only_segment_count(), 2);
        assert_eq!(store.read_only_record_count(), 20);
        assert_eq!(store.mutable_record_count(), 5);

        assert!(store.move_mutable_to_read_only()?);
        assert!(!store.move_mutable_to_read_only()?);
        assert_eq!(store.read_only_record_count(), 25);

        for i in 0..25 {
            assert_eq!(store.get(&key(i))?, Some(b"v".to_vec()));
        }
        Ok(())
    }

    #[test]
    fn test_newer_segments_shadow_older() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = open(&config(&dir, DurabilityMode::Sync));

        for i in 0..10 {
            store.set(&key(i), b"disk".to_vec())?;
        }
        assert!(store.start_merge()?);

        for i in 0..10 {
            store.set(&key(i), b"read-only".to_vec())?;
        }
        store.set(&key(3), b"mutable".to_vec())?;
        store.delete(&key(4))?;

        assert_eq!(store.get(&key(3))?, Some(b"mutable".to_vec()));
        assert_eq!(store.get(&key(4))?, None);
        assert_eq!(store.get(&key(5))?, Some(b"read-only".to_vec()));

        let scanned = collect(store.scan(..));
        assert_eq!(scanned.len(), 9);
        assert_eq!(scanned[3], (key(3), b"mutable".to_vec()));
        assert_eq!(scanned[4], (key(5), b"read-only".to_vec()));
        Ok(())
    }

    #[test]
    fn test_scan_ranges_and_prefix() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = open(&config(&dir, DurabilityMode::Sync));

        for i in 0..35 {
            store.set(&key(i), i.to_string().into_bytes())?;
            if i == 15 {
                assert!(store.start_merge()?);
            }
        }

        let keys = |iter: LsmScanIterator| -> Vec<Vec<u8>> {
            collect(iter).into_iter().map(|(k, _)| k).collect()
        };
        assert_eq!(keys(store.scan(key(5)..key(8))), vec![key(5), key(6), key(7)]);
        assert_eq!(
            keys(store.scan((Bound::Excluded(key(9)), Bound::Included(key(11))))),
            vec![key(10), key(11)]
        );
        assert_eq!(keys(store.scan(key(33)..)), vec![key(33), key(34)]);
        assert_eq!(keys(store.scan(..)).len(), 35);
        assert_eq!(keys(store.scan_prefix(b"key_001")).len(), 10);
        assert!(keys(store.scan_prefix(b"nope")).is_empty());
        Ok(())
    }

    #[test]
    fn test_scan_is_isolated_from_later_segment_changes() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = open(&config(&dir, DurabilityMode::Sync));
        for i in 0..20 {
            store.set(&key(i), b"v".to_vec())?;
        }

        let mut iter = store.scan(..);
        assert_eq!(iter.next().unwrap()?.0, key(0));
        assert!(store.start_merge()?);
        assert_eq!(iter.count(), 19);
        Ok(())
    }

    #[test]
    fn test_merge_folds_segments_and_drops_logs() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = open(&config(&dir, DurabilityMode::Sync));

        for i in 0..30 {
            store.set(&key(i), b"v".to_vec())?;
        }
        store.delete(&key(0))?;
        store.move_mutable_to_read_only()?;
        let merged = store.read_only_segment_count();
        assert_eq!(merged, 4);

        assert!(store.start_merge()?);
        let disk = store.disk_segment().unwrap();
        assert_eq!(disk.record_count(), 29);
        assert_eq!(store.read_only_segment_count(), 0);
        assert!(!store.start_merge()?);

        // Only the mutable segment's log remains.
        let logs = fs::read_dir(dir.path().join(recovery::WAL_DIR))?.count();
        assert_eq!(logs, 1);

        // A second merge replaces the disk segment file.
        let first = disk.path().to_path_buf();
        store.set(b"z", b"last".to_vec())?;
        store.move_mutable_to_read_only()?;
        assert!(store.start_merge()?);
        assert!(!first.exists());
        assert_eq!(store.disk_segment().unwrap().record_count(), 30);
        assert_eq!(store.get(b"z")?, Some(b"last".to_vec()));
        assert_eq!(store.get(&key(0))?, None);
        Ok(())
    }

    #[test]
    fn test_reopen_recovers_every_stage() -> Result<()> {
        for mode in DURABLE_MODES {
            let dir = TempDir::new().unwrap();
            let config = config(&dir, mode);
            {
                let store = open(&config);
                for i in 0..20 {
                    store.set(&key(i), b"old".to_vec())?;
                }
                store.start_merge()?;
                for i in 10..35 {
                    store.set(&key(i), b"new".to_vec())?;
                }
                store.delete(&key(1))?;
                store.sync()?;
            }

            let store = open(&config);
            assert_eq!(store.get(&key(0))?, Some(b"old".to_vec()), "{:?}", mode);
            assert_eq!(store.get(&key(1))?, None, "{:?}", mode);
            assert_eq!(store.get(&key(15))?, Some(b"new".to_vec()), "{:?}", mode);
            assert_eq!(store.get(&key(34))?, Some(b"new".to_vec()), "{:?}", mode);
            assert_eq!(collect(store.scan(..)).len(), 34, "{:?}", mode);

            // Writes after recovery are ordered after the recovered ones.
            store.set(&key(34), b"newest".to_vec())?;
            drop(store);
            let store = open(&config);
            assert_eq!(store.get(&key(34))?, Some(b"newest".to_vec()), "{:?}", mode);
        }
        Ok(())
    }

    #[test]
    fn test_null_durability_starts_empty() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, DurabilityMode::Null);
        {
            let store = open(&config);
            store.set(b"a", b"1".to_vec())?;
            assert_eq!(store.get(b"a")?, Some(b"1".to_vec()));
        }
        let store = open(&config);
        assert_eq!(store.get(b"a")?, None);
        Ok(())
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, DurabilityMode::Sync);
        let _store = open(&config);
        assert!(matches!(
            LsmStore::open_with_config(config, Span::none()),
            Err(Error::LockError(_))
        ));
    }

    #[test]
    fn test_compact_on_load_collapses_duplicates() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, DurabilityMode::Sync).mutable_segment_max_item_count(100);
        {
            let store = open(&config);
            for round in 0..5 {
                for i in 0..4 {
                    store.set(&key(i), format!("v{}", round).into_bytes())?;
                }
            }
        }
        let log = wal_path(&config.dir, 1);
        let before = fs::metadata(&log)?.len();

        config.wal.compact_on_load = true;
        let store = open(&config);
        assert!(fs::metadata(&log)?.len() < before);
        assert_eq!(store.get(&key(2))?, Some(b"v4".to_vec()));

        store.set(&key(2), b"after".to_vec())?;
        drop(store);
        let store = open(&config);
        assert_eq!(store.get(&key(2))?, Some(b"after".to_vec()));
        Ok(())
    }

    #[test]
    fn test_recovery_truncates_torn_tail() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, DurabilityMode::Sync);
        {
            let store = open(&config);
            store.set(b"a", b"1".to_vec())?;
            store.set(b"b", b"2".to_vec())?;
        }
        let log = wal_path(&config.dir, 1);
        let len = fs::metadata(&log)?.len();
        fs::OpenOptions::new().write(true).open(&log)?.set_len(len - 3)?;

        let store = open(&config);
        assert_eq!(store.get(b"a")?, Some(b"1".to_vec()));
        assert_eq!(store.get(b"b")?, None);
        store.set(b"c", b"3".to_vec())?;
        drop(store);

        let store = open(&config);
        assert_eq!(store.get(b"c")?, Some(b"3".to_vec()));
        Ok(())
    }

    #[test]
    fn test_events_fire_for_advance_and_merge() -> Result<()> {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = TempDir::new().unwrap();
        let store = open(&config(&dir, DurabilityMode::Sync));
        let advanced = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));

        let counter = advanced.clone();
        let id = store.events().on_segment_advanced(move |event| {
            assert_eq!(event.segment.len(), 10);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = created.clone();
        store.events().on_disk_segment_created(move |event| {
            counter.fetch_add(event.segment.record_count() as usize, Ordering::SeqCst);
        });

        for i in 0..20 {
            store.set(&key(i), b"v".to_vec())?;
        }
        store.start_merge()?;
        assert_eq!(advanced.load(Ordering::SeqCst), 2);
        assert_eq!(created.load(Ordering::SeqCst), 20);

        assert!(store.events().unsubscribe(id));
        for i in 20..30 {
            store.set(&key(i), b"v".to_vec())?;
        }
        assert_eq!(advanced.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn test_concurrent_writers() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open(&config(&dir, DurabilityMode::Sync)));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store.set(&key(t * 100 + i), b"v".to_vec()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(collect(store.scan(..)).len(), 200);
        let total = store.read_only_record_count() as usize + store.mutable_record_count();
        assert_eq!(total, 200);
        Ok(())
    }

    #[test]
    fn test_concurrent_writes_to_hot_keys_survive_reopen() -> Result<()> {
        for mode in [DurabilityMode::Sync, DurabilityMode::AsyncCompressed] {
            let dir = TempDir::new().unwrap();
            let config = config(&dir, mode);
            let live = {
                let store = open(&config);
                std::thread::scope(|s| {
                    for t in 0..4usize {
                        let store = &store;
                        s.spawn(move || {
                            for i in 0..60usize {
                                let value = format!("{}-{}", t, i).into_bytes();
                                store.set(&key(i % 3), value).unwrap();
                                // Distinct keys keep the mutable segment advancing.
                                store.set(&key(100 + t * 100 + i), b"v".to_vec()).unwrap();
                            }
                        });
                    }
                });
                store.sync()?;
                (0..3).map(|i| store.get(&key(i))).collect::<Result<Vec<_>>>()?
            };

            let store = open(&config);
            let recovered = (0..3).map(|i| store.get(&key(i))).collect::<Result<Vec<_>>>()?;
            assert!(live.iter().all(Option::is_some), "{:?}", mode);
            assert_eq!(recovered, live, "{:?}", mode);
        }
        Ok(())
    }
}
