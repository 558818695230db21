use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Span};

use super::events::SubscriptionId;
use super::store::LsmStore;
use super::tasks::BlockReleaseTask;
use crate::config::MaintenanceConfig;
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::segment::DiskSegment;

/// Sparse array length for a disk segment of `record_count` records:
/// one entry per `step` records, at least `minimum`, never more than one
/// per record.
pub fn sparse_array_len(record_count: u64, config: &MaintenanceConfig) -> usize {
    let len = usize::try_from(record_count).unwrap_or(usize::MAX);
    let step = config.sparse_array_step_length.max(1);
    len.min((len / step).max(config.minimum_sparse_array_length))
}

/// Background maintenance for one store.
///
/// Listens to the store's events: once the read-only segments hold more than
/// `merge_threshold_record_count` records a merge is started on the
/// runtime's blocking pool, and every new disk segment gets its sparse array.
/// When `inactive_block_cache_cleanup_interval` is set, a scheduled task
/// releases idle cached blocks.
pub struct Maintainer {
    store: Arc<LsmStore>,
    config: MaintenanceConfig,
    runtime: Handle,
    merges: Mutex<Vec<JoinHandle<Result<bool>>>>,
    merges_started: AtomicUsize,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    scheduler: Option<Scheduler>,
    span: Span,
}

impl Maintainer {
    pub fn new(store: Arc<LsmStore>, runtime: Handle, span: Span) -> Arc<Self> {
        let config = store.config().maintenance.clone();

        let scheduler = config.inactive_block_cache_cleanup_interval.map(|interval| {
            let scheduler = Scheduler::new(runtime.clone(), span.clone());
            scheduler.register(Arc::new(BlockReleaseTask::new(
                store.clone(),
                interval,
                config.disk_segment_block_lifetime,
            )));
            scheduler
        });

        let maintainer = Arc::new_cyclic(|weak: &Weak<Maintainer>| {
            let maintainer = weak.clone();
            let advanced = store.events().on_segment_advanced(move |_| {
                if let Some(maintainer) = maintainer.upgrade() {
                    maintainer.on_segment_advanced();
                }
            });
            let maintainer = weak.clone();
            let created = store.events().on_disk_segment_created(move |event| {
                if let Some(maintainer) = maintainer.upgrade() {
                    maintainer.on_disk_segment_created(&event.segment);
                }
            });

            Self {
                store,
                config,
                runtime,
                merges: Mutex::new(Vec::new()),
                merges_started: AtomicUsize::new(0),
                subscriptions: Mutex::new(vec![advanced, created]),
                scheduler,
                span,
            }
        });
        // Segments recovered at open may already exceed the threshold.
        maintainer.on_segment_advanced();
        maintainer
    }

    fn on_segment_advanced(&self) {
        let records = self.store.read_only_record_count();
        if records > self.config.merge_threshold_record_count {
            debug!(parent: &self.span, records, "Merge threshold exceeded");
            self.start_merge();
        }
    }

    fn on_disk_segment_created(&self, segment: &DiskSegment) {
        let len = sparse_array_len(segment.record_count(), &self.config);
        if let Err(e) = segment.init_sparse_array(len) {
            warn!(parent: &self.span, file = ?segment.path(), error = %e, "Failed to build sparse array");
        }
    }

    /// Starts a merge in the background. A merge that finds another one
    /// running returns without doing anything.
    pub fn start_merge(&self) {
        let store = self.store.clone();
        let span = self.span.clone();
        let handle = self.runtime.spawn_blocking(move || {
            let result = store.start_merge();
            if let Err(e) = &result {
                error!(parent: &span, error = %e, "Background merge failed");
            }
            result
        });

        let mut merges = self.merges.lock();
        merges.retain(|merge| !merge.is_finished());
        merges.push(handle);
        self.merges_started.fetch_add(1, Ordering::SeqCst);
    }

    pub fn merges_started(&self) -> usize {
        self.merges_started.load(Ordering::SeqCst)
    }

    pub fn running_merges(&self) -> usize {
        self.merges
            .lock()
            .iter()
            .filter(|merge| !merge.is_finished())
            .count()
    }

    /// Waits for every merge started so far, including ones started while
    /// waiting. Returns the first merge failure after all have finished.
    pub async fn complete_running_tasks(&self) -> Result<()> {
        let mut first_error = None;
        loop {
            let pending = std::mem::take(&mut *self.merges.lock());
            if pending.is_empty() {
                break;
            }
            for merge in pending {
                let result = match merge.await {
                    Ok(result) => result.map(|_| ()),
                    Err(e) => Err(Error::Task(format!("merge task: {}", e))),
                };
                if let Err(e) = result {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stops reacting to store events and stops the block release task.
    /// Merges already running are left to finish.
    pub fn dispose(&self) {
        for id in self.subscriptions.lock().drain(..) {
            self.store.events().unsubscribe(id);
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop();
        }
    }

    /// Disposes, then waits for the block release task and running merges.
    pub async fn shutdown(&self) -> Result<()> {
        self.dispose();
        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown().await?;
        }
        self.complete_running_tasks().await
    }
}

impl Drop for Maintainer {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DurabilityMode, StoreConfig, WalConfig};
    use crate::store::Store;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, maintenance: MaintenanceConfig) -> Arc<LsmStore> {
        let config = StoreConfig::new(dir.path())
            .mutable_segment_max_item_count(10)
            .wal(WalConfig::default().durability_mode(DurabilityMode::Sync))
            .maintenance(maintenance);
        Arc::new(LsmStore::open_with_config(config, Span::none()).unwrap())
    }

    fn write(store: &LsmStore, keys: std::ops::Range<usize>) {
        for i in keys {
            store
                .set(format!("key_{:04}", i).as_bytes(), b"value".to_vec())
                .unwrap();
        }
    }

    #[test]
    fn test_sparse_array_len() {
        let config = MaintenanceConfig::default()
            .minimum_sparse_array_length(1_000)
            .sparse_array_step_length(1_000);
        assert_eq!(sparse_array_len(0, &config), 0);
        assert_eq!(sparse_array_len(500, &config), 500);
        assert_eq!(sparse_array_len(10_000, &config), 1_000);
        assert_eq!(sparse_array_len(5_000_000, &config), 5_000);

        let config = config.minimum_sparse_array_length(0);
        assert_eq!(sparse_array_len(999, &config), 0);
        assert_eq!(sparse_array_len(2_500, &config), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_merge_starts_above_threshold() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = open_store(
            &dir,
            MaintenanceConfig::default().merge_threshold_record_count(25),
        );
        let maintainer = Maintainer::new(store.clone(), Handle::current(), Span::none());

        // 20 read-only records do not exceed the threshold.
        write(&store, 0..20);
        assert_eq!(store.read_only_record_count(), 20);
        assert_eq!(maintainer.merges_started(), 0);

        write(&store, 20..30);
        assert_eq!(maintainer.merges_started(), 1);

        maintainer.complete_running_tasks().await?;
        assert_eq!(maintainer.running_merges(), 0);
        assert_eq!(store.read_only_record_count(), 0);

        let disk = store.disk_segment().expect("merge should publish a disk segment");
        assert_eq!(disk.record_count(), 30);
        assert_eq!(disk.sparse_array_len(), 30);
        assert_eq!(store.get(b"key_0029")?, Some(b"value".to_vec()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recovered_segments_above_threshold_are_merged() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let maintenance = MaintenanceConfig::default().merge_threshold_record_count(25);
        {
            let store = open_store(&dir, maintenance.clone());
            write(&store, 0..30);
            assert_eq!(store.read_only_record_count(), 30);
        }

        let store = open_store(&dir, maintenance);
        assert_eq!(store.read_only_record_count(), 30);
        let maintainer = Maintainer::new(store.clone(), Handle::current(), Span::none());
        assert_eq!(maintainer.merges_started(), 1);

        maintainer.complete_running_tasks().await?;
        assert_eq!(store.read_only_record_count(), 0);
        assert_eq!(store.disk_segment().map(|d| d.record_count()), Some(30));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recovered_segments_below_threshold_wait() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let maintenance = MaintenanceConfig::default().merge_threshold_record_count(25);
        {
            let store = open_store(&dir, maintenance.clone());
            write(&store, 0..20);
        }

        let store = open_store(&dir, maintenance);
        let maintainer = Maintainer::new(store.clone(), Handle::current(), Span::none());
        assert_eq!(maintainer.merges_started(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_completed_merges_are_pruned() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, MaintenanceConfig::default().merge_threshold_record_count(5));
        let maintainer = Maintainer::new(store.clone(), Handle::current(), Span::none());

        for round in 0..5 {
            write(&store, round * 10..round * 10 + 10);
            maintainer.complete_running_tasks().await?;
        }
        assert_eq!(maintainer.merges_started(), 5);
        assert!(maintainer.merges.lock().is_empty());

        maintainer.start_merge();
        maintainer.start_merge();
        assert!(maintainer.merges.lock().len() <= 2);
        maintainer.complete_running_tasks().await?;
        assert_eq!(store.disk_segment().unwrap().record_count(), 50);
        Ok(())
    }

    #[tokio::test]
    async fn test_dispose_unsubscribes() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, MaintenanceConfig::default().merge_threshold_record_count(5));

        let maintainer = Maintainer::new(store.clone(), Handle::current(), Span::none());
        assert_eq!(store.events().listener_count(), 2);
        maintainer.dispose();
        assert_eq!(store.events().listener_count(), 0);

        write(&store, 0..30);
        assert_eq!(maintainer.merges_started(), 0);
        maintainer.complete_running_tasks().await?;

        let other = Maintainer::new(store.clone(), Handle::current(), Span::none());
        assert_eq!(store.events().listener_count(), 2);
        drop(other);
        assert_eq!(store.events().listener_count(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inactive_blocks_are_released() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = open_store(
            &dir,
            MaintenanceConfig::default()
                .inactive_block_cache_cleanup_interval(Some(Duration::from_millis(10)))
                .disk_segment_block_lifetime(Duration::ZERO),
        );
        let maintainer = Maintainer::new(store.clone(), Handle::current(), Span::none());

        write(&store, 0..10);
        assert!(store.start_merge()?);
        let disk = store.disk_segment().unwrap();

        assert!(store.get(b"key_0003")?.is_some());
        let (_, misses) = disk.cache().stats();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get(b"key_0003")?.is_some());
        let (_, misses_after) = disk.cache().stats();
        assert!(misses_after > misses);

        maintainer.shutdown().await
    }
}
