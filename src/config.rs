use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::btree::LockMode;
use crate::compression::CompressionMethod;
use crate::error::{Error, Result};

/// Configuration for the store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Record count at which the mutable segment is frozen (default: 100_000)
    pub mutable_segment_max_item_count: usize,

    /// Concurrency control for the mutable segment's B-tree
    pub lock_mode: LockMode,

    /// Maximum keys per B-tree node (default: 64)
    pub btree_node_size: usize,

    pub wal: WalConfig,

    pub disk: DiskSegmentConfig,

    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityMode {
    /// Write and fsync every record before returning.
    Sync,
    /// Block-compressed stream, tail block rewritten periodically.
    SyncCompressed,
    /// Queue records for a background writer. Queued records are lost on crash.
    AsyncCompressed,
    /// No log at all.
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    pub durability_mode: DurabilityMode,

    /// Codec used by the compressed strategies (default: LZ4)
    pub compression_method: CompressionMethod,

    pub compression_level: i32,

    /// Uncompressed bytes per stream block (default: 256KB)
    pub compression_block_size: usize,

    /// How long the async writer waits on an empty queue before flushing its
    /// tail block (default: 100ms)
    pub empty_queue_poll_interval: Duration,

    pub enable_tail_writer_job: bool,

    /// How often the sync-compressed tail writer runs (default: 500ms)
    pub tail_writer_interval: Duration,

    /// Append every replaced log generation to `<path>.full`
    pub enable_incremental_backup: bool,

    /// Collapse duplicate keys in recovered logs by replacing them on open
    pub compact_on_load: bool,

    /// Abort replay at the first checksum failure instead of skipping it
    pub stop_on_checksum_failure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockCacheMode {
    Unbounded,
    Circular,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockCacheConfig {
    pub mode: BlockCacheMode,

    /// Initial slot count of the circular cache (default: 1024)
    pub capacity: usize,

    /// A slot replaced again within this window counts as thrash (default: 1s)
    pub replacement_warning_duration: Duration,

    /// Consecutive thrashing replacements tolerated before the circular
    /// cache doubles (default: 8)
    pub thrash_tolerance: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSegmentConfig {
    pub compression_method: CompressionMethod,

    pub compression_level: i32,

    /// Uncompressed bytes per disk block (default: 32KB)
    pub block_size: usize,

    pub block_cache: BlockCacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Read-only record count that must be exceeded to start a merge
    /// (default: 1_000_000)
    pub merge_threshold_record_count: u64,

    /// Lower bound of a disk segment's sparse array length, itself capped
    /// at the record count
    pub minimum_sparse_array_length: usize,

    /// One sparse entry per this many records (default: 1000)
    pub sparse_array_step_length: usize,

    /// Period of the inactive block release task; `None` disables it
    pub inactive_block_cache_cleanup_interval: Option<Duration>,

    /// Cached blocks idle for longer than this are released (default: 60s)
    pub disk_segment_block_lifetime: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            durability_mode: DurabilityMode::Sync,
            compression_method: CompressionMethod::Lz4,
            compression_level: 0,
            compression_block_size: 256 * 1024, // 256KB
            empty_queue_poll_interval: Duration::from_millis(100),
            enable_tail_writer_job: true,
            tail_writer_interval: Duration::from_millis(500),
            enable_incremental_backup: false,
            compact_on_load: false,
            stop_on_checksum_failure: false,
        }
    }
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            mode: BlockCacheMode::Circular,
            capacity: 1024,
            replacement_warning_duration: Duration::from_secs(1),
            thrash_tolerance: 8,
        }
    }
}

impl Default for DiskSegmentConfig {
    fn default() -> Self {
        Self {
            compression_method: CompressionMethod::Lz4,
            compression_level: 0,
            block_size: 32 * 1024, // 32KB
            block_cache: BlockCacheConfig::default(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            merge_threshold_record_count: 1_000_000,
            minimum_sparse_array_length: 1_000,
            sparse_array_step_length: 1_000,
            inactive_block_cache_cleanup_interval: None,
            disk_segment_block_lifetime: Duration::from_secs(60),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            mutable_segment_max_item_count: 100_000,
            lock_mode: LockMode::NodeLevelSharedExclusive,
            btree_node_size: 64,
            wal: WalConfig::default(),
            disk: DiskSegmentConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn mutable_segment_max_item_count(mut self, count: usize) -> Self {
        self.mutable_segment_max_item_count = count;
        self
    }

    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    pub fn btree_node_size(mut self, size: usize) -> Self {
        self.btree_node_size = size;
        self
    }

    pub fn wal(mut self, config: WalConfig) -> Self {
        self.wal = config;
        self
    }

    pub fn disk(mut self, config: DiskSegmentConfig) -> Self {
        self.disk = config;
        self
    }

    pub fn maintenance(mut self, config: MaintenanceConfig) -> Self {
        self.maintenance = config;
        self
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.mutable_segment_max_item_count == 0 {
            return Err(Error::InvalidConfig(
                "mutable_segment_max_item_count must be positive".into(),
            ));
        }
        if self.btree_node_size < 3 {
            return Err(Error::InvalidConfig(
                "btree_node_size must be at least 3".into(),
            ));
        }
        if self.wal.compression_block_size == 0 {
            return Err(Error::InvalidConfig(
                "wal.compression_block_size must be positive".into(),
            ));
        }
        if self.disk.block_size == 0 {
            return Err(Error::InvalidConfig(
                "disk.block_size must be positive".into(),
            ));
        }
        if self.disk.block_cache.capacity == 0 {
            return Err(Error::InvalidConfig(
                "disk.block_cache.capacity must be positive".into(),
            ));
        }
        if self.maintenance.sparse_array_step_length == 0 {
            return Err(Error::InvalidConfig(
                "maintenance.sparse_array_step_length must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl WalConfig {
    pub fn durability_mode(mut self, mode: DurabilityMode) -> Self {
        self.durability_mode = mode;
        self
    }

    pub fn compression_method(mut self, method: CompressionMethod) -> Self {
        self.compression_method = method;
        self
    }

    pub fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn compression_block_size(mut self, size: usize) -> Self {
        self.compression_block_size = size;
        self
    }

    pub fn empty_queue_poll_interval(mut self, interval: Duration) -> Self {
        self.empty_queue_poll_interval = interval;
        self
    }

    pub fn enable_tail_writer_job(mut self, enabled: bool) -> Self {
        self.enable_tail_writer_job = enabled;
        self
    }

    pub fn tail_writer_interval(mut self, interval: Duration) -> Self {
        self.tail_writer_interval = interval;
        self
    }

    pub fn enable_incremental_backup(mut self, enabled: bool) -> Self {
        self.enable_incremental_backup = enabled;
        self
    }

    pub fn compact_on_load(mut self, enabled: bool) -> Self {
        self.compact_on_load = enabled;
        self
    }

    pub fn stop_on_checksum_failure(mut self, enabled: bool) -> Self {
        self.stop_on_checksum_failure = enabled;
        self
    }
}

impl DiskSegmentConfig {
    pub fn compression_method(mut self, method: CompressionMethod) -> Self {
        self.compression_method = method;
        self
    }

    pub fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn block_cache(mut self, config: BlockCacheConfig) -> Self {
        self.block_cache = config;
        self
    }
}

impl BlockCacheConfig {
    pub fn mode(mut self, mode: BlockCacheMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn replacement_warning_duration(mut self, duration: Duration) -> Self {
        self.replacement_warning_duration = duration;
        self
    }

    pub fn thrash_tolerance(mut self, tolerance: u32) -> Self {
        self.thrash_tolerance = tolerance;
        self
    }
}

impl MaintenanceConfig {
    pub fn merge_threshold_record_count(mut self, count: u64) -> Self {
        self.merge_threshold_record_count = count;
        self
    }

    pub fn minimum_sparse_array_length(mut self, length: usize) -> Self {
        self.minimum_sparse_array_length = length;
        self
    }

    pub fn sparse_array_step_length(mut self, length: usize) -> Self {
        self.sparse_array_step_length = length;
        self
    }

    pub fn inactive_block_cache_cleanup_interval(mut self, interval: Option<Duration>) -> Self {
        self.inactive_block_cache_cleanup_interval = interval;
        self
    }

    pub fn disk_segment_block_lifetime(mut self, lifetime: Duration) -> Self {
        self.disk_segment_block_lifetime = lifetime;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.dir, PathBuf::from("./emberdb"));
        assert_eq!(config.mutable_segment_max_item_count, 100_000);
        assert_eq!(config.lock_mode, LockMode::NodeLevelSharedExclusive);
        assert_eq!(config.wal.durability_mode, DurabilityMode::Sync);
        assert_eq!(config.wal.compression_block_size, 256 * 1024);
        assert_eq!(config.disk.block_cache.mode, BlockCacheMode::Circular);
        assert!(config.maintenance.inactive_block_cache_cleanup_interval.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::new("/tmp/test")
            .mutable_segment_max_item_count(500)
            .lock_mode(LockMode::TopLevelExclusive)
            .btree_node_size(8)
            .wal(
                WalConfig::default()
                    .durability_mode(DurabilityMode::AsyncCompressed)
                    .compression_method(CompressionMethod::Zstd)
                    .empty_queue_poll_interval(Duration::from_millis(5)),
            )
            .maintenance(
                MaintenanceConfig::default()
                    .merge_threshold_record_count(10)
                    .sparse_array_step_length(4),
            );

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.mutable_segment_max_item_count, 500);
        assert_eq!(config.lock_mode, LockMode::TopLevelExclusive);
        assert_eq!(config.btree_node_size, 8);
        assert_eq!(config.wal.durability_mode, DurabilityMode::AsyncCompressed);
        assert_eq!(config.wal.compression_method, CompressionMethod::Zstd);
        assert_eq!(config.wal.empty_queue_poll_interval, Duration::from_millis(5));
        assert_eq!(config.maintenance.merge_threshold_record_count, 10);
        assert_eq!(config.maintenance.sparse_array_step_length, 4);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let json = r#"{
            "dir": "/var/lib/ember",
            "lock_mode": "TopLevelSharedExclusive",
            "wal": { "durability_mode": "SyncCompressed", "compression_method": "Brotli" },
            "disk": { "block_cache": { "mode": "Unbounded" } }
        }"#;
        let config: StoreConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.dir, PathBuf::from("/var/lib/ember"));
        assert_eq!(config.lock_mode, LockMode::TopLevelSharedExclusive);
        assert_eq!(config.wal.durability_mode, DurabilityMode::SyncCompressed);
        assert_eq!(config.wal.compression_method, CompressionMethod::Brotli);
        assert_eq!(config.wal.tail_writer_interval, Duration::from_millis(500));
        assert_eq!(config.disk.block_cache.mode, BlockCacheMode::Unbounded);
        assert_eq!(config.disk.block_cache.capacity, 1024);
        assert_eq!(config.mutable_segment_max_item_count, 100_000);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = StoreConfig::default().btree_node_size(2);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = StoreConfig::default().disk(DiskSegmentConfig::default().block_size(0));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = StoreConfig::default()
            .maintenance(MaintenanceConfig::default().sparse_array_step_length(0));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
