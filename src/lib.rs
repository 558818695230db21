//! Embedded ordered key-value engine.
//!
//! Writes land in a concurrent B+tree backed by a write-ahead log, frozen
//! trees are merged into a block-compressed disk segment in the background,
//! and disk blocks are served through a block cache.
//!
//! ```no_run
//! use emberdb::{LsmStore, Store};
//!
//! # fn main() -> emberdb::Result<()> {
//! let store = LsmStore::open("./data")?;
//! store.set(b"key", b"value".to_vec())?;
//! assert_eq!(store.get(b"key")?, Some(b"value".to_vec()));
//! # Ok(())
//! # }
//! ```

pub mod btree;
pub mod cache;
pub mod compression;
pub mod config;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod scheduler;
pub mod segment;
pub mod store;
pub mod wal;

pub use btree::{BTree, Cursor, LockMode};
pub use cache::{BlockCache, CircularBlockCache, UnboundedBlockCache};
pub use compression::CompressionMethod;
pub use config::{
    BlockCacheConfig, BlockCacheMode, DiskSegmentConfig, DurabilityMode, MaintenanceConfig,
    StoreConfig, WalConfig,
};
pub use error::{Error, Result};
pub use hasher::{Crc32Engine, Hasher};
pub use store::lsm::{LsmStore, Maintainer};
pub use store::Store;
pub use wal::{open_wal, LogEntries, ReadOptions, WriteAheadLog};
