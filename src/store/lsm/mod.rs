//! LSM storage engine over B+tree segments.
//!
//! ```text
//! ┌──────────────────┐ freeze  ┌───────────────────┐  merge  ┌──────────────┐
//! │ Mutable segment  │────────►│ Read-only segments│────────►│ Disk segment │
//! │ (B+tree + WAL)   │         │ (B+tree, WAL kept)│         │ (blocks)     │
//! └──────────────────┘         └───────────────────┘         └──────────────┘
//! ```
//!
//! # Write Path
//! 1. **Op index**: every write takes the next operation index from one counter
//! 2. **WAL + tree**: the mutable segment logs the record, then applies it
//! 3. **Advance**: a full mutable segment is frozen and replaced; listeners
//!    hear about it through [`StoreEvents`]
//! 4. **Merge**: all read-only segments and the disk segment are folded into a
//!    new disk segment; the merged logs and the old file are deleted
//!
//! # Read Path
//! The mutable segment is checked first, then read-only segments from newest
//! to oldest, then the disk segment. A tombstone ends the search.
//!
//! # Directory Layout
//! - `LOCK`: held for as long as the store is open
//! - `wal/<id>.wal`: one log per mutable or read-only segment
//! - `disk/<id>.seg`: the disk segment, named after the last segment it merged
//!
//! On open, logs already covered by the disk segment are deleted and the
//! others are replayed; the newest becomes the mutable segment.

pub mod events;
pub mod filter;
pub mod iterator;
pub mod maintainer;
pub mod recovery;
pub mod state;
pub mod store;
pub mod tasks;

pub use events::{DiskSegmentCreated, SegmentAdvanced, StoreEvents, SubscriptionId};
pub use iterator::{HeapEntry, MergeIterator};
pub use maintainer::{sparse_array_len, Maintainer};
pub use state::{LsmState, MergeGuard, Segments};
pub use store::{LsmScanIterator, LsmStore};
