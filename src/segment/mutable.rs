use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{decode_value, encode_value, read_only::ReadOnlySegment, Tree};
use crate::btree::{BTree, Cursor, LockMode};
use crate::error::{Error, Result};
use crate::wal::{LogEntries, ReadOptions, WriteAheadLog};

/// The segment receiving writes: a B+tree with its write-ahead log.
///
/// Every upsert is logged before it is applied to the tree. Freezing waits
/// for in-flight upserts, seals the log and rejects further writes with
/// [`Error::Frozen`], upon which writers move on to the next segment.
///
/// Writes to the same key are serialized on a key stripe from the moment
/// their operation index is drawn until the tree holds the value, so the
/// live tree and a replay of the log agree on which write is the latest.
pub struct MutableSegment {
    id: u64,
    tree: Arc<Tree>,
    wal: Arc<dyn WriteAheadLog>,
    frozen: AtomicBool,
    // Upserts hold it shared; freezing takes it exclusively.
    gate: RwLock<()>,
    stripes: Box<[Mutex<()>]>,
    max_op_index: AtomicI64,
}

const KEY_STRIPES: usize = 64;

impl std::fmt::Debug for MutableSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableSegment")
            .field("id", &self.id)
            .field("len", &self.tree.len())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

impl MutableSegment {
    pub fn new(id: u64, wal: Arc<dyn WriteAheadLog>, lock_mode: LockMode, node_size: usize) -> Self {
        Self {
            id,
            tree: Arc::new(BTree::new(lock_mode, node_size)),
            wal,
            frozen: AtomicBool::new(false),
            gate: RwLock::new(()),
            stripes: (0..KEY_STRIPES).map(|_| Mutex::new(())).collect(),
            max_op_index: AtomicI64::new(-1),
        }
    }

    /// Rebuilds a segment from its log. Records are applied in operation
    /// order, so the latest write of each key wins regardless of the order
    /// the log was written in.
    pub fn recover(
        id: u64,
        wal: Arc<dyn WriteAheadLog>,
        lock_mode: LockMode,
        node_size: usize,
        options: ReadOptions,
    ) -> Result<(Self, LogEntries)> {
        let segment = Self::new(id, wal, lock_mode, node_size);
        let entries = segment.wal.read_log_entries(ReadOptions {
            sort_by_op_index: true,
            ..options
        })?;
        for ((key, value), op_index) in entries
            .keys
            .iter()
            .zip(&entries.values)
            .zip(&entries.op_indexes)
        {
            segment.tree.upsert(key.clone(), decode_value(value)?);
            segment.max_op_index.fetch_max(*op_index, Ordering::AcqRel);
        }
        Ok((segment, entries))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn upsert(&self, key: &[u8], value: Option<&[u8]>, op_index: i64) -> Result<()> {
        self.upsert_ordered(key, value, || op_index).map(|_| ())
    }

    /// Like [`upsert`](Self::upsert), but draws the operation index from
    /// `next_op_index` while holding the key's stripe. Returns the index used.
    /// A frozen segment returns [`Error::Frozen`] without drawing an index.
    pub fn upsert_ordered(
        &self,
        key: &[u8],
        value: Option<&[u8]>,
        next_op_index: impl FnOnce() -> i64,
    ) -> Result<i64> {
        let _gate = self.gate.read();
        if self.is_frozen() {
            return Err(Error::Frozen);
        }
        let _stripe = self.stripe(key).lock();
        let op_index = next_op_index();
        self.wal.append(key, &encode_value(value), op_index)?;
        self.tree.upsert(key.to_vec(), value.map(<[u8]>::to_vec));
        self.max_op_index.fetch_max(op_index, Ordering::AcqRel);
        Ok(op_index)
    }

    fn stripe(&self, key: &[u8]) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[hasher.finish() as usize % self.stripes.len()]
    }

    /// `Some(None)` means the key was deleted in this segment.
    pub fn get(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.tree.get(&key.to_vec())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn max_op_index(&self) -> i64 {
        self.max_op_index.load(Ordering::Acquire)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn cursor(&self) -> Cursor<Vec<u8>, Option<Vec<u8>>> {
        self.tree.cursor()
    }

    pub fn wal(&self) -> &Arc<dyn WriteAheadLog> {
        &self.wal
    }

    pub fn sync(&self) -> Result<()> {
        self.wal.flush()
    }

    /// Stops accepting writes and seals the log. The returned segment shares
    /// this segment's tree. If the log cannot be sealed the segment keeps
    /// accepting writes.
    pub fn freeze(&self) -> Result<ReadOnlySegment> {
        let _gate = self.gate.write();
        if self.frozen.swap(true, Ordering::AcqRel) {
            return Err(Error::Frozen);
        }
        if let Err(e) = self.wal.mark_frozen() {
            self.frozen.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(ReadOnlySegment::new(self.id, self.tree.clone(), self.wal.clone()))
    }
}
