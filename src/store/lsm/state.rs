use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    Arc,
};

use parking_lot::RwLock;

use crate::segment::{DiskSegment, MutableSegment, ReadOnlySegment};

/// The segments visible to readers at one point in time.
#[derive(Clone)]
pub struct Segments {
    pub mutable: Arc<MutableSegment>,
    /// Oldest first.
    pub read_only: Vec<Arc<ReadOnlySegment>>,
    pub disk: Option<Arc<DiskSegment>>,
}

impl Segments {
    pub fn read_only_record_count(&self) -> u64 {
        self.read_only.iter().map(|s| s.len() as u64).sum()
    }
}

/// All mutable state of the LSM store.
///
/// Segment changes swap the whole [`Segments`] under one write lock, so a
/// reader's snapshot never misses data that moved between stages.
pub struct LsmState {
    segments: RwLock<Segments>,
    next_segment_id: AtomicU64,
    next_op_index: AtomicI64,
    merge_in_progress: AtomicBool,
}

impl LsmState {
    pub fn new(segments: Segments, next_segment_id: u64, next_op_index: i64) -> Self {
        Self {
            segments: RwLock::new(segments),
            next_segment_id: AtomicU64::new(next_segment_id),
            next_op_index: AtomicI64::new(next_op_index),
            merge_in_progress: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> Segments {
        self.segments.read().clone()
    }

    pub fn mutable(&self) -> Arc<MutableSegment> {
        self.segments.read().mutable.clone()
    }

    /// Applies `f` under the write lock.
    pub fn update<T>(&self, f: impl FnOnce(&mut Segments) -> T) -> T {
        f(&mut self.segments.write())
    }

    /// Get next segment ID atomically
    pub fn next_segment_id(&self) -> u64 {
        self.next_segment_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Hands out the operation index of the next write.
    pub fn next_op_index(&self) -> i64 {
        self.next_op_index.fetch_add(1, Ordering::SeqCst)
    }

    #[cfg(test)]
    fn peek_op_index(&self) -> i64 {
        self.next_op_index.load(Ordering::SeqCst)
    }

    /// Try to start a merge (returns guard if none is running)
    pub fn try_start_merge(&self) -> Option<MergeGuard<'_>> {
        if !self.merge_in_progress.swap(true, Ordering::SeqCst) {
            Some(MergeGuard { state: self })
        } else {
            None
        }
    }

    pub fn is_merging(&self) -> bool {
        self.merge_in_progress.load(Ordering::SeqCst)
    }
}

pub struct MergeGuard<'a> {
    state: &'a LsmState,
}

impl Drop for MergeGuard<'_> {
    fn drop(&mut self) {
        self.state.merge_in_progress.store(false, Ordering::SeqCst);
    }
}
