//! Store notifications.
//!
//! Listeners run synchronously on the thread that caused the event, after the
//! store has released its own locks, so a listener may call back into the
//! store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::segment::{DiskSegment, ReadOnlySegment};

/// A mutable segment was frozen and a new one took its place.
#[derive(Debug, Clone)]
pub struct SegmentAdvanced {
    pub segment: Arc<ReadOnlySegment>,
}

/// A merge published a new disk segment.
#[derive(Debug, Clone)]
pub struct DiskSegmentCreated {
    pub segment: Arc<DiskSegment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listeners<E> {
    entries: Mutex<Vec<(SubscriptionId, Listener<E>)>>,
}

impl<E> Listeners<E> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, id: SubscriptionId, listener: Listener<E>) {
        self.entries.lock().push((id, listener));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    fn emit(&self, event: &E) {
        // Called outside the lock so listeners may subscribe or unsubscribe.
        let listeners: Vec<Listener<E>> =
            self.entries.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(event);
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

pub struct StoreEvents {
    next_id: AtomicU64,
    segment_advanced: Listeners<SegmentAdvanced>,
    disk_segment_created: Listeners<DiskSegmentCreated>,
}

impl StoreEvents {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            segment_advanced: Listeners::new(),
            disk_segment_created: Listeners::new(),
        }
    }

    pub fn on_segment_advanced(
        &self,
        listener: impl Fn(&SegmentAdvanced) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.allocate_id();
        self.segment_advanced.add(id, Arc::new(listener));
        id
    }

    pub fn on_disk_segment_created(
        &self,
        listener: impl Fn(&DiskSegmentCreated) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.allocate_id();
        self.disk_segment_created.add(id, Arc::new(listener));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.segment_advanced.remove(id) || self.disk_segment_created.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.segment_advanced.len() + self.disk_segment_created.len()
    }

    pub(crate) fn emit_segment_advanced(&self, event: SegmentAdvanced) {
        self.segment_advanced.emit(&event);
    }

    pub(crate) fn emit_disk_segment_created(&self, event: DiskSegmentCreated) {
        self.disk_segment_created.emit(&event);
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for StoreEvents {
    fn default() -> Self {
        Self::new()
    }
}
