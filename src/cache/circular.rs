use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};
use tracing::Span;

use super::{now_ticks, BlockCache, DecompressedBlock, Stats};

type Slot = Mutex<Option<Arc<DecompressedBlock>>>;

struct Table {
    slots: Vec<Slot>,
}

impl Table {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, block_index: u32) -> &Slot {
        &self.slots[block_index as usize % self.slots.len()]
    }
}

/// Fixed number of slots addressed by `block_index % capacity`; adding a
/// block replaces whatever occupies its slot.
///
/// Every time a block is displaced, the time since that same block was last
/// displaced is compared against the replacement warning duration. After
/// `thrash_tolerance` consecutive fast replacements the cache logs a warning
/// and doubles its capacity, re-homing every resident block. Replacement times
/// are kept per block index, so contention on one logical block is still
/// recognised after its slot moves.
///
/// Lookups take the table lock only long enough to clone the current table.
/// An add racing with growth may land in the retired table, which costs a
/// later miss and nothing else.
pub struct CircularBlockCache {
    table: RwLock<Arc<Table>>,
    grow_lock: Mutex<()>,
    last_replacements: SkipMap<u32, i64>,
    warning_ticks: i64,
    thrash_tolerance: u32,
    consecutive_thrash: AtomicU32,
    stats: Stats,
    span: Span,
}

impl CircularBlockCache {
    pub fn new(
        capacity: usize,
        replacement_warning_duration: Duration,
        thrash_tolerance: u32,
        span: Span,
    ) -> Self {
        Self {
            table: RwLock::new(Arc::new(Table::new(capacity.max(1)))),
            grow_lock: Mutex::new(()),
            last_replacements: SkipMap::new(),
            warning_ticks: replacement_warning_duration.as_millis() as i64,
            thrash_tolerance: thrash_tolerance.max(1),
            consecutive_thrash: AtomicU32::new(0),
            stats: Stats::default(),
            span,
        }
    }

    pub fn capacity(&self) -> usize {
        self.current().capacity()
    }

    fn current(&self) -> Arc<Table> {
        self.table.read().clone()
    }

    fn on_displaced(&self, displaced: u32, capacity: usize) {
        let now = now_ticks();
        let previous = self.last_replacements.get(&displaced).map(|e| *e.value());
        self.last_replacements.insert(displaced, now);

        match previous {
            Some(previous) if now - previous < self.warning_ticks => {
                let count = self.consecutive_thrash.fetch_add(1, Ordering::AcqRel) + 1;
                if count >= self.thrash_tolerance {
                    tracing::warn!(
                        parent: &self.span,
                        block_index = displaced,
                        capacity,
                        interval_ms = now - previous,
                        "Block cache is thrashing"
                    );
                    self.grow(capacity);
                }
            }
            _ => self.consecutive_thrash.store(0, Ordering::Release),
        }
    }

    /// Doubles the table unless another thread already grew it past
    /// `observed_capacity`.
    fn grow(&self, observed_capacity: usize) {
        let _growing = self.grow_lock.lock();
        let mut table = self.table.write();
        if table.capacity() != observed_capacity {
            return;
        }

        let capacity = observed_capacity * 2;
        let grown = Table::new(capacity);
        let mut moved = 0;
        for slot in &table.slots {
            if let Some(block) = slot.lock().clone() {
                let block_index = block.block_index();
                *grown.slot(block_index).lock() = Some(block);
                moved += 1;
            }
        }
        *table = Arc::new(grown);
        drop(table);

        self.consecutive_thrash.store(0, Ordering::Release);
        tracing::info!(
            parent: &self.span,
            capacity,
            moved,
            "Block cache capacity doubled"
        );
    }
}

impl BlockCache for CircularBlockCache {
    fn add_block(&self, block: Arc<DecompressedBlock>) {
        let table = self.current();
        let block_index = block.block_index();
        let displaced = table.slot(block_index).lock().replace(block);

        if let Some(displaced) = displaced {
            if displaced.block_index() != block_index {
                self.on_displaced(displaced.block_index(), table.capacity());
            }
        }
    }

    fn remove_block(&self, block_index: u32) {
        let table = self.current();
        let mut slot = table.slot(block_index).lock();
        if slot.as_ref().map(|b| b.block_index()) == Some(block_index) {
            *slot = None;
        }
    }

    fn try_get_block(&self, block_index: u32) -> Option<Arc<DecompressedBlock>> {
        let table = self.current();
        let found = table
            .slot(block_index)
            .lock()
            .as_ref()
            .filter(|b| b.block_index() == block_index)
            .cloned();
        match found {
            Some(block) => {
                block.touch();
                self.stats.hit();
                Some(block)
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    fn clear(&self) {
        let table = self.current();
        for slot in &table.slots {
            *slot.lock() = None;
        }
        self.last_replacements.clear();
        self.consecutive_thrash.store(0, Ordering::Release);
    }

    fn remove_blocks_accessed_before(&self, ticks: i64) -> usize {
        let table = self.current();
        let mut removed = 0;
        for slot in &table.slots {
            let mut slot = slot.lock();
            if slot.as_ref().is_some_and(|b| b.last_access_ticks() < ticks) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }
}
