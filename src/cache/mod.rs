//! Read caches for decompressed disk-segment blocks.
//!
//! A disk segment consults its cache before decompressing a block. Two
//! implementations are available: [`UnboundedBlockCache`] keeps every block
//! until it is removed or swept by age, and [`CircularBlockCache`] maps blocks
//! to a fixed number of slots by `block_index % capacity` and doubles its
//! capacity when the same positions keep getting replaced.

pub mod circular;
pub mod unbounded;

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tracing::Span;

pub use circular::CircularBlockCache;
pub use unbounded::UnboundedBlockCache;

use crate::config::{BlockCacheConfig, BlockCacheMode};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic milliseconds since the first call in this process.
pub fn now_ticks() -> i64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as i64
}

#[derive(Debug)]
pub struct DecompressedBlock {
    block_index: u32,
    bytes: Vec<u8>,
    last_access: AtomicI64,
}

impl DecompressedBlock {
    pub fn new(block_index: u32, bytes: Vec<u8>) -> Self {
        Self {
            block_index,
            bytes,
            last_access: AtomicI64::new(now_ticks()),
        }
    }

    pub fn block_index(&self) -> u32 {
        self.block_index
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn last_access_ticks(&self) -> i64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_access.fetch_max(now_ticks(), Ordering::Relaxed);
    }
}

pub trait BlockCache: Send + Sync {
    fn add_block(&self, block: Arc<DecompressedBlock>);

    fn remove_block(&self, block_index: u32);

    /// Returns the block only if the cache holds that exact index, and marks
    /// it as accessed.
    fn try_get_block(&self, block_index: u32) -> Option<Arc<DecompressedBlock>>;

    fn clear(&self);

    /// Drops blocks whose last access is older than `ticks`; returns how many.
    fn remove_blocks_accessed_before(&self, ticks: i64) -> usize;

    /// (hits, misses)
    fn stats(&self) -> (usize, usize);
}

pub fn new_block_cache(config: &BlockCacheConfig, span: Span) -> Arc<dyn BlockCache> {
    match config.mode {
        BlockCacheMode::Unbounded => Arc::new(UnboundedBlockCache::new()),
        BlockCacheMode::Circular => Arc::new(CircularBlockCache::new(
            config.capacity,
            config.replacement_warning_duration,
            config.thrash_tolerance,
            span,
        )),
    }
}

#[derive(Debug, Default)]
pub(crate) struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_never_moves_backwards() {
        let block = DecompressedBlock::new(7, vec![1, 2, 3]);
        let created = block.last_access_ticks();
        block.touch();
        assert!(block.last_access_ticks() >= created);
        assert_eq!(block.block_index(), 7);
        assert_eq!(block.len(), 3);
    }

    #[test]
    fn test_factory_honours_mode() {
        for mode in [BlockCacheMode::Unbounded, BlockCacheMode::Circular] {
            let cache = new_block_cache(&BlockCacheConfig::default().mode(mode), Span::none());
            cache.add_block(Arc::new(DecompressedBlock::new(3, vec![9])));
            assert_eq!(cache.try_get_block(3).unwrap().bytes(), &[9]);
            assert!(cache.try_get_block(4).is_none());
            assert_eq!(cache.stats(), (1, 1));
        }
    }
}
