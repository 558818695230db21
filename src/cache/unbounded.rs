use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use super::{BlockCache, DecompressedBlock, Stats};

/// Keeps every block added until it is removed explicitly or swept by age.
#[derive(Default)]
pub struct UnboundedBlockCache {
    blocks: SkipMap<u32, Arc<DecompressedBlock>>,
    stats: Stats,
}

impl UnboundedBlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockCache for UnboundedBlockCache {
    fn add_block(&self, block: Arc<DecompressedBlock>) {
        self.blocks.insert(block.block_index(), block);
    }

    fn remove_block(&self, block_index: u32) {
        self.blocks.remove(&block_index);
    }

    fn try_get_block(&self, block_index: u32) -> Option<Arc<DecompressedBlock>> {
        match self.blocks.get(&block_index) {
            Some(entry) => {
                let block = entry.value().clone();
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
        self.blocks.clear();
    }

    fn remove_blocks_accessed_before(&self, ticks: i64) -> usize {
        let mut removed = 0;
        for entry in self.blocks.iter() {
            if entry.value().last_access_ticks() < ticks && entry.remove() {
                removed += 1;
            }
        }
        removed
    }

    fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::now_ticks;
    use std::time::Duration;

    fn block(index: u32) -> Arc<DecompressedBlock> {
        Arc::new(DecompressedBlock::new(index, vec![index as u8; 8]))
    }

    #[test]
    fn test_add_get_remove() {
        let cache = UnboundedBlockCache::new();
        for i in 0..100 {
            cache.add_block(block(i));
        }
        assert_eq!(cache.len(), 100);
        assert_eq!(cache.try_get_block(42).unwrap().bytes(), &[42u8; 8]);

        cache.remove_block(42);
        assert!(cache.try_get_block(42).is_none());

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_age_sweep_keeps_recently_read_blocks() {
        let cache = UnboundedBlockCache::new();
        cache.add_block(block(1));
        cache.add_block(block(2));
        cache.add_block(block(3));

        std::thread::sleep(Duration::from_millis(20));
        let cutoff = now_ticks();
        cache.try_get_block(2).unwrap();

        assert_eq!(cache.remove_blocks_accessed_before(cutoff), 2);
        assert!(cache.try_get_block(1).is_none());
        assert!(cache.try_get_block(2).is_some());
        assert!(cache.try_get_block(3).is_none());
    }
}
