use std::sync::Arc;

use super::Tree;
use crate::btree::Cursor;
use crate::error::Result;
use crate::wal::WriteAheadLog;

/// A frozen mutable segment waiting to be merged into the disk segment.
///
/// Its log stays on disk until the merge that absorbs it completes, so the
/// data survives a restart in the meantime.
pub struct ReadOnlySegment {
    id: u64,
    tree: Arc<Tree>,
    wal: Arc<dyn WriteAheadLog>,
}

impl std::fmt::Debug for ReadOnlySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlySegment")
            .field("id", &self.id)
            .field("len", &self.tree.len())
            .finish()
    }
}

impl ReadOnlySegment {
    pub(crate) fn new(id: u64, tree: Arc<Tree>, wal: Arc<dyn WriteAheadLog>) -> Self {
        Self { id, tree, wal }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn get(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.tree.get(&key.to_vec())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn cursor(&self) -> Cursor<Vec<u8>, Option<Vec<u8>>> {
        self.tree.cursor()
    }

    /// Deletes the log once the segment's data lives in a disk segment.
    pub fn drop_log(&self) -> Result<()> {
        self.wal.drop_log()
    }
}
