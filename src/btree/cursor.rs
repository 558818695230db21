use std::ops::Bound;
use std::sync::Arc;

use super::node::NodeRef;
use super::{BTree, Found, Step};

enum Position<K, V> {
    /// Before the first entry.
    Start,
    /// After the last entry.
    End,
    /// Between entries: `next` yields the first key >= this one.
    Before(K),
    /// On an entry. The leaf and version let the next step stay inside the
    /// leaf without descending from the root.
    At {
        leaf: NodeRef<K, V>,
        slot: usize,
        version: u64,
        key: K,
    },
}

/// Bidirectional cursor over a [`BTree`].
///
/// A cursor holds no lock between calls. Each step takes the locks it needs
/// for one leaf, and if that leaf changed since the last step (split,
/// insert, root growth) the cursor re-seeks from its last key, so it never
/// repeats or skips a key that stayed in the tree.
pub struct Cursor<K, V> {
    tree: Arc<BTree<K, V>>,
    position: Position<K, V>,
}

impl<K, V> Cursor<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    pub(crate) fn new(tree: Arc<BTree<K, V>>) -> Self {
        Self {
            tree,
            position: Position::Start,
        }
    }

    /// Positions the cursor so that `move_next` returns the first entry with
    /// a key >= `key` and `move_prev` the last entry with a key < `key`.
    pub fn seek(&mut self, key: &K) {
        self.position = Position::Before(key.clone());
    }

    /// Positions the cursor after the last entry.
    pub fn seek_to_end(&mut self) {
        self.position = Position::End;
    }

    pub fn reset(&mut self) {
        self.position = Position::Start;
    }

    pub fn move_next(&mut self) -> Option<(K, V)> {
        let found = match &self.position {
            Position::Start => self.tree.seek_forward(Bound::Unbounded),
            Position::End => None,
            Position::Before(key) => self.tree.seek_forward(Bound::Included(key)),
            Position::At {
                leaf,
                slot,
                version,
                key,
            } => match self.tree.step(leaf, *version, slot + 1) {
                Step::Found(found) => Some(found),
                Step::EndOfLeaf | Step::Stale => self.tree.seek_forward(Bound::Excluded(key)),
            },
        };
        self.land(found, Position::End)
    }

    pub fn move_prev(&mut self) -> Option<(K, V)> {
        let found = match &self.position {
            Position::Start => None,
            Position::End => self.tree.seek_backward(Bound::Unbounded),
            Position::Before(key) => self.tree.seek_backward(Bound::Excluded(key)),
            Position::At {
                leaf,
                slot,
                version,
                key,
            } => match slot.checked_sub(1) {
                Some(slot) => match self.tree.step(leaf, *version, slot) {
                    Step::Found(found) => Some(found),
                    Step::EndOfLeaf | Step::Stale => {
                        self.tree.seek_backward(Bound::Excluded(key))
                    }
                },
                None => self.tree.seek_backward(Bound::Excluded(key)),
            },
        };
        self.land(found, Position::Start)
    }

    /// Iterates from the current position toward smaller keys. A cursor
    /// that has not moved yet starts from the last entry.
    pub fn backward(mut self) -> Backward<K, V> {
        if matches!(self.position, Position::Start) {
            self.position = Position::End;
        }
        Backward {
            cursor: self,
            done: false,
        }
    }

    fn land(&mut self, found: Option<Found<K, V>>, exhausted: Position<K, V>) -> Option<(K, V)> {
        match found {
            Some(found) => {
                self.position = Position::At {
                    leaf: found.leaf,
                    slot: found.slot,
                    version: found.version,
                    key: found.key.clone(),
                };
                Some((found.key, found.value))
            }
            None => {
                self.position = exhausted;
                None
            }
        }
    }
}

impl<K, V> Iterator for Cursor<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.move_next()
    }
}

/// Descending iterator returned by [`Cursor::backward`].
pub struct Backward<K, V> {
    cursor: Cursor<K, V>,
    done: bool,
}

impl<K, V> Iterator for Backward<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.cursor.move_prev();
        self.done = item.is_none();
        item
    }
}
