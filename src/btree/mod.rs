//! Concurrent B+tree backing the mutable segment.
//!
//! Synchronization is chosen per tree through [`LockMode`]; every mode runs
//! the same algorithms and only changes which locks are real:
//!
//! | Mode | Tree lock | Node locks |
//! |---|---|---|
//! | `NoLock` | claim flag (panics on overlap) | none |
//! | `TopLevelExclusive` | mutex | none |
//! | `TopLevelSharedExclusive` | rwlock | none |
//! | `NodeLevelExclusive` | none | mutex |
//! | `NodeLevelSharedExclusive` | none | rwlock |
//!
//! Writers descend with lock coupling: a write lock is taken on each child
//! before ancestors are released, and ancestors are only released once the
//! child cannot overflow. Readers hand a read lock from parent to child.
//! Locks are always taken from the root toward the leaves.

mod cursor;
mod lock;
mod node;

pub use cursor::{Backward, Cursor};
pub use lock::{ModeLock, ModeRwLock};

use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use serde::{Deserialize, Serialize};

use node::{Node, NodeKind, NodeRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    NoLock,
    TopLevelExclusive,
    TopLevelSharedExclusive,
    NodeLevelExclusive,
    NodeLevelSharedExclusive,
}

impl LockMode {
    pub const ALL: [LockMode; 5] = [
        LockMode::NoLock,
        LockMode::TopLevelExclusive,
        LockMode::TopLevelSharedExclusive,
        LockMode::NodeLevelExclusive,
        LockMode::NodeLevelSharedExclusive,
    ];

    fn tree_lock(self) -> ModeLock {
        match self {
            LockMode::NoLock => ModeLock::unsynchronized(),
            LockMode::TopLevelExclusive => ModeLock::exclusive(),
            LockMode::TopLevelSharedExclusive => ModeLock::shared_exclusive(),
            LockMode::NodeLevelExclusive | LockMode::NodeLevelSharedExclusive => {
                ModeLock::Delegated
            }
        }
    }

    fn node_lock(self) -> ModeLock {
        match self {
            LockMode::NodeLevelExclusive => ModeLock::exclusive(),
            LockMode::NodeLevelSharedExclusive => ModeLock::shared_exclusive(),
            _ => ModeLock::Delegated,
        }
    }
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::NodeLevelSharedExclusive
    }
}

/// Where a seek landed: the leaf, the slot inside it, the leaf's version at
/// the time, and a copy of the entry.
pub(crate) struct Found<K, V> {
    pub leaf: NodeRef<K, V>,
    pub slot: usize,
    pub version: u64,
    pub key: K,
    pub value: V,
}

type ReadGuard<K, V> = ArcRwLockReadGuard<ModeLock, Node<K, V>>;
type WriteGuard<K, V> = ArcRwLockWriteGuard<ModeLock, Node<K, V>>;

pub struct BTree<K, V> {
    mode: LockMode,
    max_keys: usize,
    tree_lock: ModeRwLock<()>,
    root: NodeRef<K, V>,
    len: AtomicUsize,
}

impl<K, V> BTree<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    /// `node_size` is the maximum number of keys in a node; values below 3
    /// are raised to 3.
    pub fn new(mode: LockMode, node_size: usize) -> Self {
        Self {
            mode,
            max_keys: node_size.max(3),
            tree_lock: ModeRwLock::const_new(mode.tree_lock(), ()),
            root: Node::empty_leaf().into_ref(mode.node_lock()),
            len: AtomicUsize::new(0),
        }
    }

    pub fn lock_mode(&self) -> LockMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let _tree = self.tree_lock.read();
        let mut guard = self.root.read_arc();
        loop {
            let child = match &guard.kind {
                NodeKind::Leaf { values } => {
                    return guard.keys.binary_search(key).ok().map(|i| values[i].clone());
                }
                NodeKind::Internal { children } => children[guard.child_index(key)].clone(),
            };
            guard = child.read_arc();
        }
    }

    /// Inserts or replaces the value for `key`, returning the previous value.
    pub fn upsert(&self, key: K, value: V) -> Option<V> {
        let _tree = self.tree_lock.write();

        let mut path: Vec<WriteGuard<K, V>> = Vec::new();
        let mut current = self.root.write_arc();
        loop {
            let child = match &current.kind {
                NodeKind::Leaf { .. } => break,
                NodeKind::Internal { children } => children[current.child_index(&key)].clone(),
            };
            let child = child.write_arc();
            path.push(current);
            if child.is_safe(self.max_keys) {
                path.clear();
            }
            current = child;
        }

        let leaf = &mut *current;
        let slot = leaf.keys.binary_search(&key);
        leaf.version += 1;
        let NodeKind::Leaf { values } = &mut leaf.kind else {
            unreachable!("descent ends at a leaf")
        };
        match slot {
            Ok(i) => return Some(std::mem::replace(&mut values[i], value)),
            Err(i) => {
                leaf.keys.insert(i, key);
                values.insert(i, value);
                self.len.fetch_add(1, Ordering::AcqRel);
            }
        }
        if current.keys.len() <= self.max_keys {
            return None;
        }

        let (mut separator, mut right) = current.split(self.mode.node_lock());
        let mut splitting = current;
        while let Some(mut parent) = path.pop() {
            let i = parent.child_index(&separator);
            parent.keys.insert(i, separator);
            parent.children_mut().insert(i + 1, right);
            parent.version += 1;
            if parent.keys.len() <= self.max_keys {
                return None;
            }
            (separator, right) = parent.split(self.mode.node_lock());
            splitting = parent;
        }

        // Every retained ancestor was full, so the node that split last is
        // the root.
        debug_assert!(Arc::ptr_eq(
            ArcRwLockWriteGuard::rwlock(&splitting),
            &self.root
        ));
        splitting.grow_root(separator, right, self.mode.node_lock());
        None
    }

    /// Collects every entry in key order.
    pub fn to_vec(self: &Arc<Self>) -> Vec<(K, V)> {
        self.cursor().collect()
    }

    pub fn cursor(self: &Arc<Self>) -> Cursor<K, V> {
        Cursor::new(self.clone())
    }

    /// First entry matching `bound` in ascending order.
    pub(crate) fn seek_forward(&self, bound: Bound<&K>) -> Option<Found<K, V>> {
        let _tree = self.tree_lock.read();
        let mut bound = bound.cloned();
        loop {
            // Smallest separator above the path taken; the next candidate
            // if the leaf has nothing past the bound.
            let mut fence: Option<K> = None;
            let mut guard = self.root.read_arc();
            loop {
                let child = match &guard.kind {
                    NodeKind::Internal { children } => {
                        let i = match &bound {
                            Bound::Unbounded => 0,
                            Bound::Included(k) | Bound::Excluded(k) => guard.child_index(k),
                        };
                        if i < guard.keys.len() {
                            fence = Some(guard.keys[i].clone());
                        }
                        children[i].clone()
                    }
                    NodeKind::Leaf { .. } => break,
                };
                guard = child.read_arc();
            }

            let slot = match &bound {
                Bound::Unbounded => 0,
                Bound::Included(k) => guard.keys.partition_point(|x| x < k),
                Bound::Excluded(k) => guard.keys.partition_point(|x| x <= k),
            };
            if slot < guard.keys.len() {
                return Some(found(&guard, slot));
            }
            bound = Bound::Included(fence?);
        }
    }

    /// Last entry matching `bound` in descending order.
    pub(crate) fn seek_backward(&self, bound: Bound<&K>) -> Option<Found<K, V>> {
        let _tree = self.tree_lock.read();
        let mut bound = bound.cloned();
        loop {
            let mut fence: Option<K> = None;
            let mut guard = self.root.read_arc();
            loop {
                let child = match &guard.kind {
                    NodeKind::Internal { children } => {
                        let i = match &bound {
                            Bound::Unbounded => guard.keys.len(),
                            Bound::Included(k) => guard.child_index(k),
                            Bound::Excluded(k) => guard.keys.partition_point(|s| s < k),
                        };
                        if i > 0 {
                            fence = Some(guard.keys[i - 1].clone());
                        }
                        children[i].clone()
                    }
                    NodeKind::Leaf { .. } => break,
                };
                guard = child.read_arc();
            }

            let end = match &bound {
                Bound::Unbounded => guard.keys.len(),
                Bound::Included(k) => guard.keys.partition_point(|x| x <= k),
                Bound::Excluded(k) => guard.keys.partition_point(|x| x < k),
            };
            if end > 0 {
                return Some(found(&guard, end - 1));
            }
            bound = Bound::Excluded(fence?);
        }
    }

    /// Entry at `slot` of `leaf` if the leaf is still at `version`.
    pub(crate) fn step(&self, leaf: &NodeRef<K, V>, version: u64, slot: usize) -> Step<K, V> {
        let _tree = self.tree_lock.read();
        let guard = leaf.read_arc();
        if guard.version != version {
            return Step::Stale;
        }
        if slot >= guard.keys.len() {
            return Step::EndOfLeaf;
        }
        Step::Found(found(&guard, slot))
    }
}

pub(crate) enum Step<K, V> {
    Found(Found<K, V>),
    EndOfLeaf,
    Stale,
}

fn found<K: Clone, V: Clone>(guard: &ReadGuard<K, V>, slot: usize) -> Found<K, V> {
    let NodeKind::Leaf { values } = &guard.kind else {
        unreachable!("entries live in leaves")
    };
    Found {
        leaf: ArcRwLockReadGuard::rwlock(guard).clone(),
        slot,
        version: guard.version,
        key: guard.keys[slot].clone(),
        value: values[slot].clone(),
    }
}
