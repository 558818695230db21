use std::mem;
use std::sync::Arc;

use super::lock::{ModeLock, ModeRwLock};

pub(crate) type NodeRef<K, V> = Arc<ModeRwLock<Node<K, V>>>;

pub(crate) enum NodeKind<K, V> {
    Leaf { values: Vec<V> },
    Internal { children: Vec<NodeRef<K, V>> },
}

/// A tree node. Internal nodes hold `keys.len() + 1` children; child `i`
/// covers keys in `[keys[i - 1], keys[i])`.
///
/// `version` changes on every modification, which lets cursors detect that a
/// leaf they remembered has been split or rewritten.
pub(crate) struct Node<K, V> {
    pub version: u64,
    pub keys: Vec<K>,
    pub kind: NodeKind<K, V>,
}

impl<K: Ord + Clone, V> Node<K, V> {
    pub fn empty_leaf() -> Self {
        Self {
            version: 0,
            keys: Vec::new(),
            kind: NodeKind::Leaf { values: Vec::new() },
        }
    }

    pub fn into_ref(self, lock: ModeLock) -> NodeRef<K, V> {
        Arc::new(ModeRwLock::const_new(lock, self))
    }

    /// Index of the child whose range contains `key`.
    pub fn child_index(&self, key: &K) -> usize {
        self.keys.partition_point(|k| k <= key)
    }

    /// True if inserting one more key cannot overflow this node.
    pub fn is_safe(&self, max_keys: usize) -> bool {
        self.keys.len() < max_keys
    }

    pub fn children_mut(&mut self) -> &mut Vec<NodeRef<K, V>> {
        match &mut self.kind {
            NodeKind::Internal { children } => children,
            NodeKind::Leaf { .. } => unreachable!("a leaf has no children"),
        }
    }

    /// Moves the upper half into a new right sibling and returns the
    /// separator to insert into the parent together with that sibling.
    pub fn split(&mut self, lock: ModeLock) -> (K, NodeRef<K, V>) {
        let mid = self.keys.len() / 2;
        self.version += 1;
        let (separator, right) = match &mut self.kind {
            NodeKind::Leaf { values } => {
                let keys = self.keys.split_off(mid);
                let values = values.split_off(mid);
                let separator = keys[0].clone();
                let right = Node {
                    version: 0,
                    keys,
                    kind: NodeKind::Leaf { values },
                };
                (separator, right)
            }
            NodeKind::Internal { children } => {
                let mut keys = self.keys.split_off(mid);
                let separator = keys.remove(0);
                let children = children.split_off(mid + 1);
                let right = Node {
                    version: 0,
                    keys,
                    kind: NodeKind::Internal { children },
                };
                (separator, right)
            }
        };
        (separator, right.into_ref(lock))
    }

    /// Pushes the root's current contents down into a new left child so the
    /// root keeps its identity while the tree gains a level.
    pub fn grow_root(&mut self, separator: K, right: NodeRef<K, V>, lock: ModeLock) {
        let left = Node {
            version: 0,
            keys: mem::take(&mut self.keys),
            kind: mem::replace(
                &mut self.kind,
                NodeKind::Internal {
                    children: Vec::new(),
                },
            ),
        };
        self.keys = vec![separator];
        self.kind = NodeKind::Internal {
            children: vec![left.into_ref(lock), right],
        };
        self.version += 1;
    }
}
