//! Sorted-index nodes
//!
//! A node holds at most `N` entries and, after maintenance, at least
//! `N/2` (the root is exempt). Leaf entries are full entry keys in key
//! order; internal entries pair a child with an inline copy of the
//! child's subtree maximum. The rightmost entry of every node on the
//! right spine carries the max-key sentinel, so routing is total.
//!
//! Structural fields that change under the parent's lock but are read by
//! lock-free navigation (parent, siblings) live outside the node's inner
//! lock as atomics; the per-node version counter is bumped before any
//! payload mutation so optimistic readers can detect staleness.

use crate::key::EntryKey;
use crate::sorted::range::KeyRangeLock;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use velox_core::types::RecordHandle;

/// One node entry. Leaves leave `child` null.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    /// Leaf: the indexed entry. Internal: inline copy of the child's
    /// subtree maximum.
    pub key: EntryKey,
    /// Internal: the child node.
    pub child: RecordHandle,
}

/// Lock-protected node payload.
#[derive(Debug)]
pub struct NodeInner {
    /// Leaf or internal.
    pub leaf: bool,
    /// Sorted entries.
    pub entries: Vec<NodeEntry>,
    /// Key-range locks anchored on this node.
    pub ranges: Vec<KeyRangeLock>,
}

impl Default for NodeInner {
    fn default() -> Self {
        NodeInner {
            leaf: true,
            entries: Vec::new(),
            ranges: Vec::new(),
        }
    }
}

impl NodeInner {
    /// Route to the child responsible for `entry`: the first entry whose
    /// separator is at or above it, falling back to the last child.
    pub fn route(&self, entry: &EntryKey) -> usize {
        debug_assert!(!self.leaf);
        for (index, node_entry) in self.entries.iter().enumerate() {
            if &node_entry.key >= entry {
                return index;
            }
        }
        self.entries.len() - 1
    }

    /// Leftmost position at or above `entry` in a leaf.
    pub fn leaf_position(&self, entry: &EntryKey) -> usize {
        debug_assert!(self.leaf);
        self.entries
            .partition_point(|node_entry| &node_entry.key < entry)
    }

    /// Exact leaf position of `entry`, if present.
    pub fn leaf_find(&self, entry: &EntryKey) -> Option<usize> {
        let position = self.leaf_position(entry);
        if position < self.entries.len() && self.entries[position].key == *entry {
            Some(position)
        } else {
            None
        }
    }

    /// Position of a child handle in an internal node.
    pub fn child_position(&self, child: RecordHandle) -> Option<usize> {
        debug_assert!(!self.leaf);
        self.entries.iter().position(|e| e.child == child)
    }
}

/// A tree node.
pub struct Node {
    version: AtomicU64,
    parent: AtomicU64,
    left: AtomicU64,
    right: AtomicU64,
    /// Payload behind the node lock.
    pub inner: RwLock<NodeInner>,
}

impl Default for Node {
    fn default() -> Self {
        Node {
            version: AtomicU64::new(0),
            parent: AtomicU64::new(0),
            left: AtomicU64::new(0),
            right: AtomicU64::new(0),
            inner: RwLock::new(NodeInner::default()),
        }
    }
}

impl Node {
    /// Monotone version counter.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Bump the version counter; called with the write lock held, before
    /// the payload mutation it covers.
    #[inline]
    pub fn begin_mutation(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Parent node, null for the root.
    #[inline]
    pub fn parent(&self) -> RecordHandle {
        RecordHandle::from_raw(self.parent.load(Ordering::Acquire))
    }

    /// Set the parent back-pointer.
    #[inline]
    pub fn set_parent(&self, handle: RecordHandle) {
        self.parent.store(handle.as_raw(), Ordering::Release);
    }

    /// Left sibling (leaves).
    #[inline]
    pub fn left(&self) -> RecordHandle {
        RecordHandle::from_raw(self.left.load(Ordering::Acquire))
    }

    /// Set the left sibling.
    #[inline]
    pub fn set_left(&self, handle: RecordHandle) {
        self.left.store(handle.as_raw(), Ordering::Release);
    }

    /// Right sibling (leaves).
    #[inline]
    pub fn right(&self) -> RecordHandle {
        RecordHandle::from_raw(self.right.load(Ordering::Acquire))
    }

    /// Set the right sibling.
    #[inline]
    pub fn set_right(&self, handle: RecordHandle) {
        self.right.store(handle.as_raw(), Ordering::Release);
    }

    /// Reset a node for recycling.
    pub fn reset(&self) {
        self.parent.store(0, Ordering::Relaxed);
        self.left.store(0, Ordering::Relaxed);
        self.right.store(0, Ordering::Relaxed);
        let mut inner = self.inner.write();
        inner.leaf = true;
        inner.entries.clear();
        inner.ranges.clear();
    }
}
