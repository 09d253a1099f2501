//! Sorted secondary index (B+tree)
//!
//! Ordered access by a typed multi-column key plus id and handle
//! tiebreakers, with forward and backward range scans and key-range locks
//! for phantom prevention.
//!
//! # Structure
//!
//! Arena-allocated nodes of capacity `N` (at least `N/2` after
//! maintenance, root exempt). Internal entries carry an inline copy of
//! their child's subtree maximum; the right spine terminates in the
//! max-key sentinel so routing is total. Leaves are linked left/right for
//! scans.
//!
//! # Concurrency
//!
//! Mutations descend top-down with lock coupling and preemptive
//! maintenance: a full child is split, and a minimally filled child is
//! refilled (borrow or merge), while the parent is still write-locked, so
//! no mutation ever propagates back upward. When a delete removes a
//! child's maximum, the parent stays locked across the descent so the
//! separator copy can be rewritten on the way back; this folds the
//! re-descend-with-parent-locked case into one pass.
//!
//! Readers descend with short read locks, validating node publication on
//! every step and restarting from the root when a node vanished
//! underneath them; per-node version counters are bumped before every
//! payload mutation. Retired nodes go through epoch-based reclamation, so
//! a stale handle always points at intact (if outdated) memory.

pub mod epoch;
pub mod node;
pub mod range;

use crate::arena::{Slab, SlotRef};
use crate::effects::{EffectLog, RangeLockRef};
use crate::heap::ClassHeap;
use crate::key::{EntryKey, KeyReader};
use crate::sorted::epoch::EpochService;
use crate::sorted::node::{Node, NodeEntry, NodeInner};
use crate::sorted::range::{KeyRangeLock, RangeBound};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use velox_core::error::{DbError, DbResult};
use velox_core::model::SortedIndexMeta;
use velox_core::tran::TranIdentity;
use velox_core::types::{ClassId, ObjectId, RecordHandle};

struct DeleteOutcome {
    removed: bool,
    new_max: Option<EntryKey>,
}

struct LeafScan {
    done: bool,
    /// Last entry position consumed or examined, for the hop bound.
    last_in_leaf: Option<EntryKey>,
    /// Where the consumed interval ends for range locking.
    lock_end: RangeBound,
}

/// A sorted secondary index over one class.
pub struct SortedIndex {
    class_id: ClassId,
    class_name: String,
    meta: SortedIndexMeta,
    index_pos: usize,
    arena: Slab<Node>,
    root: RwLock<RecordHandle>,
    capacity: usize,
    epoch: EpochService,
    next_lock_id: AtomicU64,
}

impl SortedIndex {
    /// Create an empty index: the root is a single empty leaf.
    pub fn new(
        class_id: ClassId,
        class_name: String,
        meta: SortedIndexMeta,
        index_pos: usize,
        pool: u8,
        capacity: usize,
    ) -> Self {
        assert!(capacity >= 4, "node capacity below the rebalance minimum");
        let arena = Slab::new(pool);
        let root_handle = arena.allocate();
        arena.publish(root_handle);
        SortedIndex {
            class_id,
            class_name,
            meta,
            index_pos,
            arena,
            root: RwLock::new(root_handle),
            capacity,
            epoch: EpochService::new(),
            next_lock_id: AtomicU64::new(1),
        }
    }

    /// Index descriptor.
    pub fn meta(&self) -> &SortedIndexMeta {
        &self.meta
    }

    fn min_entries(&self) -> usize {
        self.capacity / 2
    }

    fn conflict(&self) -> DbError {
        DbError::index_conflict(self.class_name.clone(), self.meta.name.clone())
    }

    fn check_node_ranges(
        &self,
        inner: &NodeInner,
        entry: &EntryKey,
        tran: Option<&TranIdentity>,
    ) -> DbResult<()> {
        if let Some(tran) = tran {
            for range in &inner.ranges {
                if range.contains(entry) && range.conflicts_with(tran) {
                    return Err(self.conflict());
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Insert an entry on behalf of a transaction, honoring key-range
    /// locks and (when `unique` context is given) the uniqueness
    /// constraint.
    pub fn insert(
        &self,
        tran: &TranIdentity,
        entry: EntryKey,
        unique: Option<(&ClassHeap, &KeyReader)>,
    ) -> DbResult<()> {
        self.insert_impl(entry, Some(tran), unique)
    }

    /// Insert without conflict or uniqueness checks (restore/alignment and
    /// index build).
    pub fn insert_unchecked(&self, entry: EntryKey) {
        self.insert_impl(entry, None, None)
            .expect("unchecked insert cannot conflict");
    }

    fn insert_impl(
        &self,
        entry: EntryKey,
        tran: Option<&TranIdentity>,
        unique: Option<(&ClassHeap, &KeyReader)>,
    ) -> DbResult<()> {
        let _epoch = self.epoch.enter();
        loop {
            let root_handle = *self.root.read();
            let root = self.arena.get(root_handle);
            let guard = root.inner.write();
            if *self.root.read() != root_handle {
                continue;
            }
            if guard.entries.len() >= self.capacity {
                drop(guard);
                self.grow_root(root_handle);
                continue;
            }
            self.check_node_ranges(&guard, &entry, tran)?;
            return self.insert_locked(root_handle, guard, entry, tran, unique);
        }
    }

    fn insert_locked(
        &self,
        node_handle: RecordHandle,
        mut guard: RwLockWriteGuard<'_, NodeInner>,
        entry: EntryKey,
        tran: Option<&TranIdentity>,
        unique: Option<(&ClassHeap, &KeyReader)>,
    ) -> DbResult<()> {
        if guard.leaf {
            if let (Some(tran), Some((heap, reader))) = (tran, unique) {
                self.check_unique(node_handle, &guard, &entry, tran, heap, reader)?;
            }
            self.arena.get(node_handle).begin_mutation();
            let position = guard.leaf_position(&entry);
            guard.entries.insert(
                position,
                NodeEntry {
                    key: entry,
                    child: RecordHandle::NULL,
                },
            );
            return Ok(());
        }
        loop {
            let index = guard.route(&entry);
            let child_handle = guard.entries[index].child;
            let child = self.arena.get(child_handle);
            let mut child_guard = child.inner.write();
            self.check_node_ranges(&child_guard, &entry, tran)?;
            if child_guard.entries.len() >= self.capacity {
                self.split_child(node_handle, &mut guard, index, child_handle, &child, &mut child_guard);
                drop(child_guard);
                continue;
            }
            drop(guard);
            return self.insert_locked(child_handle, child_guard, entry, tran, unique);
        }
    }

    /// Uniqueness check at the target leaf: walk right through entries
    /// with an equal composite key, surfacing violations and conflicts by
    /// their ids' visible state.
    fn check_unique(
        &self,
        leaf_handle: RecordHandle,
        guard: &NodeInner,
        entry: &EntryKey,
        tran: &TranIdentity,
        heap: &ClassHeap,
        reader: &KeyReader,
    ) -> DbResult<()> {
        let probe = EntryKey::new(entry.key.clone(), ObjectId::NULL, RecordHandle::NULL);
        let mut position = guard.leaf_position(&probe);
        while position < guard.entries.len() {
            let candidate = &guard.entries[position].key;
            if candidate.key != entry.key {
                return Ok(());
            }
            self.check_duplicate(candidate, entry, tran, heap, reader)?;
            position += 1;
        }
        // The equal run may continue in right siblings
        let mut cursor = self.arena.get(leaf_handle).right();
        while !cursor.is_null() {
            let sibling = self.arena.get(cursor);
            let sibling_guard = sibling.inner.read();
            for node_entry in sibling_guard.entries.iter() {
                if node_entry.key.key != entry.key {
                    return Ok(());
                }
                self.check_duplicate(&node_entry.key, entry, tran, heap, reader)?;
            }
            drop(sibling_guard);
            cursor = sibling.right();
        }
        Ok(())
    }

    fn check_duplicate(
        &self,
        candidate: &EntryKey,
        inserted: &EntryKey,
        tran: &TranIdentity,
        heap: &ClassHeap,
        reader: &KeyReader,
    ) -> DbResult<()> {
        if candidate.id == inserted.id {
            return Ok(());
        }
        let record = heap.record(candidate.handle);
        if record.id() == candidate.id {
            let version = record.version();
            if version.is_uncommitted() {
                return if version.is_owned_by(tran.id) {
                    Err(DbError::UniquenessViolation {
                        object_id: inserted.id,
                        class: self.class_name.clone(),
                        index: self.meta.name.clone(),
                    })
                } else {
                    Err(self.conflict())
                };
            }
        }
        if let Some(visible) = heap.read_visible(tran.id, tran.read_version, candidate.id) {
            if !visible.deleted && reader.read(&visible.values) == inserted.key {
                return Err(DbError::UniquenessViolation {
                    object_id: inserted.id,
                    class: self.class_name.clone(),
                    index: self.meta.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Put a fresh internal node above a full root; the actual split then
    /// happens top-down on the next descent.
    fn grow_root(&self, old_root: RecordHandle) {
        let mut root = self.root.write();
        if *root != old_root {
            return;
        }
        let new_handle = self.arena.allocate();
        let new_root = self.arena.get(new_handle);
        {
            let mut guard = new_root.inner.write();
            guard.leaf = false;
            guard.entries.push(NodeEntry {
                key: EntryKey::max_sentinel(),
                child: old_root,
            });
        }
        self.arena.publish(new_handle);
        self.arena.get(old_root).set_parent(new_handle);
        *root = new_handle;
    }

    /// Split a full child at `N/2` under its parent's write lock,
    /// inserting the new separator into the parent.
    fn split_child(
        &self,
        parent_handle: RecordHandle,
        parent_guard: &mut RwLockWriteGuard<'_, NodeInner>,
        index: usize,
        child_handle: RecordHandle,
        child: &SlotRef<Node>,
        child_guard: &mut RwLockWriteGuard<'_, NodeInner>,
    ) {
        child.begin_mutation();
        let half = child_guard.entries.len() / 2;
        let right_entries = child_guard.entries.split_off(half);

        let right_handle = self.arena.allocate();
        let right = self.arena.get(right_handle);
        {
            let mut right_guard = right.inner.write();
            right_guard.leaf = child_guard.leaf;
            right_guard.entries = right_entries;
            // Ranges anchored on the split node keep covering both halves
            right_guard.ranges = child_guard.ranges.clone();
        }
        right.set_parent(parent_handle);
        if child_guard.leaf {
            let old_right = child.right();
            right.set_left(child_handle);
            right.set_right(old_right);
            child.set_right(right_handle);
            if !old_right.is_null() {
                self.arena.get(old_right).set_left(right_handle);
            }
        } else {
            let right_guard = right.inner.read();
            for node_entry in right_guard.entries.iter() {
                self.arena.get(node_entry.child).set_parent(right_handle);
            }
        }
        self.arena.publish(right_handle);

        self.arena.get(parent_handle).begin_mutation();
        let left_max = child_guard
            .entries
            .last()
            .expect("split keeps the low half")
            .key
            .clone();
        let old_separator = std::mem::replace(&mut parent_guard.entries[index].key, left_max);
        parent_guard.entries.insert(
            index + 1,
            NodeEntry {
                key: old_separator,
                child: right_handle,
            },
        );
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Remove an entry on behalf of a transaction, honoring key-range
    /// locks. Returns whether the entry was present.
    pub fn delete(&self, tran: &TranIdentity, entry: &EntryKey) -> DbResult<bool> {
        self.delete_impl(entry, Some(tran))
    }

    /// Remove an entry without range checks (rollback, GC, restore).
    pub fn remove_unchecked(&self, entry: &EntryKey) -> bool {
        self.delete_impl(entry, None)
            .expect("unchecked delete cannot conflict")
    }

    fn delete_impl(&self, entry: &EntryKey, tran: Option<&TranIdentity>) -> DbResult<bool> {
        let _epoch = self.epoch.enter();
        loop {
            let root_handle = *self.root.read();
            let root = self.arena.get(root_handle);
            let guard = root.inner.write();
            if *self.root.read() != root_handle {
                continue;
            }
            if !guard.leaf && guard.entries.len() == 1 {
                drop(guard);
                self.collapse_root(root_handle);
                continue;
            }
            self.check_node_ranges(&guard, entry, tran)?;
            return self
                .delete_locked(root_handle, guard, entry, tran)
                .map(|outcome| outcome.removed);
        }
    }

    fn delete_locked(
        &self,
        node_handle: RecordHandle,
        mut guard: RwLockWriteGuard<'_, NodeInner>,
        entry: &EntryKey,
        tran: Option<&TranIdentity>,
    ) -> DbResult<DeleteOutcome> {
        if guard.leaf {
            let position = match guard.leaf_find(entry) {
                Some(position) => position,
                None => {
                    return Ok(DeleteOutcome {
                        removed: false,
                        new_max: None,
                    })
                }
            };
            self.arena.get(node_handle).begin_mutation();
            guard.entries.remove(position);
            let new_max = if position == guard.entries.len() {
                guard.entries.last().map(|e| e.key.clone())
            } else {
                None
            };
            return Ok(DeleteOutcome {
                removed: true,
                new_max,
            });
        }
        loop {
            let index = guard.route(entry);
            let child_handle = guard.entries[index].child;
            let child = self.arena.get(child_handle);
            let mut child_guard = child.inner.write();
            self.check_node_ranges(&child_guard, entry, tran)?;
            if child_guard.entries.len() <= self.min_entries() {
                drop(child_guard);
                self.rebalance_child(node_handle, &mut guard, index);
                continue;
            }
            // Deleting the child's maximum: hold this node across the
            // descent so the separator copy can be rewritten afterwards.
            if guard.entries[index].key == *entry {
                let outcome = self.delete_locked(child_handle, child_guard, entry, tran)?;
                if let Some(new_max) = outcome.new_max {
                    self.arena.get(node_handle).begin_mutation();
                    guard.entries[index].key = new_max.clone();
                    let propagate = index + 1 == guard.entries.len();
                    return Ok(DeleteOutcome {
                        removed: outcome.removed,
                        new_max: if propagate { Some(new_max) } else { None },
                    });
                }
                return Ok(DeleteOutcome {
                    removed: outcome.removed,
                    new_max: None,
                });
            }
            drop(guard);
            return self.delete_locked(child_handle, child_guard, entry, tran);
        }
    }

    /// Refill a minimally filled child before descending into it: borrow
    /// from a sibling with room to spare, merge otherwise.
    fn rebalance_child(
        &self,
        parent_handle: RecordHandle,
        parent_guard: &mut RwLockWriteGuard<'_, NodeInner>,
        index: usize,
    ) {
        let parent = self.arena.get(parent_handle);
        let child_handle = parent_guard.entries[index].child;
        let child = self.arena.get(child_handle);

        if index + 1 < parent_guard.entries.len() {
            let right_handle = parent_guard.entries[index + 1].child;
            let right = self.arena.get(right_handle);
            let mut child_guard = child.inner.write();
            let mut right_guard = right.inner.write();
            if right_guard.entries.len() > self.min_entries() + 1 {
                parent.begin_mutation();
                child.begin_mutation();
                right.begin_mutation();
                let moved = right_guard.entries.remove(0);
                if !child_guard.leaf {
                    self.arena.get(moved.child).set_parent(child_handle);
                }
                parent_guard.entries[index].key = moved.key.clone();
                child_guard.entries.push(moved);
                return;
            }
            self.merge_into_left(
                parent_handle,
                parent_guard,
                index,
                child_handle,
                &child,
                &mut child_guard,
                right_handle,
                &right,
                &mut right_guard,
            );
            return;
        }

        let left_handle = parent_guard.entries[index - 1].child;
        let left = self.arena.get(left_handle);
        let mut left_guard = left.inner.write();
        let mut child_guard = child.inner.write();
        if left_guard.entries.len() > self.min_entries() + 1 {
            parent.begin_mutation();
            left.begin_mutation();
            child.begin_mutation();
            let moved = left_guard.entries.pop().expect("sibling above minimum");
            parent_guard.entries[index - 1].key = left_guard
                .entries
                .last()
                .expect("sibling keeps entries")
                .key
                .clone();
            if !child_guard.leaf {
                self.arena.get(moved.child).set_parent(child_handle);
            }
            child_guard.entries.insert(0, moved);
            return;
        }
        self.merge_into_left(
            parent_handle,
            parent_guard,
            index - 1,
            left_handle,
            &left,
            &mut left_guard,
            child_handle,
            &child,
            &mut child_guard,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_into_left(
        &self,
        parent_handle: RecordHandle,
        parent_guard: &mut RwLockWriteGuard<'_, NodeInner>,
        left_index: usize,
        left_handle: RecordHandle,
        left: &SlotRef<Node>,
        left_guard: &mut RwLockWriteGuard<'_, NodeInner>,
        right_handle: RecordHandle,
        right: &SlotRef<Node>,
        right_guard: &mut RwLockWriteGuard<'_, NodeInner>,
    ) {
        self.arena.get(parent_handle).begin_mutation();
        left.begin_mutation();
        right.begin_mutation();

        if !left_guard.leaf {
            for node_entry in right_guard.entries.iter() {
                self.arena.get(node_entry.child).set_parent(left_handle);
            }
        }
        left_guard.entries.append(&mut right_guard.entries);
        left_guard.ranges.append(&mut right_guard.ranges);

        parent_guard.entries[left_index].key = parent_guard.entries[left_index + 1].key.clone();
        parent_guard.entries.remove(left_index + 1);

        if left_guard.leaf {
            let new_right = right.right();
            left.set_right(new_right);
            if !new_right.is_null() {
                self.arena.get(new_right).set_left(left_handle);
            }
        }
        self.retire_node(right_handle);
    }

    /// Replace a single-child internal root with its child.
    fn collapse_root(&self, old_root: RecordHandle) {
        let mut root = self.root.write();
        if *root != old_root {
            return;
        }
        let node = self.arena.get(old_root);
        let guard = node.inner.write();
        if guard.leaf || guard.entries.len() != 1 {
            return;
        }
        let child = guard.entries[0].child;
        drop(guard);
        *root = child;
        self.arena.get(child).set_parent(RecordHandle::NULL);
        self.retire_node(old_root);
    }

    fn retire_node(&self, handle: RecordHandle) {
        self.arena.get(handle).begin_mutation();
        self.arena.retire_deferred(handle);
        self.epoch.retire(handle);
    }

    /// Recycle nodes whose retirement epoch no participant can observe.
    pub fn reclaim_nodes(&self) {
        self.epoch.reclaim(&mut |handle| {
            self.arena.get(handle).reset();
            self.arena.recycle(handle);
        });
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Descend to the leaf responsible for a bound. Short read locks with
    /// publication checks; restarts from the root on instability.
    fn find_leaf(&self, bound: &RangeBound, forward: bool) -> RecordHandle {
        'restart: loop {
            let mut handle = *self.root.read();
            loop {
                let node = self.arena.get(handle);
                let guard = node.inner.read();
                if !self.arena.get(handle).is_published() && handle != *self.root.read() {
                    continue 'restart;
                }
                if guard.leaf {
                    return handle;
                }
                let index = match (&bound.key, forward) {
                    (Some(key), _) => guard.route(key),
                    (None, true) => 0,
                    (None, false) => guard.entries.len() - 1,
                };
                let next = guard.entries[index].child;
                drop(guard);
                handle = next;
            }
        }
    }

    fn next_lock_id(&self) -> u64 {
        self.next_lock_id.fetch_add(1, Ordering::Relaxed)
    }

    fn consume_leaf_forward(
        inner: &NodeInner,
        enter: &RangeBound,
        end: &RangeBound,
        limit: usize,
        results: &mut Vec<EntryKey>,
    ) -> LeafScan {
        let mut last_in_leaf = None;
        for node_entry in inner.entries.iter() {
            last_in_leaf = Some(node_entry.key.clone());
            if !enter.admits_from(&node_entry.key) {
                continue;
            }
            if !end.admits_until(&node_entry.key) {
                return LeafScan {
                    done: true,
                    last_in_leaf,
                    lock_end: end.clone(),
                };
            }
            results.push(node_entry.key.clone());
            if results.len() >= limit {
                return LeafScan {
                    done: true,
                    last_in_leaf: Some(node_entry.key.clone()),
                    lock_end: RangeBound::at(node_entry.key.clone(), true),
                };
            }
        }
        let lock_end = match &last_in_leaf {
            Some(last) => RangeBound::at(last.clone(), true),
            None => enter.clone(),
        };
        LeafScan {
            done: false,
            last_in_leaf,
            lock_end,
        }
    }

    /// Forward range scan. With an effect log, every consumed leaf
    /// interval is covered by a key-range lock recorded in the log.
    pub fn scan_forward(
        &self,
        tran: &TranIdentity,
        start: RangeBound,
        end: RangeBound,
        limit: usize,
        mut lock_log: Option<&mut EffectLog>,
    ) -> Vec<EntryKey> {
        let _epoch = self.epoch.enter();
        let mut results = Vec::new();
        let mut enter = start;
        let mut leaf_handle = self.find_leaf(&enter, true);

        loop {
            let node = self.arena.get(leaf_handle);
            if !node.is_published() {
                leaf_handle = self.find_leaf(&enter, true);
                continue;
            }
            let (outcome, next) = if let Some(log) = lock_log.as_deref_mut() {
                let mut guard = node.inner.write();
                if !guard.leaf {
                    leaf_handle = self.find_leaf(&enter, true);
                    continue;
                }
                let outcome = Self::consume_leaf_forward(&guard, &enter, &end, limit, &mut results);
                let lock_id = self.next_lock_id();
                node.begin_mutation();
                guard.ranges.push(KeyRangeLock {
                    lock_id,
                    start: enter.clone(),
                    end: outcome.lock_end.clone(),
                    owner: tran.id.as_raw(),
                });
                log.range_locks.push(RangeLockRef {
                    class_id: self.class_id,
                    index_pos: self.index_pos,
                    node: leaf_handle,
                    lock_id,
                });
                (outcome, node.right())
            } else {
                let guard = node.inner.read();
                if !guard.leaf {
                    leaf_handle = self.find_leaf(&enter, true);
                    continue;
                }
                let outcome = Self::consume_leaf_forward(&guard, &enter, &end, limit, &mut results);
                (outcome, node.right())
            };

            if outcome.done || results.len() >= limit || next.is_null() {
                break;
            }
            match outcome.last_in_leaf {
                Some(last) => enter = RangeBound::at(last, false),
                None => {}
            }
            leaf_handle = next;
        }
        results
    }

    fn consume_leaf_backward(
        inner: &NodeInner,
        enter: &RangeBound,
        start: &RangeBound,
        limit: usize,
        results: &mut Vec<EntryKey>,
    ) -> LeafScan {
        let mut last_in_leaf = None;
        for node_entry in inner.entries.iter().rev() {
            last_in_leaf = Some(node_entry.key.clone());
            if !enter.admits_until(&node_entry.key) {
                continue;
            }
            if !start.admits_from(&node_entry.key) {
                return LeafScan {
                    done: true,
                    last_in_leaf,
                    lock_end: start.clone(),
                };
            }
            results.push(node_entry.key.clone());
            if results.len() >= limit {
                return LeafScan {
                    done: true,
                    last_in_leaf: Some(node_entry.key.clone()),
                    lock_end: RangeBound::at(node_entry.key.clone(), true),
                };
            }
        }
        let lock_end = match &last_in_leaf {
            Some(last) => RangeBound::at(last.clone(), true),
            None => enter.clone(),
        };
        LeafScan {
            done: false,
            last_in_leaf,
            lock_end,
        }
    }

    /// Backward range scan; results come out in descending order. Range
    /// locks cover the interval about to be consumed, symmetric to the
    /// forward case.
    pub fn scan_backward(
        &self,
        tran: &TranIdentity,
        start: RangeBound,
        end: RangeBound,
        limit: usize,
        mut lock_log: Option<&mut EffectLog>,
    ) -> Vec<EntryKey> {
        let _epoch = self.epoch.enter();
        let mut results = Vec::new();
        let mut enter = end;
        let mut leaf_handle = self.find_leaf(&enter, false);

        loop {
            let node = self.arena.get(leaf_handle);
            if !node.is_published() {
                leaf_handle = self.find_leaf(&enter, false);
                continue;
            }
            let (outcome, next) = if let Some(log) = lock_log.as_deref_mut() {
                let mut guard = node.inner.write();
                if !guard.leaf {
                    leaf_handle = self.find_leaf(&enter, false);
                    continue;
                }
                let outcome = Self::consume_leaf_backward(&guard, &enter, &start, limit, &mut results);
                let lock_id = self.next_lock_id();
                node.begin_mutation();
                guard.ranges.push(KeyRangeLock {
                    lock_id,
                    start: outcome.lock_end.clone(),
                    end: enter.clone(),
                    owner: tran.id.as_raw(),
                });
                log.range_locks.push(RangeLockRef {
                    class_id: self.class_id,
                    index_pos: self.index_pos,
                    node: leaf_handle,
                    lock_id,
                });
                (outcome, node.left())
            } else {
                let guard = node.inner.read();
                if !guard.leaf {
                    leaf_handle = self.find_leaf(&enter, false);
                    continue;
                }
                let outcome = Self::consume_leaf_backward(&guard, &enter, &start, limit, &mut results);
                (outcome, node.left())
            };

            if outcome.done || results.len() >= limit || next.is_null() {
                break;
            }
            match outcome.last_in_leaf {
                Some(last) => enter = RangeBound::at(last, false),
                None => {}
            }
            leaf_handle = next;
        }
        results
    }

    // =========================================================================
    // Range-lock maintenance
    // =========================================================================

    /// Visit every node that may host copies of a range lock: the
    /// recorded anchor, its left neighbor (merges move ranges left), and
    /// the right chain (splits copy ranges right).
    fn range_hosts(&self, anchor: RecordHandle) -> Vec<RecordHandle> {
        let mut hosts = Vec::new();
        let node = self.arena.get(anchor);
        let left = node.left();
        if !left.is_null() {
            hosts.push(left);
        }
        hosts.push(anchor);
        let mut cursor = node.right();
        let mut hops = 0;
        while !cursor.is_null() && hops < 16 {
            hosts.push(cursor);
            cursor = self.arena.get(cursor).right();
            hops += 1;
        }
        // The anchor may have been grouped onto its parent
        let parent = node.parent();
        if !parent.is_null() {
            hosts.push(parent);
        }
        hosts
    }

    /// Overwrite a range lock's owner with the commit version.
    pub fn finalize_range(&self, anchor: RecordHandle, lock_id: u64, commit_version: u64) {
        for host in self.range_hosts(anchor) {
            let node = self.arena.get(host);
            let mut guard = node.inner.write();
            for range in guard.ranges.iter_mut() {
                if range.lock_id == lock_id {
                    range.owner = commit_version;
                }
            }
        }
    }

    /// Remove a transaction's range lock (rollback).
    pub fn release_range(&self, anchor: RecordHandle, lock_id: u64) {
        for host in self.range_hosts(anchor) {
            let node = self.arena.get(host);
            let mut guard = node.inner.write();
            let before = guard.ranges.len();
            guard.ranges.retain(|range| range.lock_id != lock_id);
            if guard.ranges.len() != before {
                node.begin_mutation();
            }
        }
    }

    /// Collapse consecutive acquired ranges anchored on leaves sharing a
    /// parent into a single envelope range on that parent, bounding a
    /// transaction's range memory by the depth of the tree.
    pub fn group_ranges(&self, log: &mut EffectLog) {
        let mut index = 0;
        while index + 1 < log.range_locks.len() {
            let first = log.range_locks[index];
            let second = log.range_locks[index + 1];
            let same_index = first.class_id == self.class_id
                && second.class_id == self.class_id
                && first.index_pos == self.index_pos
                && second.index_pos == self.index_pos;
            if !same_index || first.node == second.node {
                index += 1;
                continue;
            }
            let first_parent = self.arena.get(first.node).parent();
            let second_parent = self.arena.get(second.node).parent();
            if first_parent.is_null() || first_parent != second_parent {
                index += 1;
                continue;
            }
            let Some(first_range) = self.extract_range(first.node, first.lock_id) else {
                index += 1;
                continue;
            };
            let Some(second_range) = self.extract_range(second.node, second.lock_id) else {
                // Re-anchor the survivor on the parent alone
                let lock_id = self.install_envelope(first_parent, first_range.start, first_range.end, first_range.owner);
                log.range_locks[index] = RangeLockRef {
                    class_id: self.class_id,
                    index_pos: self.index_pos,
                    node: first_parent,
                    lock_id,
                };
                index += 1;
                continue;
            };
            let lock_id =
                self.install_envelope(first_parent, first_range.start, second_range.end, first_range.owner);
            log.range_locks[index] = RangeLockRef {
                class_id: self.class_id,
                index_pos: self.index_pos,
                node: first_parent,
                lock_id,
            };
            log.range_locks.remove(index + 1);
            // Keep trying to absorb further ranges into this envelope
        }
    }

    fn install_envelope(&self, node_handle: RecordHandle, start: RangeBound, end: RangeBound, owner: u64) -> u64 {
        let lock_id = self.next_lock_id();
        let node = self.arena.get(node_handle);
        let mut guard = node.inner.write();
        node.begin_mutation();
        guard.ranges.push(KeyRangeLock {
            lock_id,
            start,
            end,
            owner,
        });
        lock_id
    }

    fn extract_range(&self, anchor: RecordHandle, lock_id: u64) -> Option<KeyRangeLock> {
        let mut found = None;
        for host in self.range_hosts(anchor) {
            let node = self.arena.get(host);
            let mut guard = node.inner.write();
            if let Some(position) = guard.ranges.iter().position(|r| r.lock_id == lock_id) {
                node.begin_mutation();
                let range = guard.ranges.remove(position);
                guard.ranges.retain(|r| r.lock_id != lock_id);
                if found.is_none() {
                    found = Some(range);
                }
            }
        }
        found
    }

    /// Drop committed range locks no live snapshot can still conflict
    /// with (background GC).
    pub fn sweep_ranges(&self, watermark: u64) {
        let root = *self.root.read();
        self.sweep_ranges_node(root, watermark);
    }

    fn sweep_ranges_node(&self, handle: RecordHandle, watermark: u64) {
        let node = self.arena.get(handle);
        let children: Vec<RecordHandle> = {
            let mut guard = node.inner.write();
            let before = guard.ranges.len();
            guard
                .ranges
                .retain(|range| !(range.is_committed() && range.owner <= watermark));
            if guard.ranges.len() != before {
                node.begin_mutation();
            }
            if guard.leaf {
                Vec::new()
            } else {
                guard.entries.iter().map(|e| e.child).collect()
            }
        };
        for child in children {
            self.sweep_ranges_node(child, watermark);
        }
    }

    // =========================================================================
    // Introspection (tests and verification)
    // =========================================================================

    /// In-order walk of every leaf entry.
    pub fn collect_in_order(&self) -> Vec<EntryKey> {
        let _epoch = self.epoch.enter();
        let mut handle = self.find_leaf(&RangeBound::unbounded(), true);
        let mut out = Vec::new();
        loop {
            let node = self.arena.get(handle);
            let guard = node.inner.read();
            for node_entry in guard.entries.iter() {
                out.push(node_entry.key.clone());
            }
            let next = node.right();
            drop(guard);
            if next.is_null() {
                break;
            }
            handle = next;
        }
        out
    }

    /// Number of levels.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut handle = *self.root.read();
        loop {
            let node = self.arena.get(handle);
            let guard = node.inner.read();
            if guard.leaf {
                return depth;
            }
            handle = guard.entries[0].child;
            depth += 1;
        }
    }

    /// Structural invariants: ordering within nodes, separator copies
    /// equal to subtree maxima, minimum fill, parent pointers, uniform
    /// leaf depth. Test/verification hook; not concurrency-safe.
    pub fn check_invariants(&self) -> Result<(), String> {
        let root = *self.root.read();
        let mut leaf_depths = Vec::new();
        self.check_node(root, RecordHandle::NULL, true, 1, &mut leaf_depths)?;
        if let (Some(min), Some(max)) = (leaf_depths.iter().min(), leaf_depths.iter().max()) {
            if min != max {
                return Err(format!("leaf depths differ: {} vs {}", min, max));
            }
        }
        Ok(())
    }

    fn check_node(
        &self,
        handle: RecordHandle,
        expected_parent: RecordHandle,
        is_root: bool,
        depth: usize,
        leaf_depths: &mut Vec<usize>,
    ) -> Result<Option<EntryKey>, String> {
        let node = self.arena.get(handle);
        if node.parent() != expected_parent {
            return Err(format!("node {} has a wrong parent pointer", handle));
        }
        let guard = node.inner.read();
        if !is_root && guard.entries.len() < self.min_entries() {
            return Err(format!("node {} under minimum fill: {}", handle, guard.entries.len()));
        }
        for window in guard.entries.windows(2) {
            if window[0].key >= window[1].key {
                return Err(format!("node {} entries out of order", handle));
            }
        }
        if guard.leaf {
            leaf_depths.push(depth);
            return Ok(guard.entries.last().map(|e| e.key.clone()));
        }
        let mut subtree_max = None;
        for node_entry in guard.entries.iter() {
            let child_max =
                self.check_node(node_entry.child, handle, false, depth + 1, leaf_depths)?;
            if !node_entry.key.is_sentinel() {
                match &child_max {
                    Some(max) if *max == node_entry.key => {}
                    other => {
                        return Err(format!(
                            "separator on node {} does not match subtree max ({:?})",
                            handle, other
                        ))
                    }
                }
            }
            subtree_max = child_max.or(subtree_max);
        }
        Ok(subtree_max)
    }

    /// Total number of entries (leaf walk).
    pub fn entry_count(&self) -> usize {
        self.collect_in_order().len()
    }

    /// Remove every entry and reset to a single empty leaf (drop-class).
    pub fn clear(&self) {
        let mut root = self.root.write();
        let new_handle = self.arena.allocate();
        self.arena.publish(new_handle);
        // Old nodes are reclaimed wholesale through the epoch service
        self.collect_subtree(*root);
        *root = new_handle;
    }

    fn collect_subtree(&self, handle: RecordHandle) {
        let children: Vec<RecordHandle> = {
            let node = self.arena.get(handle);
            let guard = node.inner.read();
            if guard.leaf {
                Vec::new()
            } else {
                guard.entries.iter().map(|e| e.child).collect()
            }
        };
        for child in children {
            self.collect_subtree(child);
        }
        self.retire_node(handle);
    }
}

#[cfg(test)]
mod tests;
