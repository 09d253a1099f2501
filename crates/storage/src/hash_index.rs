//! Secondary hash index
//!
//! Maps a composite key to object handles. Collision items store only the
//! handle of the version that wrote them; the key is re-derived from the
//! referenced record on every comparison, so keys are never stored twice.
//!
//! Phantom prevention: read-write lookups install a key-read lock in a
//! side table; inserts of a key conflict with live foreign readers of
//! that key.

use crate::arena::Slab;
use crate::bucket::BucketTable;
use crate::effects::{EffectLog, KeyReadLock};
use crate::heap::{ClassHeap, VisibleObject};
use crate::key::{IndexKey, KeyReader};
use crate::resize::ParallelGate;
use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use velox_core::error::{DbError, DbResult};
use velox_core::model::HashIndexMeta;
use velox_core::tran::{SlotTable, TranIdentity, TranSlot};
use velox_core::types::{ObjectId, RecordHandle};

/// One collision item: the record handle plus the collision link.
#[derive(Default)]
struct HashItem {
    handle: AtomicU64,
    next: AtomicU64,
}

/// A secondary hash index over one class.
pub struct HashIndex {
    class_name: String,
    meta: HashIndexMeta,
    index_pos: usize,
    arena: Slab<HashItem>,
    buckets: RwLock<Arc<BucketTable>>,
    used_buckets: AtomicU64,
    entry_count: AtomicU64,
    key_locks: DashMap<IndexKey, SmallVec<[TranSlot; 2]>>,
    load_factor: f64,
}

impl HashIndex {
    /// Create an index.
    pub fn new(
        class_name: String,
        meta: HashIndexMeta,
        index_pos: usize,
        pool: u8,
        initial_buckets: usize,
        load_factor: f64,
    ) -> Self {
        HashIndex {
            class_name,
            meta,
            index_pos,
            arena: Slab::new(pool),
            buckets: RwLock::new(Arc::new(BucketTable::new(initial_buckets.next_power_of_two()))),
            used_buckets: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            key_locks: DashMap::new(),
            load_factor,
        }
    }

    /// Index descriptor.
    pub fn meta(&self) -> &HashIndexMeta {
        &self.meta
    }

    /// Number of entries.
    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    #[inline]
    fn current_table(&self) -> Arc<BucketTable> {
        Arc::clone(&self.buckets.read())
    }

    fn conflict(&self) -> DbError {
        DbError::index_conflict(self.class_name.clone(), self.meta.name.clone())
    }

    /// Whether a live foreign transaction holds a key-read lock on `key`.
    fn key_locked_by_other(&self, key: &IndexKey, tran: &TranIdentity, slots: &SlotTable) -> bool {
        if let Some(owners) = self.key_locks.get(key) {
            owners
                .iter()
                .any(|slot| *slot != tran.slot && slots.is_live(*slot) && slots.commit_version_of(*slot) == 0)
        } else {
            false
        }
    }

    /// Insert an entry for a record version.
    ///
    /// With uniqueness enforcement, the target bucket is walked first: a
    /// visible foreign object with an equal key is a uniqueness violation,
    /// an uncommitted foreign entry an index conflict. Inserts also
    /// conflict with keys observed by live read-write readers.
    pub fn insert(
        &self,
        tran: &TranIdentity,
        slots: &SlotTable,
        heap: &ClassHeap,
        reader: &KeyReader,
        id: ObjectId,
        handle: RecordHandle,
        key: &IndexKey,
    ) -> DbResult<()> {
        if self.key_locked_by_other(key, tran, slots) {
            return Err(self.conflict());
        }

        let table = self.current_table();
        let index = table.index_of(key.hash_u64());
        let mut guard = table.lock(index);

        if self.meta.unique {
            let mut cursor = guard.head();
            while !cursor.is_null() {
                let item = self.arena.get(cursor);
                let other_handle = RecordHandle::from_raw(item.handle.load(Ordering::Acquire));
                cursor = RecordHandle::from_raw(item.next.load(Ordering::Acquire));

                let other = heap.record(other_handle);
                let other_id = other.id();
                if other_id.is_null() || other_id == id {
                    continue;
                }
                // The key is re-derived from the referenced record
                let other_key = reader.read(&other.payload());
                if other_key != *key {
                    continue;
                }
                let version = other.version();
                if version.is_uncommitted() {
                    if !version.is_owned_by(tran.id) {
                        return Err(self.conflict());
                    }
                    return Err(DbError::UniquenessViolation {
                        object_id: id,
                        class: self.class_name.clone(),
                        index: self.meta.name.clone(),
                    });
                }
                // Committed entry: only the visible state of its id counts
                if let Some(visible) = heap.read_visible(tran.id, tran.read_version, other_id) {
                    if !visible.deleted && reader.read(&visible.values) == *key {
                        return Err(DbError::UniquenessViolation {
                            object_id: id,
                            class: self.class_name.clone(),
                            index: self.meta.name.clone(),
                        });
                    }
                }
            }
        }

        let item_handle = self.arena.allocate();
        let item = self.arena.get(item_handle);
        item.handle.store(handle.as_raw(), Ordering::Relaxed);
        let head = guard.head();
        item.next.store(head.as_raw(), Ordering::Relaxed);
        self.arena.publish(item_handle);
        if head.is_null() {
            self.used_buckets.fetch_add(1, Ordering::Relaxed);
        }
        guard.set_head(item_handle);
        self.entry_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Unlink an entry by record handle. Idempotent: removing an entry
    /// that is not present is a no-op.
    pub fn remove(&self, key: &IndexKey, handle: RecordHandle) {
        let table = self.current_table();
        let index = table.index_of(key.hash_u64());
        let mut guard = table.lock(index);

        let mut prev: Option<RecordHandle> = None;
        let mut cursor = guard.head();
        while !cursor.is_null() {
            let item = self.arena.get(cursor);
            let next = RecordHandle::from_raw(item.next.load(Ordering::Acquire));
            if RecordHandle::from_raw(item.handle.load(Ordering::Acquire)) == handle {
                match prev {
                    Some(p) => self.arena.get(p).next.store(next.as_raw(), Ordering::Release),
                    None => {
                        guard.set_head(next);
                        if next.is_null() {
                            self.used_buckets.fetch_sub(1, Ordering::Relaxed);
                        }
                    }
                }
                item.handle.store(0, Ordering::Relaxed);
                item.next.store(0, Ordering::Relaxed);
                self.arena.retire(cursor);
                self.entry_count.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            prev = Some(cursor);
            cursor = next;
        }
    }

    /// Rewrite the record handle inside a collision item (in-place model
    /// updates); no structural change.
    pub fn replace_handle(&self, key: &IndexKey, old: RecordHandle, new: RecordHandle) {
        let table = self.current_table();
        let index = table.index_of(key.hash_u64());
        let _guard = table.lock(index);
        let mut cursor = _guard.head();
        while !cursor.is_null() {
            let item = self.arena.get(cursor);
            if RecordHandle::from_raw(item.handle.load(Ordering::Acquire)) == old {
                item.handle.store(new.as_raw(), Ordering::Release);
                return;
            }
            cursor = RecordHandle::from_raw(item.next.load(Ordering::Acquire));
        }
    }

    /// Snapshot lookup of all objects currently carrying `key`.
    ///
    /// Entries resolve through the object heap: an item only surfaces when
    /// the visible version of its id still carries the queried key. A
    /// read-write transaction additionally takes per-object reader locks
    /// and a key-read lock for phantom prevention.
    pub fn get_entries(
        &self,
        tran: &TranIdentity,
        heap: &ClassHeap,
        reader: &KeyReader,
        key: &IndexKey,
        log: Option<&mut EffectLog>,
    ) -> Vec<(ObjectId, VisibleObject)> {
        let table = self.current_table();
        let index = table.index_of(key.hash_u64());

        // Collect candidate ids under the bucket lock, resolve after.
        let mut candidates: SmallVec<[ObjectId; 8]> = SmallVec::new();
        {
            let guard = table.lock(index);
            let mut cursor = guard.head();
            while !cursor.is_null() {
                let item = self.arena.get(cursor);
                let handle = RecordHandle::from_raw(item.handle.load(Ordering::Acquire));
                let rec = heap.record(handle);
                let id = rec.id();
                if !id.is_null() && !candidates.contains(&id) {
                    candidates.push(id);
                }
                cursor = RecordHandle::from_raw(item.next.load(Ordering::Acquire));
            }
        }

        let mut results = Vec::new();
        match log {
            Some(log) => {
                for id in candidates {
                    if let Some(visible) = heap.read_and_lock(tran, id, log) {
                        if !visible.deleted && reader.read(&visible.values) == *key {
                            results.push((id, visible));
                        }
                    }
                }
                self.key_locks.entry(key.clone()).or_default().push(tran.slot);
                log.key_read_locks.push(KeyReadLock {
                    class_id: heap.class_id(),
                    index_pos: self.index_pos,
                    key: key.clone(),
                });
            }
            None => {
                for id in candidates {
                    if let Some(visible) = heap.read_visible(tran.id, tran.read_version, id) {
                        if !visible.deleted && reader.read(&visible.values) == *key {
                            results.push((id, visible));
                        }
                    }
                }
            }
        }
        results
    }

    /// Drop a transaction's key-read lock.
    pub fn release_key_lock(&self, key: &IndexKey, slot: TranSlot) {
        if let Some(mut owners) = self.key_locks.get_mut(key) {
            owners.retain(|s| *s != slot);
            if owners.is_empty() {
                drop(owners);
                self.key_locks.remove_if(key, |_, owners| owners.is_empty());
            }
        }
    }

    /// Move a key-read lock to a new slot (replication slot remapping).
    pub fn remap_key_lock(&self, key: &IndexKey, old: TranSlot, new: TranSlot) {
        if let Some(mut owners) = self.key_locks.get_mut(key) {
            for owner in owners.iter_mut() {
                if *owner == old {
                    *owner = new;
                }
            }
        }
    }

    /// Partition the collision-item space for parallel verification.
    pub fn split_scan_range(&self, parts: usize) -> Vec<std::ops::Range<u64>> {
        self.arena.scan_ranges(parts)
    }

    /// Verify the uniqueness constraint over the whole index (index build
    /// verification). Uses the latest committed state.
    pub fn verify_unique(&self, heap: &ClassHeap, reader: &KeyReader) -> DbResult<()> {
        if !self.meta.unique {
            return Ok(());
        }
        let mut seen: rustc_hash::FxHashMap<IndexKey, ObjectId> = rustc_hash::FxHashMap::default();
        let table = self.current_table();
        for index in 0..table.capacity() {
            let mut cursor = table.head(index);
            while !cursor.is_null() {
                let item = self.arena.get(cursor);
                let handle = RecordHandle::from_raw(item.handle.load(Ordering::Acquire));
                cursor = RecordHandle::from_raw(item.next.load(Ordering::Acquire));
                let rec = heap.record(handle);
                let id = rec.id();
                if id.is_null() || rec.is_deleted() {
                    continue;
                }
                let key = reader.read(&rec.payload());
                if let Some(existing) = seen.insert(key, id) {
                    if existing != id {
                        return Err(DbError::UniquenessViolation {
                            object_id: id,
                            class: self.class_name.clone(),
                            index: self.meta.name.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Resize when the used-bucket count crosses the load factor; the
    /// caller provides the class gate.
    pub fn maybe_resize(&self, gate: &ParallelGate, heap: &ClassHeap, reader: &KeyReader) {
        let capacity = self.current_table().capacity();
        if (self.used_buckets.load(Ordering::Relaxed) as f64) < capacity as f64 * self.load_factor {
            return;
        }
        let _exclusive = gate.exclusive();

        let old = self.current_table();
        if old.capacity() != capacity {
            return;
        }
        let new = BucketTable::new(capacity * 2);
        let mut used = 0u64;
        for index in 0..old.capacity() {
            let mut cursor = old.head(index);
            while !cursor.is_null() {
                let item = self.arena.get(cursor);
                let next = RecordHandle::from_raw(item.next.load(Ordering::Acquire));
                let handle = RecordHandle::from_raw(item.handle.load(Ordering::Acquire));
                let rec = heap.record(handle);
                let key = reader.read(&rec.payload());
                let new_index = new.index_of(key.hash_u64());
                let mut guard = new.lock(new_index);
                let head = guard.head();
                item.next.store(head.as_raw(), Ordering::Release);
                if head.is_null() {
                    used += 1;
                }
                guard.set_head(cursor);
                drop(guard);
                cursor = next;
            }
        }
        self.used_buckets.store(used, Ordering::Relaxed);
        *self.buckets.write() = Arc::new(new);
        debug!(class = %self.class_name, index = %self.meta.name, capacity = capacity * 2, "hash index resized");
    }

    /// Remove every entry (drop-class).
    pub fn clear(&self) {
        let table = self.current_table();
        for index in 0..table.capacity() {
            let mut guard = table.lock(index);
            let mut cursor = guard.head();
            guard.set_head(RecordHandle::NULL);
            drop(guard);
            while !cursor.is_null() {
                let item = self.arena.get(cursor);
                let next = RecordHandle::from_raw(item.next.load(Ordering::Acquire));
                item.handle.store(0, Ordering::Relaxed);
                item.next.store(0, Ordering::Relaxed);
                self.arena.retire(cursor);
                cursor = next;
            }
        }
        self.used_buckets.store(0, Ordering::Relaxed);
        self.entry_count.store(0, Ordering::Relaxed);
        self.key_locks.clear();
    }
}
