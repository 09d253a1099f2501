//! Per-class object heap
//!
//! An open-addressed bucket table maps object id to the head of its
//! version chain. All versions of one id form a singly linked chain from
//! newest to oldest through the older-version link; distinct ids within a
//! bucket link through the collision pointer of their newest version only.
//!
//! Mutations to a bucket's chains happen under that bucket's lock word.
//! Readers locate versions optimistically: walk the chain without the
//! lock, validate the located slot's sequence counter around the payload
//! read, and fall back to the locked path on any instability.

use crate::arena::{Slab, SlotRef};
use crate::bucket::{BucketGuard, BucketTable};
use crate::effects::{AffectedObject, EffectLog, ObjectReadLock, WriteKind};
use crate::record::ObjectRecord;
use crate::resize::ParallelGate;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use velox_core::error::{DbError, DbResult};
use velox_core::tran::{SlotTable, TranIdentity};
use velox_core::types::{ClassId, ObjectId, RecordHandle};
use velox_core::value::{mix64, PropertyValue};
use velox_core::version::{TranId, Version};

/// A version made visible to a snapshot.
#[derive(Debug, Clone)]
pub struct VisibleObject {
    /// Handle of the visible version.
    pub handle: RecordHandle,
    /// Version word of the visible version.
    pub version: Version,
    /// Whether the visible version is a deletion.
    pub deleted: bool,
    /// Property payload of the visible version.
    pub values: Vec<PropertyValue>,
}

/// Outcome of an update or delete write.
#[derive(Debug)]
pub struct WriteOutcome {
    /// Handle of the uncommitted version carrying the write.
    pub handle: RecordHandle,
    /// Whether the write merged into an existing uncommitted version
    /// instead of prepending a new one.
    pub merged: bool,
    /// Payload before the write.
    pub old_values: Vec<PropertyValue>,
    /// Payload after the write.
    pub new_values: Vec<PropertyValue>,
}

/// The per-class object heap.
pub struct ClassHeap {
    class_id: ClassId,
    class_name: String,
    arena: Slab<ObjectRecord>,
    buckets: RwLock<Arc<BucketTable>>,
    used_buckets: AtomicU64,
    object_count: AtomicU64,
    /// Parallel resize gate; data-path operations hold the read side.
    pub gate: ParallelGate,
    load_factor: f64,
}

impl ClassHeap {
    /// Create the heap for a class.
    pub fn new(class_id: ClassId, class_name: String, pool: u8, initial_buckets: usize, load_factor: f64) -> Self {
        ClassHeap {
            class_id,
            class_name,
            arena: Slab::new(pool),
            buckets: RwLock::new(Arc::new(BucketTable::new(initial_buckets.next_power_of_two()))),
            used_buckets: AtomicU64::new(0),
            object_count: AtomicU64::new(0),
            gate: ParallelGate::new(),
            load_factor,
        }
    }

    /// Class this heap belongs to.
    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    /// Class name, for error context.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Number of live objects (ids, not versions).
    pub fn object_count(&self) -> u64 {
        self.object_count.load(Ordering::Relaxed)
    }

    /// Dereference a record handle.
    pub fn record(&self, handle: RecordHandle) -> SlotRef<ObjectRecord> {
        self.arena.get(handle)
    }

    /// Pre-allocate record slots for a batch insert.
    pub fn allocate_batch(&self, count: usize, out: &mut Vec<RecordHandle>) {
        self.arena.allocate_batch(count, out);
    }

    #[inline]
    fn current_table(&self) -> Arc<BucketTable> {
        Arc::clone(&self.buckets.read())
    }

    #[inline]
    fn bucket_of(table: &BucketTable, id: ObjectId) -> usize {
        table.index_of(mix64(id.as_u64()))
    }

    /// Walk a collision chain for an id. Returns the newest version handle,
    /// its record, and the predecessor in the collision chain.
    fn locate_in_chain(
        &self,
        head: RecordHandle,
        id: ObjectId,
    ) -> Option<(RecordHandle, SlotRef<ObjectRecord>, Option<RecordHandle>)> {
        let mut prev = None;
        let mut cur = head;
        while !cur.is_null() {
            let rec = self.arena.get(cur);
            if rec.id() == id {
                return Some((cur, rec, prev));
            }
            prev = Some(cur);
            cur = rec.next_in_bucket();
        }
        None
    }

    /// Walk a version chain down to the version visible to the snapshot.
    fn visible_version(
        &self,
        newest: RecordHandle,
        tran: TranId,
        read_version: u64,
    ) -> Option<(RecordHandle, SlotRef<ObjectRecord>)> {
        let mut cur = newest;
        while !cur.is_null() {
            let rec = self.arena.get(cur);
            if rec.is_visible_to(tran, read_version) {
                return Some((cur, rec));
            }
            cur = rec.older();
        }
        None
    }

    fn capture(rec: &SlotRef<ObjectRecord>) -> VisibleObject {
        VisibleObject {
            handle: RecordHandle::NULL, // patched by callers that know it
            version: rec.version(),
            deleted: rec.is_deleted(),
            values: rec.payload_clone(),
        }
    }

    /// Snapshot read of an id, including deletion versions.
    ///
    /// Optimistic fast path with sequence validation; any instability
    /// (torn chain, slot reuse, miss) falls back to the bucket lock.
    pub fn read_visible(&self, tran: TranId, read_version: u64, id: ObjectId) -> Option<VisibleObject> {
        let table = self.current_table();
        let index = Self::bucket_of(&table, id);

        for _ in 0..3 {
            let head = table.head(index);
            let (newest, _, _) = match self.locate_in_chain(head, id) {
                Some(found) => found,
                None => break, // confirm the miss under the lock
            };
            let (handle, rec) = match self.visible_version(newest, tran, read_version) {
                Some(found) => found,
                None => break,
            };
            let seq = rec.sequence();
            if seq & 1 == 0 {
                continue; // slot retired mid-walk
            }
            let mut out = Self::capture(&rec);
            out.handle = handle;
            // Full fence between the payload read and the counter re-read
            if rec.sequence_validate() == seq && rec.id() == id {
                return Some(out);
            }
        }

        // Locked confirmation path
        let guard = table.lock(index);
        let (newest, _, _) = self.locate_in_chain(guard.head(), id)?;
        let (handle, rec) = self.visible_version(newest, tran, read_version)?;
        let mut out = Self::capture(&rec);
        out.handle = handle;
        Some(out)
    }

    /// Read-write snapshot read: locates the visible version under the
    /// bucket lock and parks a reader lock on it.
    pub fn read_and_lock(
        &self,
        tran: &TranIdentity,
        id: ObjectId,
        log: &mut EffectLog,
    ) -> Option<VisibleObject> {
        let table = self.current_table();
        let index = Self::bucket_of(&table, id);
        let guard = table.lock(index);
        let (newest, _, _) = self.locate_in_chain(guard.head(), id)?;
        let (handle, rec) = self.visible_version(newest, tran.id, tran.read_version)?;

        rec.locks().add(tran.slot);
        log.object_read_locks.push(ObjectReadLock {
            class_id: self.class_id,
            handle,
        });

        let mut out = Self::capture(&rec);
        out.handle = handle;
        Some(out)
    }

    /// Write-conflict rules against the newest version of an id:
    /// uncommitted foreign owner, committed version beyond the snapshot,
    /// or a reader lock from a live transaction whose commit version is
    /// not yet compatible with ours.
    fn check_write_conflict(
        &self,
        rec: &SlotRef<ObjectRecord>,
        tran: &TranIdentity,
        slots: &SlotTable,
        id: ObjectId,
    ) -> DbResult<()> {
        let version = rec.version();
        if version.is_owned_by(tran.id) {
            return Ok(());
        }
        if version.is_uncommitted() {
            return Err(DbError::conflict(id, self.class_name.clone()));
        }
        let commit_version = version.commit_version().expect("committed word");
        if commit_version > tran.read_version {
            return Err(DbError::conflict(id, self.class_name.clone()));
        }
        let locks = rec.locks();
        if locks.committed_boundary > tran.read_version {
            return Err(DbError::conflict(id, self.class_name.clone()));
        }
        for owner in locks.owners.iter() {
            if *owner == tran.slot || !slots.is_live(*owner) {
                continue;
            }
            let owner_commit = slots.commit_version_of(*owner);
            if owner_commit == 0 || owner_commit > tran.read_version {
                return Err(DbError::conflict(id, self.class_name.clone()));
            }
        }
        Ok(())
    }

    fn link_new_head(&self, guard: &mut BucketGuard<'_>, handle: RecordHandle) {
        let rec = self.arena.get(handle);
        let old_head = guard.head();
        rec.set_next_in_bucket(old_head);
        if old_head.is_null() {
            self.used_buckets.fetch_add(1, Ordering::Relaxed);
        }
        guard.set_head(handle);
    }

    /// Prepend a new version over an existing newest one, replacing it in
    /// the collision chain.
    fn prepend_version(
        &self,
        guard: &mut BucketGuard<'_>,
        predecessor: Option<RecordHandle>,
        old_handle: RecordHandle,
        new_handle: RecordHandle,
    ) {
        let old_rec = self.arena.get(old_handle);
        let new_rec = self.arena.get(new_handle);
        new_rec.set_next_in_bucket(old_rec.next_in_bucket());
        match predecessor {
            Some(pred) => self.arena.get(pred).set_next_in_bucket(new_handle),
            None => guard.set_head(new_handle),
        }
    }

    /// Insert a new object with a pre-allocated record slot.
    ///
    /// Re-inserting an id whose visible newest version is a deletion
    /// prepends a fresh version to the existing chain.
    pub fn insert(
        &self,
        tran: &TranIdentity,
        slots: &SlotTable,
        id: ObjectId,
        handle: RecordHandle,
        payload: Vec<PropertyValue>,
        last_in_tran: bool,
        log: &mut EffectLog,
    ) -> DbResult<()> {
        if id.is_null() {
            return Err(DbError::ZeroId {
                class: self.class_name.clone(),
            });
        }
        let mut version = Version::uncommitted(tran.id);
        if !last_in_tran {
            version = version.with_not_last();
        }

        let table = self.current_table();
        let index = Self::bucket_of(&table, id);
        let mut guard = table.lock(index);

        match self.locate_in_chain(guard.head(), id) {
            None => {
                let rec = self.arena.get(handle);
                rec.init(id, version, false, RecordHandle::NULL, payload);
                self.arena.publish(handle);
                self.link_new_head(&mut guard, handle);
                self.object_count.fetch_add(1, Ordering::Relaxed);
            }
            Some((newest, rec, predecessor)) => {
                self.check_write_conflict(&rec, tran, slots, id)?;
                // Only a visibly deleted id may be re-inserted
                let visible = self.visible_version(newest, tran.id, tran.read_version);
                match visible {
                    Some((_, vrec)) if vrec.is_deleted() => {}
                    Some(_) => {
                        return Err(DbError::NonUniqueId {
                            object_id: id,
                            class: self.class_name.clone(),
                        })
                    }
                    None => {}
                }
                let new_rec = self.arena.get(handle);
                new_rec.init(id, version, false, newest, payload);
                self.arena.publish(handle);
                self.prepend_version(&mut guard, predecessor, newest, handle);
            }
        }
        drop(guard);

        log.affected_objects.push(AffectedObject {
            class_id: self.class_id,
            handle,
            kind: WriteKind::Insert,
        });
        Ok(())
    }

    /// Update or delete an id.
    ///
    /// When the newest version is already this transaction's own and no
    /// newer version links it, the write merges in place; otherwise a new
    /// uncommitted version is prepended to the chain.
    pub fn write(
        &self,
        tran: &TranIdentity,
        slots: &SlotTable,
        id: ObjectId,
        apply: &mut dyn FnMut(&mut Vec<PropertyValue>),
        delete: bool,
        last_in_tran: bool,
        log: &mut EffectLog,
    ) -> DbResult<WriteOutcome> {
        let not_exists = || {
            if delete {
                DbError::DeleteNonExistent {
                    object_id: id,
                    class: self.class_name.clone(),
                }
            } else {
                DbError::UpdateNonExistent {
                    object_id: id,
                    class: self.class_name.clone(),
                }
            }
        };

        let table = self.current_table();
        let index = Self::bucket_of(&table, id);
        let mut guard = table.lock(index);

        let (newest, rec, predecessor) = self.locate_in_chain(guard.head(), id).ok_or_else(not_exists)?;
        self.check_write_conflict(&rec, tran, slots, id)?;

        if rec.version().is_owned_by(tran.id) {
            // Merge in place: long transactions do not grow version chains.
            if rec.is_deleted() {
                return Err(not_exists());
            }
            let old_values = rec.payload_clone();
            {
                let mut payload = rec.payload_mut();
                apply(&mut *payload);
            }
            if delete {
                rec.set_deleted(true);
            }
            let new_values = rec.payload_clone();
            return Ok(WriteOutcome {
                handle: newest,
                merged: true,
                old_values,
                new_values,
            });
        }

        // Newest is committed; it must be visible and alive in our snapshot.
        let visible = self
            .visible_version(newest, tran.id, tran.read_version)
            .ok_or_else(not_exists)?;
        if visible.1.is_deleted() {
            return Err(not_exists());
        }
        debug_assert_eq!(visible.0, newest, "a committed newest at or below the snapshot");

        let old_values = rec.payload_clone();
        let mut new_values = old_values.clone();
        apply(&mut new_values);

        let mut version = Version::uncommitted(tran.id);
        if !last_in_tran {
            version = version.with_not_last();
        }

        let new_handle = self.arena.allocate();
        let new_rec = self.arena.get(new_handle);
        new_rec.init(id, version, delete, newest, new_values.clone());
        self.arena.publish(new_handle);
        self.prepend_version(&mut guard, predecessor, newest, new_handle);
        drop(guard);

        log.affected_objects.push(AffectedObject {
            class_id: self.class_id,
            handle: new_handle,
            kind: if delete { WriteKind::Delete } else { WriteKind::Update },
        });
        Ok(WriteOutcome {
            handle: new_handle,
            merged: false,
            old_values,
            new_values,
        })
    }

    /// Commit finalization for one version: rewrite the version word to
    /// the commit version, link the prior version's newer pointer, and
    /// reset reader-lock storage for the record's new role.
    pub fn commit_record(&self, handle: RecordHandle, commit_version: u64) -> ObjectId {
        let rec = self.arena.get(handle);
        let older = rec.older();
        rec.transition_committed(commit_version);
        if !older.is_null() {
            self.arena.get(older).set_newer(handle);
        }
        rec.id()
    }

    /// Rollback of one uncommitted version: unlink it from the version
    /// chain and the bucket chain, and return its payload so the caller
    /// can release interned handles.
    pub fn rollback_record(&self, handle: RecordHandle) -> (ObjectId, Vec<PropertyValue>) {
        let rec = self.arena.get(handle);
        let id = rec.id();
        debug_assert!(rec.version().is_uncommitted());

        let table = self.current_table();
        let index = Self::bucket_of(&table, id);
        let mut guard = table.lock(index);

        let located = self.locate_in_chain(guard.head(), id);
        let (newest, _, predecessor) = located.expect("uncommitted version still linked");
        debug_assert_eq!(newest, handle, "uncommitted versions are chain heads");

        let older = rec.older();
        if older.is_null() {
            // The id disappears entirely
            let next = rec.next_in_bucket();
            match predecessor {
                Some(pred) => self.arena.get(pred).set_next_in_bucket(next),
                None => {
                    guard.set_head(next);
                    if next.is_null() {
                        self.used_buckets.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            }
            self.object_count.fetch_sub(1, Ordering::Relaxed);
        } else {
            let older_rec = self.arena.get(older);
            older_rec.set_next_in_bucket(rec.next_in_bucket());
            older_rec.set_newer(RecordHandle::NULL);
            match predecessor {
                Some(pred) => self.arena.get(pred).set_next_in_bucket(older),
                None => guard.set_head(older),
            }
        }
        drop(guard);

        let payload = rec.payload_clone();
        rec.clear();
        self.arena.retire(handle);
        (id, payload)
    }

    /// Remove a reader lock without committing it out (rollback path).
    pub fn release_reader_lock(&self, handle: RecordHandle, slot: velox_core::tran::TranSlot) {
        if let Some(rec) = self.arena.get_published(handle) {
            rec.locks().remove(slot);
        }
    }

    /// Finalize a reader lock at commit: committed out into the boundary,
    /// or simply dropped when the transaction also wrote the record.
    pub fn commit_reader_lock(
        &self,
        handle: RecordHandle,
        slot: velox_core::tran::TranSlot,
        commit_version: u64,
        also_wrote: bool,
    ) {
        if let Some(rec) = self.arena.get_published(handle) {
            let mut locks = rec.locks();
            if also_wrote {
                locks.remove(slot);
            } else {
                locks.commit_out(slot, commit_version);
            }
        }
    }

    /// Garbage-collect one id: free every version older than the oldest
    /// visible one, and drop the id entirely once its newest visible
    /// version is a sufficiently old deletion.
    ///
    /// Idempotent: a second pass with the same threshold finds nothing.
    pub fn collect_garbage(
        &self,
        id: ObjectId,
        oldest_visible: u64,
        on_free: &mut dyn FnMut(RecordHandle, &[PropertyValue]),
    ) {
        let table = self.current_table();
        let index = Self::bucket_of(&table, id);
        let mut guard = table.lock(index);

        let (newest, _, predecessor) = match self.locate_in_chain(guard.head(), id) {
            Some(found) => found,
            None => return,
        };

        // Find the boundary: the newest committed version at or below the
        // horizon. Everything strictly older is invisible to all snapshots.
        let mut boundary = RecordHandle::NULL;
        let mut cursor = newest;
        while !cursor.is_null() {
            let rec = self.arena.get(cursor);
            if let Some(cv) = rec.version().commit_version() {
                if cv <= oldest_visible {
                    boundary = cursor;
                    break;
                }
            }
            cursor = rec.older();
        }
        if boundary.is_null() {
            return;
        }

        let boundary_rec = self.arena.get(boundary);
        let mut victim = boundary_rec.older();
        boundary_rec.set_older(RecordHandle::NULL);
        while !victim.is_null() {
            let rec = self.arena.get(victim);
            let next = rec.older();
            let payload = rec.payload_clone();
            on_free(victim, &payload);
            rec.clear();
            self.arena.retire(victim);
            victim = next;
        }

        // A deletion boundary that is also the chain head retires the id.
        if boundary == newest && boundary_rec.is_deleted() {
            let next = boundary_rec.next_in_bucket();
            match predecessor {
                Some(pred) => self.arena.get(pred).set_next_in_bucket(next),
                None => {
                    guard.set_head(next);
                    if next.is_null() {
                        self.used_buckets.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            }
            let payload = boundary_rec.payload_clone();
            on_free(boundary, &payload);
            boundary_rec.clear();
            self.arena.retire(boundary);
            self.object_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// All ids currently present (newest versions), for GC sweeps.
    pub fn live_ids(&self) -> Vec<ObjectId> {
        let table = self.current_table();
        let mut ids = Vec::new();
        for index in 0..table.capacity() {
            let mut cur = table.head(index);
            while !cur.is_null() {
                let rec = self.arena.get(cur);
                ids.push(rec.id());
                cur = rec.next_in_bucket();
            }
        }
        ids
    }

    /// Resize when the used-bucket count crosses the load factor.
    ///
    /// Takes the exclusive side of the parallel gate, so every data-path
    /// operation has drained; the new table becomes visible atomically for
    /// future readers through the bucket-table swap.
    pub fn maybe_resize(&self) {
        let capacity = self.current_table().capacity();
        if (self.used_buckets.load(Ordering::Relaxed) as f64) < capacity as f64 * self.load_factor {
            return;
        }
        let _exclusive = self.gate.exclusive();

        let old = self.current_table();
        if old.capacity() != capacity {
            return; // another writer resized first
        }
        let new = BucketTable::new(capacity * 2);
        let mut used = 0u64;

        for index in 0..old.capacity() {
            let mut cur = old.head(index);
            while !cur.is_null() {
                let rec = self.arena.get(cur);
                let next = rec.next_in_bucket();
                let new_index = Self::bucket_of(&new, rec.id());
                let mut guard = new.lock(new_index);
                let head = guard.head();
                rec.set_next_in_bucket(head);
                if head.is_null() {
                    used += 1;
                }
                guard.set_head(cur);
                cur = next;
            }
        }

        self.used_buckets.store(used, Ordering::Relaxed);
        *self.buckets.write() = Arc::new(new);
        self.gate.reset_charges();
        debug!(class = %self.class_name, capacity = capacity * 2, "object heap resized");
    }

    /// Partition the record space for parallel scanning.
    pub fn scan_ranges(&self, parts: usize) -> Vec<std::ops::Range<u64>> {
        self.arena.scan_ranges(parts)
    }

    /// Scan one range, emitting each object visible to the snapshot
    /// exactly once.
    ///
    /// Candidates come from the slot walk; each is confirmed through the
    /// authoritative bucket lookup so superseded or torn slots drop out.
    pub fn scan_visible(
        &self,
        tran: TranId,
        read_version: u64,
        range: std::ops::Range<u64>,
        f: &mut dyn FnMut(ObjectId, VisibleObject),
    ) {
        self.arena.for_each_published(range, |handle, rec| {
            let seq = rec.sequence();
            if seq & 1 == 0 {
                return;
            }
            let id = rec.id();
            if id.is_null() || !rec.is_visible_to(tran, read_version) {
                return;
            }
            if rec.sequence_validate() != seq {
                return;
            }
            if let Some(visible) = self.read_visible(tran, read_version, id) {
                if visible.handle == handle && !visible.deleted {
                    f(id, visible);
                }
            }
        });
    }

    /// Drop every object of the class (drop-class blocks). The caller
    /// holds the exclusive gate.
    pub fn drop_all(&self, on_free: &mut dyn FnMut(RecordHandle, &[PropertyValue])) {
        let table = self.current_table();
        for index in 0..table.capacity() {
            let mut guard = table.lock(index);
            let mut cur = guard.head();
            guard.set_head(RecordHandle::NULL);
            drop(guard);
            while !cur.is_null() {
                let rec = self.arena.get(cur);
                let next = rec.next_in_bucket();
                let mut version = cur;
                while !version.is_null() {
                    let vrec = self.arena.get(version);
                    let older = vrec.older();
                    let payload = vrec.payload_clone();
                    on_free(version, &payload);
                    vrec.clear();
                    self.arena.retire(version);
                    version = older;
                }
                cur = next;
            }
        }
        self.used_buckets.store(0, Ordering::Relaxed);
        self.object_count.store(0, Ordering::Relaxed);
    }
}
