//! Object version records
//!
//! The unit stored in the object heap. All mutable fields use interior
//! mutability: chain links and the version word are atomics mutated under
//! the bucket lock and read optimistically; the property payload sits
//! behind a lightweight `RwLock` and is only written by the owning
//! transaction before commit (merge-in-place), which keeps committed
//! payloads frozen.
//!
//! The lifecycle of a record is an explicit three-state progression:
//! uncommitted (owned by one transaction) → newest committed (hosts reader
//! locks) → superseded (a newer version links back to it). State is
//! derived from the version word and the newer-version link instead of an
//! aliased storage cell.

use parking_lot::{Mutex, MutexGuard, RwLock};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use velox_core::tran::TranSlot;
use velox_core::types::{ObjectId, RecordHandle};
use velox_core::value::PropertyValue;
use velox_core::version::{TranId, Version};

const FLAG_DELETED: u64 = 1;

/// Lifecycle state of a record, derived from the version word and links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Uncommitted, owned by the given transaction.
    Uncommitted(TranId),
    /// The newest committed version of its object.
    NewestCommitted,
    /// Superseded by a newer committed version.
    Superseded(RecordHandle),
}

/// Reader-lock bookkeeping on a record.
///
/// Live read-write transactions park their slot here; at commit a lock is
/// either "committed out" into the high-water mark (future writers know
/// which snapshots still depended on the record) or dropped when the owner
/// also wrote the record.
#[derive(Debug, Default)]
pub struct ReaderLocks {
    /// Highest commit version of a reader that committed out of this record.
    pub committed_boundary: u64,
    /// Slots of live read-write transactions holding the lock.
    pub owners: SmallVec<[TranSlot; 4]>,
}

impl ReaderLocks {
    /// Park a reader slot; idempotent.
    pub fn add(&mut self, slot: TranSlot) {
        if !self.owners.contains(&slot) {
            self.owners.push(slot);
        }
    }

    /// Remove a reader slot without committing it out (rollback).
    pub fn remove(&mut self, slot: TranSlot) {
        self.owners.retain(|s| *s != slot);
    }

    /// Commit a reader out: raise the boundary and drop the slot.
    pub fn commit_out(&mut self, slot: TranSlot, commit_version: u64) {
        self.remove(slot);
        if commit_version > self.committed_boundary {
            self.committed_boundary = commit_version;
        }
    }

    /// Reset for a freshly committed record.
    pub fn reset(&mut self) {
        self.committed_boundary = 0;
        self.owners.clear();
    }
}

/// One object version.
pub struct ObjectRecord {
    id: AtomicU64,
    version: AtomicU64,
    flags: AtomicU64,
    older: AtomicU64,
    newer: AtomicU64,
    next_in_bucket: AtomicU64,
    locks: Mutex<ReaderLocks>,
    payload: RwLock<Vec<PropertyValue>>,
}

impl Default for ObjectRecord {
    fn default() -> Self {
        ObjectRecord {
            id: AtomicU64::new(0),
            version: AtomicU64::new(0),
            flags: AtomicU64::new(0),
            older: AtomicU64::new(0),
            newer: AtomicU64::new(0),
            next_in_bucket: AtomicU64::new(0),
            locks: Mutex::new(ReaderLocks::default()),
            payload: RwLock::new(Vec::new()),
        }
    }
}

impl ObjectRecord {
    /// Initialize a freshly allocated record before publication.
    pub fn init(&self, id: ObjectId, version: Version, deleted: bool, older: RecordHandle, payload: Vec<PropertyValue>) {
        self.id.store(id.as_u64(), Ordering::Relaxed);
        self.version.store(version.as_word(), Ordering::Relaxed);
        self.flags
            .store(if deleted { FLAG_DELETED } else { 0 }, Ordering::Relaxed);
        self.older.store(older.as_raw(), Ordering::Relaxed);
        self.newer.store(0, Ordering::Relaxed);
        self.next_in_bucket.store(0, Ordering::Relaxed);
        self.locks.lock().reset();
        *self.payload.write() = payload;
    }

    /// Clear a record on free so recycled slots never leak payloads.
    pub fn clear(&self) {
        self.id.store(0, Ordering::Relaxed);
        self.version.store(0, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.older.store(0, Ordering::Relaxed);
        self.newer.store(0, Ordering::Relaxed);
        self.next_in_bucket.store(0, Ordering::Relaxed);
        self.locks.lock().reset();
        self.payload.write().clear();
    }

    // === Identity and version ===

    /// Object id.
    #[inline]
    pub fn id(&self) -> ObjectId {
        ObjectId::new(self.id.load(Ordering::Acquire))
    }

    /// Version word.
    #[inline]
    pub fn version(&self) -> Version {
        Version::from_word(self.version.load(Ordering::Acquire))
    }

    /// Rewrite the version word (commit finalization).
    #[inline]
    pub fn set_version(&self, version: Version) {
        self.version.store(version.as_word(), Ordering::Release);
    }

    /// Deletion flag.
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_DELETED != 0
    }

    /// Set or clear the deletion flag (merge-in-place delete by the owner).
    #[inline]
    pub fn set_deleted(&self, deleted: bool) {
        if deleted {
            self.flags.fetch_or(FLAG_DELETED, Ordering::Release);
        } else {
            self.flags.fetch_and(!FLAG_DELETED, Ordering::Release);
        }
    }

    // === Chain links ===

    /// Older version in this object's chain.
    #[inline]
    pub fn older(&self) -> RecordHandle {
        RecordHandle::from_raw(self.older.load(Ordering::Acquire))
    }

    /// Link to the older version.
    #[inline]
    pub fn set_older(&self, handle: RecordHandle) {
        self.older.store(handle.as_raw(), Ordering::Release);
    }

    /// Newer version, set when this record is superseded at commit.
    #[inline]
    pub fn newer(&self) -> RecordHandle {
        RecordHandle::from_raw(self.newer.load(Ordering::Acquire))
    }

    /// Link to the newer version.
    #[inline]
    pub fn set_newer(&self, handle: RecordHandle) {
        self.newer.store(handle.as_raw(), Ordering::Release);
    }

    /// Next object in the bucket collision chain (newest versions only).
    #[inline]
    pub fn next_in_bucket(&self) -> RecordHandle {
        RecordHandle::from_raw(self.next_in_bucket.load(Ordering::Acquire))
    }

    /// Relink the collision chain.
    #[inline]
    pub fn set_next_in_bucket(&self, handle: RecordHandle) {
        self.next_in_bucket.store(handle.as_raw(), Ordering::Release);
    }

    // === Lifecycle ===

    /// Derived lifecycle state.
    pub fn state(&self) -> RecordState {
        let version = self.version();
        if let Some(owner) = version.owner() {
            RecordState::Uncommitted(owner)
        } else {
            let newer = self.newer();
            if newer.is_null() {
                RecordState::NewestCommitted
            } else {
                RecordState::Superseded(newer)
            }
        }
    }

    /// Transition: commit this record at `commit_version`, linking the
    /// prior version back and resetting reader-lock storage for its new
    /// role as newest committed version.
    pub fn transition_committed(&self, commit_version: u64) {
        debug_assert!(self.version().is_uncommitted());
        self.locks.lock().reset();
        self.set_version(Version::committed(commit_version));
    }

    // === Locks and payload ===

    /// Reader-lock state.
    pub fn locks(&self) -> MutexGuard<'_, ReaderLocks> {
        self.locks.lock()
    }

    /// Clone the property payload.
    pub fn payload_clone(&self) -> Vec<PropertyValue> {
        self.payload.read().clone()
    }

    /// Read access to the payload.
    pub fn payload(&self) -> parking_lot::RwLockReadGuard<'_, Vec<PropertyValue>> {
        self.payload.read()
    }

    /// Write access to the payload; merge-in-place by the owner only.
    pub fn payload_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Vec<PropertyValue>> {
        self.payload.write()
    }

    /// Visibility of this version to a snapshot: the transaction's own
    /// uncommitted writes, or committed versions at or below the horizon.
    #[inline]
    pub fn is_visible_to(&self, tran: TranId, read_version: u64) -> bool {
        let v = self.version();
        v.is_owned_by(tran) || v.is_visible_at(read_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_record(record: &ObjectRecord, id: u64, version: Version) {
        record.init(
            ObjectId::new(id),
            version,
            false,
            RecordHandle::NULL,
            vec![PropertyValue::Int(1)],
        );
    }

    #[test]
    fn test_lifecycle_states() {
        let record = ObjectRecord::default();
        let tran = TranId::from_counter(5);
        init_record(&record, 1, Version::uncommitted(tran));
        assert_eq!(record.state(), RecordState::Uncommitted(tran));

        record.transition_committed(10);
        assert_eq!(record.state(), RecordState::NewestCommitted);
        assert_eq!(record.version(), Version::committed(10));

        record.set_newer(RecordHandle::new(0, 9));
        assert_eq!(record.state(), RecordState::Superseded(RecordHandle::new(0, 9)));
    }

    #[test]
    fn test_visibility() {
        let record = ObjectRecord::default();
        let owner = TranId::from_counter(1);
        init_record(&record, 1, Version::uncommitted(owner));

        assert!(record.is_visible_to(owner, 0));
        assert!(!record.is_visible_to(TranId::from_counter(2), 100));

        record.transition_committed(7);
        assert!(record.is_visible_to(TranId::from_counter(2), 7));
        assert!(!record.is_visible_to(TranId::from_counter(2), 6));
    }

    #[test]
    fn test_reader_locks_commit_out() {
        let mut locks = ReaderLocks::default();
        locks.add(3);
        locks.add(3);
        assert_eq!(locks.owners.len(), 1, "add is idempotent");

        locks.add(4);
        locks.commit_out(3, 12);
        assert_eq!(locks.committed_boundary, 12);
        assert_eq!(locks.owners.as_slice(), &[4]);

        // A later reader committing at a lower version keeps the boundary
        locks.commit_out(4, 9);
        assert_eq!(locks.committed_boundary, 12);
        assert!(locks.owners.is_empty());
    }

    #[test]
    fn test_clear_resets_everything() {
        let record = ObjectRecord::default();
        init_record(&record, 9, Version::committed(4));
        record.locks().add(1);
        record.clear();
        assert!(record.id().is_null());
        assert!(record.payload().is_empty());
        assert!(record.locks().owners.is_empty());
    }

    #[test]
    fn test_merge_in_place_payload() {
        let record = ObjectRecord::default();
        init_record(&record, 1, Version::uncommitted(TranId::from_counter(1)));
        record.payload_mut()[0] = PropertyValue::Int(42);
        assert_eq!(record.payload_clone(), vec![PropertyValue::Int(42)]);
    }
}
