//! Per-transaction effect log
//!
//! Every storage-level side effect of a read-write transaction is recorded
//! here so commit can finalize it and rollback can reverse it. The log is
//! append-only during the transaction; rollback consumes it in strict
//! order (reader locks first, then structural undo).

use crate::invref::InvRefKey;
use crate::key::IndexKey;
use velox_core::types::{ClassId, ObjectId, PropertyId, RecordHandle};

/// What a write did to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// A brand-new object.
    Insert,
    /// A new or merged version of an existing object.
    Update,
    /// A deletion version.
    Delete,
}

/// A new uncommitted version created by this transaction.
#[derive(Debug, Clone, Copy)]
pub struct AffectedObject {
    /// Class of the object.
    pub class_id: ClassId,
    /// Handle of the uncommitted version.
    pub handle: RecordHandle,
    /// Kind of write.
    pub kind: WriteKind,
}

/// A per-object reader lock taken by this transaction.
#[derive(Debug, Clone, Copy)]
pub struct ObjectReadLock {
    /// Class of the object.
    pub class_id: ClassId,
    /// Handle of the locked version.
    pub handle: RecordHandle,
}

/// A secondary-index entry added by this transaction (undone on rollback,
/// for updates the superseded entry is retired by GC).
#[derive(Debug, Clone)]
pub struct IndexEntryUndo {
    /// Class of the object.
    pub class_id: ClassId,
    /// Whether the entry went into a sorted index (hash otherwise).
    pub sorted: bool,
    /// Position of the index in the class's index list.
    pub index_pos: usize,
    /// Key of the entry.
    pub key: IndexKey,
    /// Object id of the entry.
    pub id: ObjectId,
    /// Record handle of the entry.
    pub handle: RecordHandle,
}

/// A key-read lock installed in a hash index for phantom prevention.
#[derive(Debug, Clone)]
pub struct KeyReadLock {
    /// Class of the index.
    pub class_id: ClassId,
    /// Position of the hash index in the class's index list.
    pub index_pos: usize,
    /// Locked key.
    pub key: IndexKey,
}

/// A key-range lock installed in a sorted index.
#[derive(Debug, Clone, Copy)]
pub struct RangeLockRef {
    /// Class of the index.
    pub class_id: ClassId,
    /// Position of the sorted index in the class's index list.
    pub index_pos: usize,
    /// Node the range is anchored on.
    pub node: RecordHandle,
    /// Lock id within that node's range list.
    pub lock_id: u64,
}

/// A pending inverse-reference change produced by the apply pass.
#[derive(Debug, Clone, Copy)]
pub struct InvRefChange {
    /// Referenced object.
    pub target: ObjectId,
    /// Reference property on the source class.
    pub property: PropertyId,
    /// Referencing object.
    pub source: ObjectId,
    /// Insert (true) or removal (false) of the reference.
    pub insert: bool,
}

/// The modified-item logs of one transaction.
#[derive(Debug, Default)]
pub struct EffectLog {
    /// Reader locks on object versions.
    pub object_read_locks: Vec<ObjectReadLock>,
    /// Reader locks on inverse-reference bases.
    pub invref_read_locks: Vec<InvRefKey>,
    /// Key-read locks in hash indexes.
    pub key_read_locks: Vec<KeyReadLock>,
    /// Key-range locks in sorted indexes.
    pub range_locks: Vec<RangeLockRef>,
    /// Uncommitted versions created by this transaction, in apply order.
    pub affected_objects: Vec<AffectedObject>,
    /// Inverse-reference deltas written by this transaction.
    pub affected_invrefs: Vec<InvRefKey>,
    /// Inverse-reference operations accumulated during the current apply
    /// pass, grouped and flushed to the map after the pass.
    pub pending_invref_ops: Vec<InvRefChange>,
    /// Index entries added by this transaction.
    pub index_undo: Vec<IndexEntryUndo>,
    /// Ids deleted by this transaction.
    pub deleted_ids: Vec<(ClassId, ObjectId)>,
}

impl EffectLog {
    /// Fresh empty log.
    pub fn new() -> Self {
        EffectLog::default()
    }

    /// Whether the transaction wrote anything.
    pub fn is_empty(&self) -> bool {
        self.affected_objects.is_empty()
            && self.affected_invrefs.is_empty()
            && self.index_undo.is_empty()
            && self.object_read_locks.is_empty()
            && self.invref_read_locks.is_empty()
            && self.key_read_locks.is_empty()
            && self.range_locks.is_empty()
            && self.deleted_ids.is_empty()
    }

    /// Whether this transaction deleted the given id.
    pub fn deleted(&self, class_id: ClassId, id: ObjectId) -> bool {
        self.deleted_ids.iter().any(|(c, i)| *c == class_id && *i == id)
    }

    /// Append another transaction's log, transferring ownership of every
    /// recorded effect (replication transaction merging).
    pub fn merge_from(&mut self, mut other: EffectLog) {
        self.object_read_locks.append(&mut other.object_read_locks);
        self.invref_read_locks.append(&mut other.invref_read_locks);
        self.key_read_locks.append(&mut other.key_read_locks);
        self.range_locks.append(&mut other.range_locks);
        self.affected_objects.append(&mut other.affected_objects);
        self.affected_invrefs.append(&mut other.affected_invrefs);
        self.pending_invref_ops.append(&mut other.pending_invref_ops);
        self.index_undo.append(&mut other.index_undo);
        self.deleted_ids.append(&mut other.deleted_ids);
    }

    /// Drop every recorded effect (after rollback consumed them).
    pub fn clear(&mut self) {
        *self = EffectLog::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_log() {
        let log = EffectLog::new();
        assert!(log.is_empty());
    }

    #[test]
    fn test_deleted_lookup() {
        let mut log = EffectLog::new();
        log.deleted_ids.push((ClassId(1), ObjectId::new(5)));
        assert!(log.deleted(ClassId(1), ObjectId::new(5)));
        assert!(!log.deleted(ClassId(2), ObjectId::new(5)));
        assert!(!log.deleted(ClassId(1), ObjectId::new(6)));
    }

    #[test]
    fn test_merge_preserves_order() {
        let mut a = EffectLog::new();
        a.affected_objects.push(AffectedObject {
            class_id: ClassId(1),
            handle: RecordHandle::new(0, 1),
            kind: WriteKind::Insert,
        });
        let mut b = EffectLog::new();
        b.affected_objects.push(AffectedObject {
            class_id: ClassId(1),
            handle: RecordHandle::new(0, 2),
            kind: WriteKind::Update,
        });
        a.merge_from(b);
        assert_eq!(a.affected_objects.len(), 2);
        assert_eq!(a.affected_objects[0].handle, RecordHandle::new(0, 1));
        assert_eq!(a.affected_objects[1].handle, RecordHandle::new(0, 2));
    }
}
