//! Inverse-reference map
//!
//! For every tracked reference property, maps a target object id to the
//! set of source ids referencing it, under snapshot isolation.
//!
//! # Representation
//!
//! Per (target id, property id): an ordered chain of base items (oldest
//! first, newest last), each base carrying the tracked reference vector of
//! one committed generation plus a chain of delta items recording
//! individual transactions' insertions and deletions. The effective set
//! for a snapshot is the newest visible base's refs, minus the deletes and
//! plus the inserts of its visible deltas, in delta order.
//!
//! Tombstone bases (deletion flag set) are appended when the target is
//! deleted; insertions conflict with a tombstone until it commits, and
//! fail against a committed one.
//!
//! A merge synthesizes a fresh base that absorbs fully committed deltas,
//! leaving older bases in place for still-live snapshots; the trigger
//! heuristic is tunable through [`EngineConfig`].

use crate::effects::EffectLog;
use crate::record::ReaderLocks;
use dashmap::DashMap;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::trace;
use velox_core::config::EngineConfig;
use velox_core::error::{DbError, DbResult};
use velox_core::tran::{SlotTable, TranIdentity, TranSlot};
use velox_core::types::{ObjectId, PropertyId};
use velox_core::version::{TranId, Version};

/// Key of one inverse-reference entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvRefKey {
    /// Referenced (target) object.
    pub target: ObjectId,
    /// Reference property on the source class.
    pub property: PropertyId,
}

/// One transaction's insertions and deletions against a base.
#[derive(Debug)]
struct DeltaItem {
    /// Owner word: transaction id until commit, then the commit version.
    version: u64,
    inserts: SmallVec<[ObjectId; 2]>,
    deletes: SmallVec<[ObjectId; 2]>,
}

impl DeltaItem {
    fn is_committed(&self) -> bool {
        !Version::from_word(self.version).is_uncommitted()
    }

    fn is_visible(&self, tran: TranId, read_version: u64) -> bool {
        let v = Version::from_word(self.version);
        v.is_owned_by(tran) || v.is_visible_at(read_version)
    }
}

/// One committed generation of the reference set.
#[derive(Debug)]
struct BaseItem {
    /// Version word: commit version, or the creating transaction's id for
    /// not-yet-committed tombstones.
    version: u64,
    /// Tombstone flag, set by target deletion.
    deleted: bool,
    /// Whether the property is tracked (refs vector maintained).
    tracked: bool,
    /// Tracked references of this generation.
    refs: SmallVec<[ObjectId; 4]>,
    /// Per-transaction deltas layered on this base, in arrival order.
    deltas: Vec<DeltaItem>,
    /// Reader-lock bookkeeping.
    locks: ReaderLocks,
}

impl BaseItem {
    fn empty(tracked: bool) -> Self {
        BaseItem {
            version: 0,
            deleted: false,
            tracked,
            refs: SmallVec::new(),
            deltas: Vec::new(),
            locks: ReaderLocks::default(),
        }
    }

    fn is_visible(&self, tran: TranId, read_version: u64) -> bool {
        let v = Version::from_word(self.version);
        v.is_owned_by(tran) || v.is_visible_at(read_version)
    }

    /// Reference count of this generation (tracked vector length).
    fn ref_count(&self) -> u64 {
        self.refs.len() as u64
    }
}

#[derive(Debug, Default)]
struct RefEntry {
    /// Oldest first; the newest base hosts new deltas and reader locks.
    bases: Vec<BaseItem>,
}

impl RefEntry {
    fn newest(&mut self) -> &mut BaseItem {
        self.bases.last_mut().expect("entries always hold a base")
    }

    fn newest_visible(&self, tran: TranId, read_version: u64) -> Option<&BaseItem> {
        self.bases.iter().rev().find(|b| b.is_visible(tran, read_version))
    }
}

/// The inverse-reference map of the whole database.
pub struct InverseRefMap {
    entries: DashMap<InvRefKey, RefEntry>,
    config: EngineConfig,
}

impl InverseRefMap {
    /// New empty map.
    pub fn new(config: EngineConfig) -> Self {
        InverseRefMap {
            entries: DashMap::new(),
            config,
        }
    }

    /// Number of (target, property) entries; test hook.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn conflict(key: &InvRefKey) -> DbError {
        DbError::conflict(key.target, "inverse-reference")
    }

    fn reader_conflict(base: &BaseItem, tran: &TranIdentity, slots: &SlotTable) -> bool {
        if base.locks.committed_boundary > tran.read_version {
            return true;
        }
        base.locks.owners.iter().any(|owner| {
            *owner != tran.slot && slots.is_live(*owner) && {
                let cv = slots.commit_version_of(*owner);
                cv == 0 || cv > tran.read_version
            }
        })
    }

    /// Record a transaction's insertions and deletions of references to
    /// `target` through `property`.
    pub fn modify(
        &self,
        tran: &TranIdentity,
        slots: &SlotTable,
        key: InvRefKey,
        tracked: bool,
        inserts: &[ObjectId],
        deletes: &[ObjectId],
        log: &mut EffectLog,
    ) -> DbResult<()> {
        let mut entry = self.entries.entry(key).or_default();
        if entry.bases.is_empty() {
            entry.bases.push(BaseItem::empty(tracked));
        }
        let tran_word = tran.id.as_raw();
        let newest = entry.newest();

        if newest.deleted {
            let v = Version::from_word(newest.version);
            if !v.is_owned_by(tran.id) {
                // Tombstone: concurrent or committed deletion of the target
                return Err(Self::conflict(&key));
            }
            if !inserts.is_empty() {
                return Err(Self::conflict(&key));
            }
        }
        if Self::reader_conflict(newest, tran, slots) {
            return Err(Self::conflict(&key));
        }
        // A newer committed generation past our snapshot is a write race
        if !Version::from_word(newest.version).is_uncommitted()
            && newest.version > tran.read_version
        {
            return Err(Self::conflict(&key));
        }

        match newest.deltas.iter_mut().find(|d| d.version == tran_word) {
            Some(delta) => {
                delta.inserts.extend_from_slice(inserts);
                delta.deletes.extend_from_slice(deletes);
            }
            None => {
                newest.deltas.push(DeltaItem {
                    version: tran_word,
                    inserts: SmallVec::from_slice(inserts),
                    deletes: SmallVec::from_slice(deletes),
                });
                log.affected_invrefs.push(key);
            }
        }
        Ok(())
    }

    /// Append tombstone bases for a deleted target across its tracked
    /// reference properties.
    pub fn delete_target(
        &self,
        tran: &TranIdentity,
        slots: &SlotTable,
        target: ObjectId,
        properties: &[PropertyId],
        log: &mut EffectLog,
    ) -> DbResult<()> {
        for property in properties {
            let key = InvRefKey {
                target,
                property: *property,
            };
            let mut entry = self.entries.entry(key).or_default();
            if entry.bases.is_empty() {
                entry.bases.push(BaseItem::empty(true));
            }
            let newest = entry.newest();
            if newest.deleted {
                let v = Version::from_word(newest.version);
                if !v.is_owned_by(tran.id) {
                    return Err(Self::conflict(&key));
                }
                continue; // already tombstoned by this transaction
            }
            if Self::reader_conflict(newest, tran, slots) {
                return Err(Self::conflict(&key));
            }
            if newest.deltas.iter().any(|d| {
                !d.is_committed() && !Version::from_word(d.version).is_owned_by(tran.id)
            }) {
                return Err(Self::conflict(&key));
            }
            let tracked = newest.tracked;
            entry.bases.push(BaseItem {
                version: tran.id.as_raw(),
                deleted: true,
                tracked,
                refs: SmallVec::new(),
                deltas: Vec::new(),
                locks: ReaderLocks::default(),
            });
            log.affected_invrefs.push(key);
        }
        Ok(())
    }

    /// Snapshot read of the reference set. A read-write transaction also
    /// parks a reader lock on the latest base (materializing an empty base
    /// to host it when none exists) and fails when a newer committed
    /// generation lies past its snapshot.
    pub fn get_references(
        &self,
        tran: &TranIdentity,
        key: InvRefKey,
        log: Option<&mut EffectLog>,
    ) -> DbResult<Vec<ObjectId>> {
        let read_write = log.is_some();
        if read_write {
            let mut entry = self.entries.entry(key).or_default();
            if entry.bases.is_empty() {
                entry.bases.push(BaseItem::empty(true));
            }
            // Conflict when any newer committed generation escapes the
            // snapshot: the lock could not protect a stale read.
            for base in entry.bases.iter() {
                let v = Version::from_word(base.version);
                if !v.is_uncommitted() && base.version > tran.read_version {
                    return Err(Self::conflict(&key));
                }
                for delta in &base.deltas {
                    if delta.is_committed() && delta.version > tran.read_version {
                        return Err(Self::conflict(&key));
                    }
                }
            }
            let slot = tran.slot;
            entry.newest().locks.add(slot);
            let log = log.expect("read-write path carries a log");
            log.invref_read_locks.push(key);
            Ok(Self::effective_set(&entry, tran))
        } else {
            match self.entries.get(&key) {
                None => Ok(Vec::new()),
                Some(entry) => Ok(Self::effective_set(&entry, tran)),
            }
        }
    }

    fn effective_set(entry: &RefEntry, tran: &TranIdentity) -> Vec<ObjectId> {
        let base = match entry.newest_visible(tran.id, tran.read_version) {
            Some(base) => base,
            None => return Vec::new(),
        };
        if base.deleted {
            return Vec::new();
        }
        if !base.tracked {
            return Vec::new();
        }
        let mut result: Vec<ObjectId> = base.refs.to_vec();
        for delta in &base.deltas {
            if !delta.is_visible(tran.id, tran.read_version) {
                continue;
            }
            if !delta.deletes.is_empty() {
                let deletes: FxHashSet<ObjectId> = delta.deletes.iter().copied().collect();
                result.retain(|id| !deletes.contains(id));
            }
            result.extend_from_slice(&delta.inserts);
        }
        result
    }

    /// Whether the property is tracked at this entry (engine-level
    /// validation against the model happens before this is consulted).
    pub fn is_tracked(&self, key: &InvRefKey) -> bool {
        self.entries
            .get(key)
            .map(|e| e.bases.last().map(|b| b.tracked).unwrap_or(true))
            .unwrap_or(true)
    }

    // =========================================================================
    // Commit / rollback finalization
    // =========================================================================

    /// Rewrite this transaction's delta (and tombstone) words to the
    /// commit version. If a merge produced a fresher base meanwhile, the
    /// delta is spliced onto it.
    pub fn commit_modification(&self, key: InvRefKey, tran: TranId, commit_version: u64) {
        let Some(mut entry) = self.entries.get_mut(&key) else {
            return;
        };
        let tran_word = tran.as_raw();
        let base_count = entry.bases.len();
        let mut spliced: Option<DeltaItem> = None;
        for (position, base) in entry.bases.iter_mut().enumerate() {
            if base.version == tran_word {
                base.version = commit_version;
            }
            if let Some(delta_pos) = base.deltas.iter().position(|d| d.version == tran_word) {
                let mut delta = base.deltas.remove(delta_pos);
                delta.version = commit_version;
                if position + 1 == base_count {
                    base.deltas.push(delta);
                } else {
                    spliced = Some(delta);
                }
            }
        }
        if let Some(delta) = spliced {
            entry.newest().deltas.push(delta);
        }
    }

    /// Remove this transaction's uncommitted delta and tombstone (rollback).
    pub fn rollback_modification(&self, key: InvRefKey, tran: TranId) {
        let remove_entry = {
            let Some(mut entry) = self.entries.get_mut(&key) else {
                return;
            };
            let tran_word = tran.as_raw();
            entry.bases.retain(|b| !(b.version == tran_word && b.deleted));
            for base in entry.bases.iter_mut() {
                base.deltas.retain(|d| d.version != tran_word);
            }
            entry.bases.len() == 1 && {
                let only = &entry.bases[0];
                only.version == 0
                    && only.refs.is_empty()
                    && only.deltas.is_empty()
                    && only.locks.owners.is_empty()
                    && only.locks.committed_boundary == 0
            }
        };
        if remove_entry {
            self.entries.remove_if(&key, |_, entry| {
                entry.bases.len() == 1
                    && entry.bases[0].refs.is_empty()
                    && entry.bases[0].deltas.is_empty()
                    && entry.bases[0].locks.owners.is_empty()
            });
        }
    }

    /// Drop a reader lock without committing it out (rollback).
    pub fn release_reader_lock(&self, key: InvRefKey, slot: TranSlot) {
        if let Some(mut entry) = self.entries.get_mut(&key) {
            for base in entry.bases.iter_mut() {
                base.locks.remove(slot);
            }
        }
    }

    /// Move a reader lock to a new slot (replication slot remapping).
    pub fn remap_reader_lock(&self, key: InvRefKey, old: TranSlot, new: TranSlot) {
        if let Some(mut entry) = self.entries.get_mut(&key) {
            for base in entry.bases.iter_mut() {
                if base.locks.owners.contains(&old) {
                    base.locks.remove(old);
                    base.locks.add(new);
                }
            }
        }
    }

    /// Finalize a reader lock at commit.
    pub fn commit_reader_lock(&self, key: InvRefKey, slot: TranSlot, commit_version: u64, also_wrote: bool) {
        if let Some(mut entry) = self.entries.get_mut(&key) {
            for base in entry.bases.iter_mut() {
                if also_wrote {
                    base.locks.remove(slot);
                } else {
                    base.locks.commit_out(slot, commit_version);
                }
            }
        }
    }

    // =========================================================================
    // Merge and garbage collection
    // =========================================================================

    /// Merge the newest base's fully committed deltas into a fresh base
    /// when the delta overhead justifies it (or unconditionally for
    /// alignment). Older bases stay for live snapshots.
    pub fn merge(&self, key: InvRefKey, commit_version: u64, force: bool) {
        let Some(mut entry) = self.entries.get_mut(&key) else {
            return;
        };
        let newest = entry.newest();
        if newest.deleted || newest.deltas.is_empty() {
            return;
        }
        if !newest.locks.owners.is_empty() {
            return;
        }
        if !newest
            .deltas
            .iter()
            .all(|d| d.is_committed() && d.version <= commit_version)
        {
            return;
        }
        if !force {
            let delta_count = newest.deltas.len() as u64;
            let deletes: u64 = newest.deltas.iter().map(|d| d.deletes.len() as u64).sum();
            let inserts: u64 = newest.deltas.iter().map(|d| d.inserts.len() as u64).sum();
            if !self
                .config
                .invref_merge_due(delta_count, deletes, inserts, newest.ref_count())
            {
                return;
            }
        }

        let tracked = newest.tracked;
        let mut refs: Vec<ObjectId> = newest.refs.to_vec();
        let mut merged_version = newest.version;
        for delta in &newest.deltas {
            merged_version = merged_version.max(delta.version);
            if !delta.deletes.is_empty() {
                let deletes: FxHashSet<ObjectId> = delta.deletes.iter().copied().collect();
                refs.retain(|id| !deletes.contains(id));
            }
            refs.extend_from_slice(&delta.inserts);
        }
        trace!(target_id = %key.target, property = %key.property, refs = refs.len(), "inverse-reference merge");
        entry.bases.push(BaseItem {
            version: merged_version,
            deleted: false,
            tracked,
            refs: SmallVec::from_vec(refs),
            deltas: Vec::new(),
            locks: ReaderLocks::default(),
        });
    }

    /// Drop every entry for the given targets outright (drop-class).
    pub fn purge_targets(&self, targets: &rustc_hash::FxHashSet<ObjectId>) {
        self.entries.retain(|key, _| !targets.contains(&key.target));
    }

    /// Prune base generations no live snapshot can see. Entries reduced
    /// to an old committed tombstone disappear entirely.
    pub fn collect_garbage(&self, oldest_visible: u64) {
        let mut drop_keys = Vec::new();
        for mut entry in self.entries.iter_mut() {
            let bases = &mut entry.bases;
            // Newest base visible at the horizon; everything older goes
            let mut boundary = None;
            for (position, base) in bases.iter().enumerate().rev() {
                let v = Version::from_word(base.version);
                if !v.is_uncommitted() && base.version <= oldest_visible {
                    boundary = Some(position);
                    break;
                }
            }
            if let Some(boundary) = boundary {
                if boundary > 0 {
                    bases.drain(..boundary);
                }
            }
            let retire = bases.len() == 1 && {
                let only = &bases[0];
                let v = Version::from_word(only.version);
                only.deleted
                    && !v.is_uncommitted()
                    && only.version <= oldest_visible
                    && only.deltas.is_empty()
                    && only.locks.owners.is_empty()
            };
            if retire {
                drop_keys.push(*entry.key());
            }
        }
        for key in drop_keys {
            self.entries.remove_if(&key, |_, entry| {
                entry.bases.len() == 1 && entry.bases[0].deleted && entry.bases[0].deltas.is_empty()
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use velox_core::external::{TranSource, TranType};

    fn tran(counter: u64, read_version: u64, slot: u16) -> TranIdentity {
        TranIdentity {
            id: TranId::from_counter(counter),
            read_version,
            commit_version: 0,
            tran_type: TranType::ReadWrite,
            source: TranSource::Client,
            slot,
        }
    }

    fn map() -> InverseRefMap {
        InverseRefMap::new(EngineConfig::default())
    }

    fn key(target: u64) -> InvRefKey {
        InvRefKey {
            target: ObjectId::new(target),
            property: PropertyId(1),
        }
    }

    fn ids(raw: &[u64]) -> Vec<ObjectId> {
        raw.iter().map(|r| ObjectId::new(*r)).collect()
    }

    #[test]
    fn test_modify_commit_read() {
        let map = map();
        let slots = SlotTable::new(8);
        let t1 = tran(1, 0, slots.acquire(0).unwrap());
        let mut log = EffectLog::new();

        map.modify(&t1, &slots, key(10), true, &ids(&[1]), &[], &mut log)
            .unwrap();
        // Own uncommitted delta is visible to the writer
        assert_eq!(map.get_references(&t1, key(10), None).unwrap(), ids(&[1]));

        // Not visible to others until commit
        let t2 = tran(2, 5, slots.acquire(5).unwrap());
        assert!(map.get_references(&t2, key(10), None).unwrap().is_empty());

        map.commit_modification(key(10), t1.id, 6);
        let t3 = tran(3, 6, slots.acquire(6).unwrap());
        assert_eq!(map.get_references(&t3, key(10), None).unwrap(), ids(&[1]));
        // Old snapshot still sees nothing
        assert!(map.get_references(&t2, key(10), None).unwrap().is_empty());
    }

    #[test]
    fn test_reference_moves_between_targets() {
        let map = map();
        let slots = SlotTable::new(8);
        let t1 = tran(1, 0, slots.acquire(0).unwrap());
        let mut log = EffectLog::new();
        map.modify(&t1, &slots, key(10), true, &ids(&[1]), &[], &mut log)
            .unwrap();
        map.commit_modification(key(10), t1.id, 5);

        let t2 = tran(2, 5, slots.acquire(5).unwrap());
        let mut log2 = EffectLog::new();
        map.modify(&t2, &slots, key(10), true, &[], &ids(&[1]), &mut log2)
            .unwrap();
        map.modify(&t2, &slots, key(11), true, &ids(&[1]), &[], &mut log2)
            .unwrap();
        map.commit_modification(key(10), t2.id, 6);
        map.commit_modification(key(11), t2.id, 6);

        let t3 = tran(3, 6, slots.acquire(6).unwrap());
        assert!(map.get_references(&t3, key(10), None).unwrap().is_empty());
        assert_eq!(map.get_references(&t3, key(11), None).unwrap(), ids(&[1]));
    }

    #[test]
    fn test_tombstone_blocks_inserts() {
        let map = map();
        let slots = SlotTable::new(8);
        let t1 = tran(1, 5, slots.acquire(5).unwrap());
        let mut log = EffectLog::new();
        map.delete_target(&t1, &slots, ObjectId::new(10), &[PropertyId(1)], &mut log)
            .unwrap();

        // A concurrent insert against the tombstone conflicts
        let t2 = tran(2, 5, slots.acquire(5).unwrap());
        let mut log2 = EffectLog::new();
        let err = map
            .modify(&t2, &slots, key(10), true, &ids(&[7]), &[], &mut log2)
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_rollback_removes_delta_and_tombstone() {
        let map = map();
        let slots = SlotTable::new(8);
        let t1 = tran(1, 0, slots.acquire(0).unwrap());
        let mut log = EffectLog::new();
        map.modify(&t1, &slots, key(10), true, &ids(&[1]), &[], &mut log)
            .unwrap();
        map.rollback_modification(key(10), t1.id);
        assert_eq!(map.entry_count(), 0, "an untouched entry disappears on rollback");

        // Tombstone rollback restores the previous generation
        let t2 = tran(2, 0, slots.acquire(0).unwrap());
        let mut log2 = EffectLog::new();
        map.modify(&t2, &slots, key(20), true, &ids(&[3]), &[], &mut log2)
            .unwrap();
        map.commit_modification(key(20), t2.id, 5);

        let t3 = tran(3, 5, slots.acquire(5).unwrap());
        let mut log3 = EffectLog::new();
        map.delete_target(&t3, &slots, ObjectId::new(20), &[PropertyId(1)], &mut log3)
            .unwrap();
        map.rollback_modification(key(20), t3.id);

        let t4 = tran(4, 5, slots.acquire(5).unwrap());
        assert_eq!(map.get_references(&t4, key(20), None).unwrap(), ids(&[3]));
    }

    #[test]
    fn test_reader_lock_conflicts_with_writer() {
        let map = map();
        let slots = SlotTable::new(8);
        let t1 = tran(1, 0, slots.acquire(0).unwrap());
        let mut log = EffectLog::new();
        map.modify(&t1, &slots, key(10), true, &ids(&[1]), &[], &mut log)
            .unwrap();
        map.commit_modification(key(10), t1.id, 5);

        // t2 read-locks the entry
        let t2 = tran(2, 5, slots.acquire(5).unwrap());
        let mut log2 = EffectLog::new();
        assert_eq!(
            map.get_references(&t2, key(10), Some(&mut log2)).unwrap(),
            ids(&[1])
        );

        // t3's modification conflicts with the live reader
        let t3 = tran(3, 5, slots.acquire(5).unwrap());
        let mut log3 = EffectLog::new();
        let err = map
            .modify(&t3, &slots, key(10), true, &ids(&[9]), &[], &mut log3)
            .unwrap_err();
        assert!(err.is_conflict());

        // After release the write goes through
        map.release_reader_lock(key(10), t2.slot);
        slots.release(t2.slot);
        map.modify(&t3, &slots, key(10), true, &ids(&[9]), &[], &mut log3)
            .unwrap();
    }

    #[test]
    fn test_read_write_get_conflicts_with_newer_generation() {
        let map = map();
        let slots = SlotTable::new(8);
        let t1 = tran(1, 0, slots.acquire(0).unwrap());
        let mut log = EffectLog::new();
        map.modify(&t1, &slots, key(10), true, &ids(&[1]), &[], &mut log)
            .unwrap();
        map.commit_modification(key(10), t1.id, 8);

        // A read-write reader at an older snapshot cannot lock the entry
        let stale = tran(2, 5, slots.acquire(5).unwrap());
        let mut log2 = EffectLog::new();
        let err = map.get_references(&stale, key(10), Some(&mut log2)).unwrap_err();
        assert!(err.is_conflict());

        // A plain read at the same snapshot is fine (sees nothing)
        assert!(map.get_references(&stale, key(10), None).unwrap().is_empty());
    }

    #[test]
    fn test_merge_absorbs_committed_deltas() {
        let map = map();
        let slots = SlotTable::new(8);
        for (counter, source, version) in [(1u64, 1u64, 5u64), (2, 2, 6), (3, 3, 7)] {
            let t = tran(counter, version - 1, slots.acquire(version - 1).unwrap());
            let mut log = EffectLog::new();
            map.modify(&t, &slots, key(10), true, &ids(&[source]), &[], &mut log)
                .unwrap();
            map.commit_modification(key(10), t.id, version);
        }
        // Small base, three deltas: the heuristic fires
        map.merge(key(10), 7, false);

        let t = tran(9, 7, slots.acquire(7).unwrap());
        let mut refs = map.get_references(&t, key(10), None).unwrap();
        refs.sort_unstable();
        assert_eq!(refs, ids(&[1, 2, 3]));

        // Older snapshots still resolve through the older bases
        let old = tran(10, 5, slots.acquire(5).unwrap());
        assert_eq!(map.get_references(&old, key(10), None).unwrap(), ids(&[1]));
    }

    #[test]
    fn test_merge_skips_uncommitted_deltas() {
        let map = map();
        let slots = SlotTable::new(8);
        let t1 = tran(1, 0, slots.acquire(0).unwrap());
        let mut log = EffectLog::new();
        map.modify(&t1, &slots, key(10), true, &ids(&[1]), &[], &mut log)
            .unwrap();
        map.merge(key(10), 10, true);

        // The uncommitted delta blocked the merge
        let t2 = tran(2, 10, slots.acquire(10).unwrap());
        assert!(map.get_references(&t2, key(10), None).unwrap().is_empty());
    }

    #[test]
    fn test_gc_prunes_old_generations() {
        let map = map();
        let slots = SlotTable::new(8);
        for (counter, source, version) in [(1u64, 1u64, 5u64), (2, 2, 6)] {
            let t = tran(counter, version - 1, slots.acquire(version - 1).unwrap());
            let mut log = EffectLog::new();
            map.modify(&t, &slots, key(10), true, &ids(&[source]), &[], &mut log)
                .unwrap();
            map.commit_modification(key(10), t.id, version);
            map.merge(key(10), version, true);
        }
        map.collect_garbage(6);
        // The merged newest generation is intact
        let t = tran(9, 6, slots.acquire(6).unwrap());
        let mut refs = map.get_references(&t, key(10), None).unwrap();
        refs.sort_unstable();
        assert_eq!(refs, ids(&[1, 2]));

        // Idempotent
        map.collect_garbage(6);
        let mut refs2 = map.get_references(&t, key(10), None).unwrap();
        refs2.sort_unstable();
        assert_eq!(refs2, ids(&[1, 2]));
    }

    #[test]
    fn test_gc_retires_committed_tombstones() {
        let map = map();
        let slots = SlotTable::new(8);
        let t1 = tran(1, 5, slots.acquire(5).unwrap());
        let mut log = EffectLog::new();
        map.delete_target(&t1, &slots, ObjectId::new(10), &[PropertyId(1)], &mut log)
            .unwrap();
        map.commit_modification(key(10), t1.id, 6);

        assert_eq!(map.entry_count(), 1);
        map.collect_garbage(7);
        assert_eq!(map.entry_count(), 0);
    }
}
