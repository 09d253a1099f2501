//! Per-class store: object heap plus secondary indexes
//!
//! Binds one class's heap to its hash and sorted indexes and carries the
//! shared maintenance rules: every new version owns one entry per index,
//! entries are removed when their version is rolled back or collected,
//! and reference-property writes emit pending inverse-reference changes
//! into the transaction's effect log.

use crate::effects::{EffectLog, IndexEntryUndo, InvRefChange};
use crate::hash_index::HashIndex;
use crate::heap::{ClassHeap, VisibleObject, WriteOutcome};
use crate::key::{EntryKey, IndexKey, KeyReader};
use crate::sorted::SortedIndex;
use dashmap::DashMap;
use rustc_hash::FxHashSet;
use tracing::warn;
use velox_core::changeset::{BlockOp, ChangeBlock, ChangeEntry};
use velox_core::config::EngineConfig;
use velox_core::error::{DbError, DbResult};
use velox_core::external::{align_overwrite, AlignFn, BlobHeap, TranSource, TranType};
use velox_core::model::ClassMeta;
use velox_core::tran::{SlotTable, TranIdentity};
use velox_core::types::{ObjectId, PropertyId, RecordHandle};
use velox_core::value::PropertyValue;
use velox_core::version::{TranId, Version};

/// One hash index with its key reader.
pub struct HashIndexSlot {
    /// The index structure.
    pub index: HashIndex,
    /// Key-column gather for this index.
    pub reader: KeyReader,
}

/// One sorted index with its key reader.
pub struct SortedIndexSlot {
    /// The index structure.
    pub index: SortedIndex,
    /// Key-column gather for this index.
    pub reader: KeyReader,
}

/// A restore operation parked until its predecessor version arrives.
struct ParkedOp {
    op: BlockOp,
    entry: ChangeEntry,
    positions: Vec<usize>,
    commit_version: u64,
}

/// The store of one concrete class.
pub struct ClassStore {
    /// Class descriptor.
    pub class: ClassMeta,
    /// The object heap.
    pub heap: ClassHeap,
    /// Hash indexes, in declaration order.
    pub hash_indexes: Vec<HashIndexSlot>,
    /// Sorted indexes, in declaration order.
    pub sorted_indexes: Vec<SortedIndexSlot>,
    template: Vec<PropertyValue>,
    /// (payload position, property id) of tracked reference properties.
    tracked_positions: Vec<(usize, PropertyId)>,
    align: AlignFn,
    alloc_batch: usize,
    /// Restore operations waiting for their predecessor version.
    pending_restore: DashMap<u64, Vec<ParkedOp>>,
}

impl ClassStore {
    /// Build the store for a class, drawing slab pool indexes from the
    /// shared counter.
    pub fn new(class: ClassMeta, config: &EngineConfig, next_pool: &mut u8) -> Self {
        let mut take_pool = || {
            let pool = *next_pool;
            *next_pool = next_pool.checked_add(1).expect("slab pool space exhausted");
            pool
        };
        let heap = ClassHeap::new(
            class.id,
            class.name.clone(),
            take_pool(),
            config.initial_buckets,
            config.bucket_load_factor,
        );
        let hash_indexes = class
            .hash_indexes
            .iter()
            .enumerate()
            .map(|(position, meta)| HashIndexSlot {
                index: HashIndex::new(
                    class.name.clone(),
                    meta.clone(),
                    position,
                    take_pool(),
                    config.initial_buckets,
                    config.bucket_load_factor,
                ),
                reader: KeyReader::resolve(&class, &meta.properties),
            })
            .collect();
        let sorted_indexes = class
            .sorted_indexes
            .iter()
            .enumerate()
            .map(|(position, meta)| SortedIndexSlot {
                index: SortedIndex::new(
                    class.id,
                    class.name.clone(),
                    meta.clone(),
                    position,
                    take_pool(),
                    config.node_capacity,
                ),
                reader: KeyReader::resolve(&class, &meta.properties),
            })
            .collect();
        let template = class.default_template();
        let tracked_positions = class
            .properties
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_tracked_reference())
            .map(|(position, p)| (position, p.id))
            .collect();
        ClassStore {
            class,
            heap,
            hash_indexes,
            sorted_indexes,
            template,
            tracked_positions,
            align: align_overwrite,
            alloc_batch: config.alloc_batch.max(1),
            pending_restore: DashMap::new(),
        }
    }

    fn resolve_positions(&self, property_ids: &[PropertyId]) -> Vec<usize> {
        property_ids
            .iter()
            .map(|pid| {
                self.class
                    .property_position(*pid)
                    .expect("changeset property not declared on the class")
            })
            .collect()
    }

    fn abstract_check(&self) -> DbResult<()> {
        if self.class.is_abstract {
            return Err(DbError::AbstractClassWrite {
                class: self.class.name.clone(),
            });
        }
        Ok(())
    }

    // =========================================================================
    // Index maintenance
    // =========================================================================

    /// Add the index entries owned by a freshly written version.
    fn add_index_entries(
        &self,
        tran: &TranIdentity,
        slots: &SlotTable,
        id: ObjectId,
        handle: RecordHandle,
        payload: &[PropertyValue],
        log: &mut EffectLog,
    ) -> DbResult<()> {
        for (position, slot) in self.hash_indexes.iter().enumerate() {
            let key = slot.reader.read(payload);
            slot.index
                .insert(tran, slots, &self.heap, &slot.reader, id, handle, &key)?;
            log.index_undo.push(IndexEntryUndo {
                class_id: self.class.id,
                sorted: false,
                index_pos: position,
                key,
                id,
                handle,
            });
        }
        for (position, slot) in self.sorted_indexes.iter().enumerate() {
            let key = slot.reader.read(payload);
            let entry = EntryKey::new(key.clone(), id, handle);
            let unique = if slot.index.meta().unique {
                Some((&self.heap, &slot.reader))
            } else {
                None
            };
            slot.index.insert(tran, entry, unique)?;
            log.index_undo.push(IndexEntryUndo {
                class_id: self.class.id,
                sorted: true,
                index_pos: position,
                key,
                id,
                handle,
            });
        }
        Ok(())
    }

    /// Undo one logged index addition (rollback). Idempotent.
    pub fn remove_index_entry(&self, undo: &IndexEntryUndo) {
        if undo.sorted {
            let entry = EntryKey::new(undo.key.clone(), undo.id, undo.handle);
            self.sorted_indexes[undo.index_pos].index.remove_unchecked(&entry);
        } else {
            self.hash_indexes[undo.index_pos].index.remove(&undo.key, undo.handle);
        }
    }

    /// Remove every index entry owned by a freed version.
    fn remove_version_entries(&self, id: ObjectId, handle: RecordHandle, payload: &[PropertyValue]) {
        if payload.is_empty() {
            return;
        }
        for slot in &self.hash_indexes {
            let key = slot.reader.read(payload);
            slot.index.remove(&key, handle);
        }
        for slot in &self.sorted_indexes {
            let key = slot.reader.read(payload);
            slot.index.remove_unchecked(&EntryKey::new(key, id, handle));
        }
    }

    // =========================================================================
    // Blob ownership
    // =========================================================================

    fn retain_inherited_blobs(blob_heap: &dyn BlobHeap, payload: &[PropertyValue], written: &[usize]) {
        for (position, value) in payload.iter().enumerate() {
            if written.contains(&position) {
                continue; // ownership transferred from the changeset
            }
            if let Some(handle) = value.as_blob_handle() {
                blob_heap.inc_refcount(handle);
            }
        }
    }

    fn release_replaced_blobs(blob_heap: &dyn BlobHeap, old_values: &[PropertyValue], written: &[usize]) {
        for position in written {
            if let Some(handle) = old_values[*position].as_blob_handle() {
                blob_heap.dec_refcount(handle);
            }
        }
    }

    /// Release every interned handle owned by a payload (rollback / GC).
    pub fn release_payload_blobs(blob_heap: &dyn BlobHeap, payload: &[PropertyValue]) {
        for value in payload {
            if let Some(handle) = value.as_blob_handle() {
                blob_heap.dec_refcount(handle);
            }
        }
    }

    fn emit_reference_diff(
        &self,
        id: ObjectId,
        old_values: Option<&[PropertyValue]>,
        new_values: Option<&[PropertyValue]>,
        written: Option<&[usize]>,
        log: &mut EffectLog,
    ) {
        for (position, property) in &self.tracked_positions {
            if let Some(written) = written {
                if !written.contains(position) {
                    continue;
                }
            }
            let old_ref = old_values
                .and_then(|v| v[*position].as_reference())
                .filter(|r| !r.is_null());
            let new_ref = new_values
                .and_then(|v| v[*position].as_reference())
                .filter(|r| !r.is_null());
            if old_ref == new_ref {
                continue;
            }
            if let Some(old_ref) = old_ref {
                log.pending_invref_ops.push(InvRefChange {
                    target: old_ref,
                    property: *property,
                    source: id,
                    insert: false,
                });
            }
            if let Some(new_ref) = new_ref {
                log.pending_invref_ops.push(InvRefChange {
                    target: new_ref,
                    property: *property,
                    source: id,
                    insert: true,
                });
            }
        }
    }

    // =========================================================================
    // Block application
    // =========================================================================

    /// Apply an insert block.
    pub fn insert_block(
        &self,
        tran: &TranIdentity,
        slots: &SlotTable,
        block: &ChangeBlock,
        log: &mut EffectLog,
    ) -> DbResult<()> {
        self.abstract_check()?;
        let positions = self.resolve_positions(&block.property_ids);

        let _gate = self.heap.gate.enter();
        self.heap.gate.charge(block.entries.len() as u64);

        for chunk in block.entries.chunks(self.alloc_batch) {
            let mut handles = Vec::new();
            self.heap.allocate_batch(chunk.len(), &mut handles);
            for (entry, handle) in chunk.iter().zip(handles.iter()) {
                let mut payload = self.template.clone();
                for (position, value) in positions.iter().zip(entry.values.iter()) {
                    payload[*position] = value.clone();
                }
                self.heap.insert(
                    tran,
                    slots,
                    entry.id,
                    *handle,
                    payload.clone(),
                    entry.last_in_tran,
                    log,
                )?;
                self.add_index_entries(tran, slots, entry.id, *handle, &payload, log)?;
                self.emit_reference_diff(entry.id, None, Some(&payload), None, log);
            }
        }
        Ok(())
    }

    /// Apply an update block (or, with `use_defaults`, a default-value
    /// block rewriting the listed properties back to the template).
    pub fn update_block(
        &self,
        tran: &TranIdentity,
        slots: &SlotTable,
        block: &ChangeBlock,
        blob_heap: &dyn BlobHeap,
        use_defaults: bool,
        log: &mut EffectLog,
    ) -> DbResult<()> {
        self.abstract_check()?;
        let positions = self.resolve_positions(&block.property_ids);

        let _gate = self.heap.gate.enter();
        self.heap.gate.charge(block.entries.len() as u64);

        for entry in &block.entries {
            let values: Vec<PropertyValue> = if use_defaults {
                positions.iter().map(|p| self.template[*p].clone()).collect()
            } else {
                entry.values.clone()
            };
            let mut apply = |payload: &mut Vec<PropertyValue>| {
                for (position, value) in positions.iter().zip(values.iter()) {
                    payload[*position] = value.clone();
                }
            };
            let outcome = self
                .heap
                .write(tran, slots, entry.id, &mut apply, false, entry.last_in_tran, log)?;
            self.finish_write(tran, slots, blob_heap, entry.id, &positions, &outcome, log)?;
        }
        Ok(())
    }

    fn finish_write(
        &self,
        tran: &TranIdentity,
        slots: &SlotTable,
        blob_heap: &dyn BlobHeap,
        id: ObjectId,
        positions: &[usize],
        outcome: &WriteOutcome,
        log: &mut EffectLog,
    ) -> DbResult<()> {
        if outcome.merged {
            Self::release_replaced_blobs(blob_heap, &outcome.old_values, positions);
            // Swap index entries whose key changed under the merge
            for (index_pos, slot) in self.hash_indexes.iter().enumerate() {
                if !slot.reader.touches(positions) {
                    continue;
                }
                let old_key = slot.reader.read(&outcome.old_values);
                let new_key = slot.reader.read(&outcome.new_values);
                if old_key == new_key {
                    continue;
                }
                slot.index.remove(&old_key, outcome.handle);
                slot.index
                    .insert(tran, slots, &self.heap, &slot.reader, id, outcome.handle, &new_key)?;
                log.index_undo.push(IndexEntryUndo {
                    class_id: self.class.id,
                    sorted: false,
                    index_pos,
                    key: new_key,
                    id,
                    handle: outcome.handle,
                });
            }
            for (index_pos, slot) in self.sorted_indexes.iter().enumerate() {
                if !slot.reader.touches(positions) {
                    continue;
                }
                let old_key = slot.reader.read(&outcome.old_values);
                let new_key = slot.reader.read(&outcome.new_values);
                if old_key == new_key {
                    continue;
                }
                slot.index
                    .remove_unchecked(&EntryKey::new(old_key, id, outcome.handle));
                let entry = EntryKey::new(new_key.clone(), id, outcome.handle);
                let unique = if slot.index.meta().unique {
                    Some((&self.heap, &slot.reader))
                } else {
                    None
                };
                slot.index.insert(tran, entry, unique)?;
                log.index_undo.push(IndexEntryUndo {
                    class_id: self.class.id,
                    sorted: true,
                    index_pos,
                    key: new_key,
                    id,
                    handle: outcome.handle,
                });
            }
        } else {
            Self::retain_inherited_blobs(blob_heap, &outcome.new_values, positions);
            self.add_index_entries(tran, slots, id, outcome.handle, &outcome.new_values, log)?;
        }
        self.emit_reference_diff(
            id,
            Some(&outcome.old_values),
            Some(&outcome.new_values),
            Some(positions),
            log,
        );
        Ok(())
    }

    /// Apply a delete block.
    pub fn delete_block(
        &self,
        tran: &TranIdentity,
        slots: &SlotTable,
        block: &ChangeBlock,
        blob_heap: &dyn BlobHeap,
        log: &mut EffectLog,
    ) -> DbResult<()> {
        self.abstract_check()?;
        let _gate = self.heap.gate.enter();
        self.heap.gate.charge(block.entries.len() as u64);

        for entry in &block.entries {
            let mut apply = |_: &mut Vec<PropertyValue>| {};
            let outcome = self
                .heap
                .write(tran, slots, entry.id, &mut apply, true, entry.last_in_tran, log)?;
            if !outcome.merged {
                // The deletion version owns a clone of the payload
                Self::retain_inherited_blobs(blob_heap, &outcome.new_values, &[]);
            }
            // Every tracked outgoing reference is withdrawn
            self.emit_reference_diff(entry.id, Some(&outcome.old_values), None, None, log);
            log.deleted_ids.push((self.class.id, entry.id));
        }
        Ok(())
    }

    // =========================================================================
    // Commit / rollback / GC
    // =========================================================================

    /// Commit finalization of one version: version-word rewrite plus
    /// blob-version advancement for handles first written here.
    pub fn commit_object(&self, handle: RecordHandle, commit_version: u64, blob_heap: &dyn BlobHeap) -> ObjectId {
        let id = self.heap.commit_record(handle, commit_version);
        let record = self.heap.record(handle);
        for value in record.payload().iter() {
            if let Some(blob) = value.as_blob_handle() {
                if !blob.is_null() && blob_heap.get_version(blob) == 0 {
                    blob_heap.set_version(blob, commit_version);
                }
            }
        }
        id
    }

    /// Rollback of one uncommitted version: index entries are removed by
    /// the caller through the effect log; this releases the record and its
    /// interned payload.
    pub fn rollback_object(&self, handle: RecordHandle, blob_heap: &dyn BlobHeap) -> ObjectId {
        let (id, payload) = self.heap.rollback_record(handle);
        Self::release_payload_blobs(blob_heap, &payload);
        id
    }

    /// Garbage-collect one id at the given horizon, retiring stale index
    /// entries and blob ownership alongside freed versions.
    pub fn collect_garbage(&self, id: ObjectId, oldest_visible: u64, blob_heap: &dyn BlobHeap) {
        let mut freed: Vec<(RecordHandle, Vec<PropertyValue>)> = Vec::new();
        self.heap.collect_garbage(id, oldest_visible, &mut |handle, payload| {
            freed.push((handle, payload.to_vec()));
        });
        for (handle, payload) in freed {
            self.remove_version_entries(id, handle, &payload);
            Self::release_payload_blobs(blob_heap, &payload);
        }
    }

    /// Drop every object of the class (drop-class blocks). Returns the
    /// dropped ids so the caller can purge the inverse-reference map.
    pub fn drop_all(&self, blob_heap: &dyn BlobHeap) -> FxHashSet<ObjectId> {
        let _exclusive = self.heap.gate.exclusive();
        let mut dropped: Vec<(ObjectId, Vec<PropertyValue>)> = Vec::new();
        {
            let heap = &self.heap;
            heap.drop_all(&mut |handle, payload| {
                dropped.push((heap.record(handle).id(), payload.to_vec()));
            });
        }
        let mut ids = FxHashSet::default();
        for (id, payload) in dropped {
            ids.insert(id);
            Self::release_payload_blobs(blob_heap, &payload);
        }
        for slot in &self.hash_indexes {
            slot.index.clear();
        }
        for slot in &self.sorted_indexes {
            slot.index.clear();
        }
        ids
    }

    // =========================================================================
    // Restore / alignment
    // =========================================================================

    /// Apply one restore block with pre-assigned commit versions, parking
    /// out-of-order operations until their predecessor arrives.
    pub fn restore_block(&self, block: &ChangeBlock, commit_version: u64, blob_heap: &dyn BlobHeap) -> DbResult<()> {
        let positions = self.resolve_positions(&block.property_ids);
        let _gate = self.heap.gate.enter();
        self.heap.gate.charge(block.entries.len() as u64);
        for entry in &block.entries {
            let _ = self.restore_op(block.op, entry.clone(), positions.clone(), commit_version, blob_heap)?;
        }
        Ok(())
    }

    /// Returns whether the operation applied (false = parked).
    fn restore_op(
        &self,
        op: BlockOp,
        entry: ChangeEntry,
        positions: Vec<usize>,
        commit_version: u64,
        blob_heap: &dyn BlobHeap,
    ) -> DbResult<bool> {
        let probe = TranId::from_counter(0);
        let current = self.heap.read_visible(probe, u64::MAX >> 2, entry.id);

        let predecessor_matches = |visible: &VisibleObject| {
            // A not-last version blocks every other transaction from
            // advancing past the mid-flight multi-operation transaction.
            let blocked = visible.version.is_not_last()
                && visible.version.without_not_last().commit_version() != Some(commit_version);
            !blocked
                && visible.version.without_not_last() == entry.previous_version.without_not_last()
        };
        let ready = match op {
            BlockOp::Insert => match &current {
                None => true,
                Some(visible) => visible.deleted && predecessor_matches(visible),
            },
            BlockOp::Update | BlockOp::Delete => match &current {
                None => false,
                Some(visible) => predecessor_matches(visible),
            },
            _ => true,
        };
        if !ready {
            self.pending_restore
                .entry(entry.id.as_u64())
                .or_default()
                .push(ParkedOp {
                    op,
                    entry,
                    positions,
                    commit_version,
                });
            return Ok(false);
        }

        let id = entry.id.as_u64();
        self.apply_restore(op, &entry, &positions, commit_version, blob_heap);

        // The applied operation may unblock parked successors. Re-examine
        // the parked set until a full pass makes no progress; not-ready
        // operations re-park themselves.
        loop {
            let parked = match self.pending_restore.remove(&id) {
                Some((_, parked)) => parked,
                None => break,
            };
            let mut progressed = false;
            for next in parked {
                if self.restore_op(next.op, next.entry, next.positions, next.commit_version, blob_heap)? {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(true)
    }

    fn apply_restore(
        &self,
        op: BlockOp,
        entry: &ChangeEntry,
        positions: &[usize],
        commit_version: u64,
        blob_heap: &dyn BlobHeap,
    ) {
        // Restore writes committed versions directly through a synthetic
        // identity; conflict detection is bypassed because the stream is
        // ordered upstream.
        let restore_tran = TranIdentity {
            id: TranId::from_counter(0),
            read_version: u64::MAX >> 2,
            commit_version,
            tran_type: TranType::ReadWrite,
            source: TranSource::Alignment,
            slot: 0,
        };
        let slots = SlotTable::new(1);
        let mut log = EffectLog::new();
        let applied: DbResult<RecordHandle> = match op {
            BlockOp::Insert => {
                let mut payload = self.template.clone();
                (self.align)(&mut payload, positions, &entry.values);
                let handle = {
                    let mut handles = Vec::new();
                    self.heap.allocate_batch(1, &mut handles);
                    handles[0]
                };
                self.heap
                    .insert(&restore_tran, &slots, entry.id, handle, payload.clone(), entry.last_in_tran, &mut log)
                    .map(|_| {
                        self.add_restore_entries(entry.id, handle, &payload);
                        handle
                    })
            }
            BlockOp::Update | BlockOp::Delete => {
                let delete = op == BlockOp::Delete;
                let mut apply = |payload: &mut Vec<PropertyValue>| {
                    (self.align)(payload, positions, &entry.values);
                };
                self.heap
                    .write(&restore_tran, &slots, entry.id, &mut apply, delete, entry.last_in_tran, &mut log)
                    .map(|outcome| {
                        if delete {
                            Self::retain_inherited_blobs(blob_heap, &outcome.new_values, &[]);
                        } else {
                            Self::retain_inherited_blobs(blob_heap, &outcome.new_values, positions);
                            self.add_restore_entries(entry.id, outcome.handle, &outcome.new_values);
                        }
                        outcome.handle
                    })
            }
            _ => return,
        };

        match applied {
            Ok(handle) => {
                let mut version = Version::committed(commit_version);
                if !entry.last_in_tran {
                    version = version.with_not_last();
                }
                let record = self.heap.record(handle);
                let older = record.older();
                record.set_version(version);
                if !older.is_null() {
                    self.heap.record(older).set_newer(handle);
                }
            }
            Err(error) => {
                // Restore input comes from an ordered upstream; a failure
                // here means the stream is inconsistent.
                warn!(class = %self.class.name, object_id = %entry.id, %error, "restore operation failed");
                panic!("inconsistent restore stream for class {}: {}", self.class.name, error);
            }
        }
    }

    fn add_restore_entries(&self, id: ObjectId, handle: RecordHandle, payload: &[PropertyValue]) {
        for slot in &self.sorted_indexes {
            let key = slot.reader.read(payload);
            slot.index.insert_unchecked(EntryKey::new(key, id, handle));
        }
        let restore_tran = TranIdentity {
            id: TranId::from_counter(0),
            read_version: u64::MAX >> 2,
            commit_version: 0,
            tran_type: TranType::ReadWrite,
            source: TranSource::Alignment,
            slot: 0,
        };
        let slots = SlotTable::new(1);
        for slot in &self.hash_indexes {
            let key = slot.reader.read(payload);
            if let Err(error) =
                slot.index
                    .insert(&restore_tran, &slots, &self.heap, &slot.reader, id, handle, &key)
            {
                panic!("inconsistent restore stream for class {}: {}", self.class.name, error);
            }
        }
    }

    /// Ids with parked restore operations; empty after a consistent
    /// restore.
    pub fn pending_restore_count(&self) -> usize {
        self.pending_restore.len()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Snapshot read, excluding deletions. Read-write transactions pass a
    /// log and take a reader lock on the found version.
    pub fn get(&self, tran: &TranIdentity, id: ObjectId, log: Option<&mut EffectLog>) -> Option<VisibleObject> {
        let _gate = self.heap.gate.enter();
        self.heap.gate.charge(1);
        let visible = match log {
            Some(log) if tran.is_read_write() => self.heap.read_and_lock(tran, id, log),
            _ => self.heap.read_visible(tran.id, tran.read_version, id),
        };
        visible.filter(|v| !v.deleted)
    }

    /// Hash-index lookup.
    pub fn hash_lookup(
        &self,
        tran: &TranIdentity,
        index_pos: usize,
        key: &IndexKey,
        log: Option<&mut EffectLog>,
    ) -> Vec<(ObjectId, VisibleObject)> {
        let _gate = self.heap.gate.enter();
        self.heap.gate.charge(1);
        let slot = &self.hash_indexes[index_pos];
        slot.index.get_entries(tran, &self.heap, &slot.reader, key, log)
    }

    /// Run the post-block resize checks.
    pub fn maybe_resize(&self) {
        self.heap.maybe_resize();
        for slot in &self.hash_indexes {
            slot.index.maybe_resize(&self.heap.gate, &self.heap, &slot.reader);
        }
    }
}
