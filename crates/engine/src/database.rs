//! The database facade
//!
//! Owns the per-class stores, the inverse-reference map, the transaction
//! slot table, locks, and the commit machinery, and exposes the public
//! engine surface: transactions, changeset application, snapshot readers,
//! and id reservation.

use crate::apply;
use crate::gc::GcService;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use velox_concurrency::{ClassLockTable, CommitPool, CommitSequencer, EngineGate, TranStatus, Transaction};
use velox_core::changeset::Changeset;
use velox_core::config::EngineConfig;
use velox_core::error::{DbError, DbResult};
use velox_core::external::{
    BlobHeap, InMemoryBlobHeap, NullPersistence, NullReplicator, Persistence, Replicator,
    TranSource, TranType,
};
use velox_core::model::DataModel;
use velox_core::tran::{SlotTable, TranIdentity};
use velox_core::types::{ClassId, IndexId, ObjectId, PropertyId, RecordHandle};
use velox_core::value::PropertyValue;
use velox_core::version::TranId;
use velox_storage::key::{EntryKey, IndexKey};
use velox_storage::sorted::range::RangeBound;
use velox_storage::{ClassStore, InvRefKey, InverseRefMap};

/// Plain observational counters; relaxed ordering throughout because they
/// synchronize nothing.
#[derive(Default)]
pub struct EngineCounters {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    conflicts: AtomicU64,
}

impl EngineCounters {
    /// (started, committed, aborted, conflicts)
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.started.load(Ordering::Relaxed),
            self.committed.load(Ordering::Relaxed),
            self.aborted.load(Ordering::Relaxed),
            self.conflicts.load(Ordering::Relaxed),
        )
    }
}

/// Everything the engine shares between the facade, commit workers, and
/// the background GC thread.
pub struct DatabaseInner {
    pub(crate) model: Arc<DataModel>,
    pub(crate) config: EngineConfig,
    pub(crate) stores: FxHashMap<ClassId, ClassStore>,
    pub(crate) invref: InverseRefMap,
    pub(crate) slots: Arc<SlotTable>,
    pub(crate) global_version: Arc<AtomicU64>,
    tran_counter: AtomicU64,
    id_counter: AtomicU64,
    pub(crate) gate: EngineGate,
    pub(crate) class_locks: ClassLockTable,
    pub(crate) sequencer: CommitSequencer,
    pub(crate) blob_heap: Arc<dyn BlobHeap>,
    persistence: Arc<dyn Persistence>,
    replicator: Arc<dyn Replicator>,
    pub(crate) counters: EngineCounters,
}

/// The in-memory transactional object store.
pub struct Database {
    inner: Arc<DatabaseInner>,
    pool: CommitPool,
    gc: Mutex<Option<GcService>>,
}

impl Database {
    /// Open a database over a validated data model with default
    /// collaborators (in-memory blob heap, null persistence/replication).
    pub fn open(model: DataModel, config: EngineConfig) -> DbResult<Database> {
        Database::open_with(
            model,
            config,
            Arc::new(InMemoryBlobHeap::new()),
            Arc::new(NullPersistence::default()),
            Arc::new(NullReplicator),
        )
    }

    /// Open a database with explicit collaborators.
    pub fn open_with(
        model: DataModel,
        config: EngineConfig,
        blob_heap: Arc<dyn BlobHeap>,
        persistence: Arc<dyn Persistence>,
        replicator: Arc<dyn Replicator>,
    ) -> DbResult<Database> {
        let model = Arc::new(model);
        let mut next_pool: u8 = 1; // pool 0 stays free so null handles never alias
        let stores = model
            .concrete_classes()
            .map(|class| {
                (
                    class.id,
                    ClassStore::new(class.clone(), &config, &mut next_pool),
                )
            })
            .collect();
        let global_version = Arc::new(AtomicU64::new(0));
        let inner = Arc::new(DatabaseInner {
            stores,
            invref: InverseRefMap::new(config.clone()),
            slots: Arc::new(SlotTable::new(config.max_transactions)),
            global_version: Arc::clone(&global_version),
            tran_counter: AtomicU64::new(1),
            id_counter: AtomicU64::new(1),
            gate: EngineGate::new(),
            class_locks: ClassLockTable::new(model.classes().iter().map(|c| c.id)),
            sequencer: CommitSequencer::new(global_version),
            blob_heap,
            persistence,
            replicator,
            counters: EngineCounters::default(),
            config,
            model,
        });
        let pool = CommitPool::new(inner.config.commit_workers);
        let gc = GcService::start(Arc::clone(&inner));
        info!(classes = inner.stores.len(), "database opened");
        Ok(Database {
            inner,
            pool,
            gc: Mutex::new(Some(gc)),
        })
    }

    /// The loaded data model.
    pub fn model(&self) -> &DataModel {
        &self.inner.model
    }

    /// Engine counters (started, committed, aborted, conflicts).
    pub fn counters(&self) -> (u64, u64, u64, u64) {
        self.inner.counters.snapshot()
    }

    /// Highest committed version.
    pub fn committed_version(&self) -> u64 {
        self.inner.sequencer.committed_version()
    }

    /// Reserve a contiguous id range; returns its first id.
    pub fn reserve_id_range(&self, count: u64) -> ObjectId {
        ObjectId::new(self.inner.id_counter.fetch_add(count, Ordering::Relaxed))
    }

    /// Direct access to the blob heap collaborator.
    pub fn blob_heap(&self) -> &Arc<dyn BlobHeap> {
        &self.inner.blob_heap
    }

    // =========================================================================
    // Transaction lifecycle
    // =========================================================================

    /// Begin a transaction.
    pub fn begin(&self, tran_type: TranType, source: TranSource) -> DbResult<Transaction> {
        if !self.inner.replicator.is_transaction_allowed(source, tran_type) {
            return Err(DbError::DatabaseBusy);
        }
        self.inner.gate.enter()?;
        let read_version = self.inner.sequencer.committed_version();
        let slot = match self.inner.slots.acquire(read_version) {
            Some(slot) => slot,
            None => {
                self.inner.gate.leave();
                return Err(DbError::DatabaseBusy);
            }
        };
        let counter = self.inner.tran_counter.fetch_add(1, Ordering::Relaxed);
        let identity = TranIdentity {
            id: TranId::from_counter(counter),
            read_version,
            commit_version: 0,
            tran_type,
            source,
            slot,
        };
        self.inner.counters.started.fetch_add(1, Ordering::Relaxed);
        debug!(tran = %identity.id, read_version = identity.read_version, "transaction begun");
        Ok(Transaction::new(identity))
    }

    /// Apply a changeset. On any error the transaction is rolled back in
    /// place and the error returned.
    pub fn apply(&self, tran: &mut Transaction, changeset: &Changeset) -> DbResult<()> {
        if let Err(error) = self.apply_inner(tran, changeset) {
            self.abort_in_place(tran);
            if error.is_conflict() {
                self.inner.counters.conflicts.fetch_add(1, Ordering::Relaxed);
            }
            return Err(error);
        }
        Ok(())
    }

    fn apply_inner(&self, tran: &mut Transaction, changeset: &Changeset) -> DbResult<()> {
        tran.ensure_active()?;
        tran.check_canceled()?;
        tran.ensure_writable()?;
        apply::apply_changeset(&self.inner, tran, changeset)
    }

    /// Commit a transaction, returning the commit version (the current
    /// committed version for read transactions).
    pub fn commit(&self, mut tran: Transaction) -> DbResult<u64> {
        tran.ensure_active()?;
        if tran.check_canceled().is_err() {
            self.rollback(tran)?;
            return Err(DbError::TransactionCanceled);
        }

        // Read transactions and empty writers release their snapshot only
        if tran.identity.tran_type == TranType::Read || tran.log.is_empty() {
            let version = self.inner.sequencer.committed_version();
            release_class_locks(&self.inner, &mut tran);
            release_snapshot(&self.inner, &mut tran);
            tran.status = TranStatus::Committed(version);
            self.inner.counters.committed.fetch_add(1, Ordering::Relaxed);
            return Ok(version);
        }

        tran.status = TranStatus::Committing;
        if tran.identity.source == TranSource::Client {
            // Hand off to the commit worker pool and wait for the outcome
            let inner = Arc::clone(&self.inner);
            let ticket = self.pool.submit(move || do_commit(&inner, tran))?;
            ticket.wait()
        } else {
            do_commit(&self.inner, tran)
        }
    }

    /// Roll a transaction back, reversing every recorded effect.
    pub fn rollback(&self, mut tran: Transaction) -> DbResult<()> {
        if !tran.is_active() {
            return Ok(());
        }
        self.abort_in_place(&mut tran);
        Ok(())
    }

    fn abort_in_place(&self, tran: &mut Transaction) {
        undo_effects(&self.inner, tran);
        release_class_locks(&self.inner, tran);
        release_snapshot(&self.inner, tran);
        tran.status = TranStatus::RolledBack;
        self.inner.counters.aborted.fetch_add(1, Ordering::Relaxed);
        debug!(tran = %tran.identity.id, "transaction rolled back");
    }

    /// Move an inbound replicated transaction onto a fresh reader slot
    /// (the replicator's ordering primitive). Every reader lock recorded
    /// under the old slot follows the transaction to the new one.
    pub fn remap_transaction_slot(&self, tran: &mut Transaction) -> DbResult<()> {
        tran.ensure_active()?;
        let new_slot = self
            .inner
            .slots
            .acquire(tran.identity.read_version)
            .ok_or(DbError::DatabaseBusy)?;
        let old_slot = tran.identity.slot;

        for lock in &tran.log.object_read_locks {
            if let Some(store) = self.inner.stores.get(&lock.class_id) {
                let record = store.heap.record(lock.handle);
                let mut locks = record.locks();
                locks.remove(old_slot);
                locks.add(new_slot);
            }
        }
        for key in &tran.log.invref_read_locks {
            self.inner.invref.remap_reader_lock(*key, old_slot, new_slot);
        }
        for key_lock in &tran.log.key_read_locks {
            if let Some(store) = self.inner.stores.get(&key_lock.class_id) {
                store.hash_indexes[key_lock.index_pos]
                    .index
                    .remap_key_lock(&key_lock.key, old_slot, new_slot);
            }
        }

        self.inner.slots.release(old_slot);
        tran.identity.slot = new_slot;
        Ok(())
    }

    /// Dispose the engine: drain in-flight transactions, stop the commit
    /// pool and the GC service.
    pub fn dispose(&self) {
        if let Some(gc) = self.gc.lock().take() {
            gc.shutdown();
        }
        self.inner.gate.dispose();
        self.pool.shutdown();
        info!("database disposed");
    }

    // =========================================================================
    // Readers
    // =========================================================================

    pub(crate) fn store(&self, class: ClassId) -> DbResult<&ClassStore> {
        store_of(&self.inner, class)
    }

    /// Snapshot read of one object's property values.
    pub fn get_object(&self, tran: &mut Transaction, class: ClassId, id: ObjectId) -> DbResult<Option<Vec<PropertyValue>>> {
        tran.ensure_active()?;
        tran.check_canceled()?;
        let store = self.store(class)?;
        let log = if tran.identity.is_read_write() {
            Some(&mut tran.log)
        } else {
            None
        };
        Ok(store.get(&tran.identity, id, log).map(|v| v.values))
    }

    /// Snapshot read of the inverse references of `(id, property)`.
    pub fn get_inverse_references(
        &self,
        tran: &mut Transaction,
        id: ObjectId,
        property: PropertyId,
    ) -> DbResult<Vec<ObjectId>> {
        tran.ensure_active()?;
        tran.check_canceled()?;
        let tracked = self.inner.model.classes().iter().any(|class| {
            class
                .property(property)
                .map(|p| p.is_tracked_reference())
                .unwrap_or(false)
        });
        if !tracked {
            return Err(DbError::InverseReferenceNotTracked { property });
        }
        let key = InvRefKey {
            target: id,
            property,
        };
        let log = if tran.identity.is_read_write() {
            Some(&mut tran.log)
        } else {
            None
        };
        self.inner.invref.get_references(&tran.identity, key, log)
    }

    /// Hash-index lookup by name.
    pub fn hash_lookup(
        &self,
        tran: &mut Transaction,
        class: ClassId,
        index: IndexId,
        key_values: Vec<PropertyValue>,
    ) -> DbResult<Vec<(ObjectId, Vec<PropertyValue>)>> {
        tran.ensure_active()?;
        tran.check_canceled()?;
        let store = self.store(class)?;
        let position = store
            .hash_indexes
            .iter()
            .position(|slot| slot.index.meta().id == index)
            .ok_or(DbError::InvalidModelVersion {
                got: index.0 as u64,
                expected: 0,
            })?;
        let key = IndexKey::new(key_values);
        let log = if tran.identity.is_read_write() {
            Some(&mut tran.log)
        } else {
            None
        };
        Ok(store
            .hash_lookup(&tran.identity, position, &key, log)
            .into_iter()
            .map(|(id, visible)| (id, visible.values))
            .collect())
    }

    /// Sorted-index range scan with typed key bounds (1-4 columns per
    /// bound). Read-write transactions leave key-range locks behind.
    #[allow(clippy::too_many_arguments)]
    pub fn sorted_scan(
        &self,
        tran: &mut Transaction,
        class: ClassId,
        index: IndexId,
        start: Option<(Vec<PropertyValue>, bool)>,
        end: Option<(Vec<PropertyValue>, bool)>,
        forward: bool,
        limit: usize,
    ) -> DbResult<Vec<(ObjectId, Vec<PropertyValue>)>> {
        tran.ensure_active()?;
        tran.check_canceled()?;
        let store = self.store(class)?;
        let position = store
            .sorted_indexes
            .iter()
            .position(|slot| slot.index.meta().id == index)
            .ok_or(DbError::InvalidModelVersion {
                got: index.0 as u64,
                expected: 0,
            })?;
        let slot = &store.sorted_indexes[position];

        let start_bound = match start {
            None => RangeBound::unbounded(),
            Some((values, inclusive)) => lower_bound(IndexKey::new(values), inclusive),
        };
        let end_bound = match end {
            None => RangeBound::unbounded(),
            Some((values, inclusive)) => upper_bound(IndexKey::new(values), inclusive),
        };

        let read_write = tran.identity.is_read_write();
        let entries = {
            let log = if read_write { Some(&mut tran.log) } else { None };
            if forward {
                slot.index
                    .scan_forward(&tran.identity, start_bound, end_bound, limit, log)
            } else {
                slot.index
                    .scan_backward(&tran.identity, start_bound, end_bound, limit, log)
            }
        };
        if read_write {
            // Collapse consecutive leaf ranges into parent envelopes
            slot.index.group_ranges(&mut tran.log);
        }

        let mut seen: FxHashSet<ObjectId> = FxHashSet::default();
        let mut results = Vec::new();
        for entry in entries {
            if entry.is_sentinel() || !seen.insert(entry.id) {
                continue;
            }
            let log = if read_write { Some(&mut tran.log) } else { None };
            if let Some(visible) = store.get(&tran.identity, entry.id, log) {
                if slot.reader.read(&visible.values) == entry.key {
                    results.push((entry.id, visible.values));
                }
            }
        }
        Ok(results)
    }

    /// Scan every visible object of a class (optionally including
    /// subclasses), partitioned internally for parallel-friendly ranges.
    pub fn class_scan(
        &self,
        tran: &mut Transaction,
        class: ClassId,
        include_inherited: bool,
    ) -> DbResult<Vec<(ObjectId, Vec<PropertyValue>)>> {
        tran.ensure_active()?;
        tran.check_canceled()?;
        let classes: Vec<ClassId> = if include_inherited {
            self.inner.model.subtree_of(class).to_vec()
        } else {
            vec![class]
        };
        let mut results = Vec::new();
        for class_id in classes {
            let Some(store) = self.inner.stores.get(&class_id) else {
                continue; // abstract classes hold no objects
            };
            let _gate = store.heap.gate.enter();
            store.heap.gate.charge(1);
            for range in store.heap.scan_ranges(4) {
                store.heap.scan_visible(
                    tran.identity.id,
                    tran.identity.read_version,
                    range,
                    &mut |id, visible| results.push((id, visible.values)),
                );
            }
        }
        Ok(results)
    }

    /// Apply a restore block stream for one class with pre-assigned
    /// commit versions (persistence/replication driven). Errors in the
    /// stream are fatal.
    pub fn restore_block(
        &self,
        class: ClassId,
        block: &velox_core::changeset::ChangeBlock,
        commit_version: u64,
    ) -> DbResult<()> {
        let store = self.store(class)?;
        store.restore_block(block, commit_version, self.inner.blob_heap.as_ref())?;
        // Restore streams carry already-assigned versions; keep the
        // committed horizon in step with the highest applied version.
        let mut current = self.inner.global_version.load(Ordering::Acquire);
        while current < commit_version {
            match self.inner.global_version.compare_exchange(
                current,
                commit_version,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        Ok(())
    }

    /// Run one garbage-collection pass synchronously (tests and
    /// maintenance windows).
    pub fn collect_garbage_now(&self) {
        crate::gc::run_pass(&self.inner);
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Inclusive/exclusive lower bound over a composite key.
fn lower_bound(key: IndexKey, inclusive: bool) -> RangeBound {
    if inclusive {
        RangeBound::at(EntryKey::new(key, ObjectId::NULL, RecordHandle::NULL), true)
    } else {
        RangeBound::at(
            EntryKey::new(
                key,
                ObjectId::new(u64::MAX),
                RecordHandle::from_raw(velox_storage::key::SENTINEL_HANDLE_RAW - 1),
            ),
            false,
        )
    }
}

/// Inclusive/exclusive upper bound over a composite key.
fn upper_bound(key: IndexKey, inclusive: bool) -> RangeBound {
    if inclusive {
        RangeBound::at(
            EntryKey::new(
                key,
                ObjectId::new(u64::MAX),
                RecordHandle::from_raw(velox_storage::key::SENTINEL_HANDLE_RAW - 1),
            ),
            true,
        )
    } else {
        RangeBound::at(EntryKey::new(key, ObjectId::NULL, RecordHandle::NULL), false)
    }
}

pub(crate) fn store_of(inner: &DatabaseInner, class: ClassId) -> DbResult<&ClassStore> {
    match inner.stores.get(&class) {
        Some(store) => Ok(store),
        None => match inner.model.class(class) {
            Some(meta) if meta.is_abstract => Err(DbError::AbstractClassWrite {
                class: meta.name.clone(),
            }),
            _ => Err(DbError::InvalidModelVersion {
                got: class.0 as u64,
                expected: 0,
            }),
        },
    }
}

// =============================================================================
// Commit path
// =============================================================================

/// The single commit sequence: pre-commit → version assignment and log
/// sequencing → persistence → finalization → publication → post-commit.
/// The relative order is load-bearing for replication; do not recompose.
fn do_commit(inner: &Arc<DatabaseInner>, mut tran: Transaction) -> DbResult<u64> {
    let identity = tran.identity;
    if let Err(error) = inner.replicator.pre_commit(identity.id) {
        undo_effects(inner, &mut tran);
        release_class_locks(inner, &mut tran);
        release_snapshot(inner, &mut tran);
        inner.counters.aborted.fetch_add(1, Ordering::Relaxed);
        return Err(error);
    }

    let sequenced = inner.sequencer.sequence(|commit_version| {
        let log_sequence = inner.persistence.assign_log_sequence();
        inner
            .persistence
            .persist_commit(identity.id, commit_version, log_sequence)?;
        Ok(log_sequence)
    });
    let (commit_version, _log_sequence) = match sequenced {
        Ok(sequenced) => sequenced,
        Err(error) => {
            inner.replicator.failure(identity.id);
            undo_effects(inner, &mut tran);
            release_class_locks(inner, &mut tran);
            release_snapshot(inner, &mut tran);
            inner.counters.aborted.fetch_add(1, Ordering::Relaxed);
            return Err(error);
        }
    };

    // Past this point failures are engine corruption: finalize panics
    // rather than returning.
    inner.slots.mark_committed(identity.slot, commit_version);
    finalize_commit(inner, &mut tran, commit_version);
    inner.sequencer.publish(commit_version);

    release_class_locks(inner, &mut tran);
    release_snapshot(inner, &mut tran);
    tran.status = TranStatus::Committed(commit_version);
    inner.counters.committed.fetch_add(1, Ordering::Relaxed);
    inner.replicator.post_commit(identity.id, commit_version);
    debug!(tran = %identity.id, commit_version, "transaction committed");
    Ok(commit_version)
}

/// Modification finalization: version-word rewrites, reader-lock
/// commit-out, range-lock owner rewrite, blob version advancement, and
/// opportunistic inverse-reference merges. Chunk-parallel for large
/// transactions.
fn finalize_commit(inner: &DatabaseInner, tran: &mut Transaction, commit_version: u64) {
    let identity = tran.identity;
    let log = &tran.log;

    // Objects written by this transaction, for reader-lock disposition
    let mut written: FxHashSet<(ClassId, ObjectId)> = FxHashSet::default();

    let affected = &log.affected_objects;
    if affected.len() >= 256 {
        std::thread::scope(|scope| {
            for chunk in affected.chunks((affected.len() + 3) / 4) {
                scope.spawn(move || {
                    for object in chunk {
                        let store = inner.stores.get(&object.class_id).expect("store exists");
                        store.commit_object(object.handle, commit_version, inner.blob_heap.as_ref());
                    }
                });
            }
        });
        for object in affected {
            let store = inner.stores.get(&object.class_id).expect("store exists");
            written.insert((object.class_id, store.heap.record(object.handle).id()));
        }
    } else {
        for object in affected {
            let store = inner.stores.get(&object.class_id).expect("store exists");
            let id = store.commit_object(object.handle, commit_version, inner.blob_heap.as_ref());
            written.insert((object.class_id, id));
        }
    }

    for key in &log.affected_invrefs {
        inner.invref.commit_modification(*key, identity.id, commit_version);
    }

    for lock in &log.object_read_locks {
        let store = inner.stores.get(&lock.class_id).expect("store exists");
        let id = store.heap.record(lock.handle).id();
        let also_wrote = written.contains(&(lock.class_id, id));
        store
            .heap
            .commit_reader_lock(lock.handle, identity.slot, commit_version, also_wrote);
    }
    for key in &log.invref_read_locks {
        let also_wrote = log.affected_invrefs.contains(key);
        inner
            .invref
            .commit_reader_lock(*key, identity.slot, commit_version, also_wrote);
    }
    for key_lock in &log.key_read_locks {
        let store = inner.stores.get(&key_lock.class_id).expect("store exists");
        store.hash_indexes[key_lock.index_pos]
            .index
            .release_key_lock(&key_lock.key, identity.slot);
    }
    for range in &log.range_locks {
        let store = inner.stores.get(&range.class_id).expect("store exists");
        store.sorted_indexes[range.index_pos]
            .index
            .finalize_range(range.node, range.lock_id, commit_version);
    }

    // Newly committed deltas are merge candidates right away
    for key in &log.affected_invrefs {
        inner.invref.merge(*key, commit_version, false);
    }
}

// =============================================================================
// Rollback path
// =============================================================================

/// Reverse every recorded effect: reader locks first, then key and range
/// locks, then the structural undo of index entries, records, and
/// inverse-reference deltas.
pub(crate) fn undo_effects(inner: &DatabaseInner, tran: &mut Transaction) {
    let identity = tran.identity;
    let log = &mut tran.log;

    for lock in &log.object_read_locks {
        if let Some(store) = inner.stores.get(&lock.class_id) {
            store.heap.release_reader_lock(lock.handle, identity.slot);
        }
    }
    for key in &log.invref_read_locks {
        inner.invref.release_reader_lock(*key, identity.slot);
    }
    for key_lock in &log.key_read_locks {
        if let Some(store) = inner.stores.get(&key_lock.class_id) {
            store.hash_indexes[key_lock.index_pos]
                .index
                .release_key_lock(&key_lock.key, identity.slot);
        }
    }
    for range in &log.range_locks {
        if let Some(store) = inner.stores.get(&range.class_id) {
            store.sorted_indexes[range.index_pos]
                .index
                .release_range(range.node, range.lock_id);
        }
    }

    // Structural undo in reverse apply order
    for undo in log.index_undo.iter().rev() {
        if let Some(store) = inner.stores.get(&undo.class_id) {
            store.remove_index_entry(undo);
        }
    }
    for object in log.affected_objects.iter().rev() {
        if let Some(store) = inner.stores.get(&object.class_id) {
            store.rollback_object(object.handle, inner.blob_heap.as_ref());
        }
    }
    for key in &log.affected_invrefs {
        inner.invref.rollback_modification(*key, identity.id);
    }

    log.clear();
}

pub(crate) fn release_class_locks(inner: &DatabaseInner, tran: &mut Transaction) {
    for class in tran.read_classes.drain(..) {
        inner.class_locks.unlock_read(class);
    }
    for class in tran.write_classes.drain(..) {
        inner.class_locks.unlock_write(class);
    }
}

pub(crate) fn release_snapshot(inner: &DatabaseInner, tran: &mut Transaction) {
    inner.slots.release(tran.identity.slot);
    inner.gate.leave();
}
