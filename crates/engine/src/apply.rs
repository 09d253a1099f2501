//! Changeset application pipeline
//!
//! Blocks apply in order against their class stores; reference-property
//! writes accumulate as pending inverse-reference operations that are
//! grouped and flushed after the pass; the reference validator then
//! checks newly inserted references, enforces non-null multiplicities,
//! and generates cascade changesets (delete-cascade, set-to-null) that
//! feed back through the same pipeline until fixpoint.

use crate::database::{store_of, undo_effects, DatabaseInner};
use velox_concurrency::Transaction;
use velox_core::changeset::{BlockOp, Changeset, ChangesetBuilder};
use velox_core::error::{DbError, DbResult};
use velox_core::model::{DeleteAction, Multiplicity};
use velox_core::types::{ClassId, ObjectId, PropertyId};
use velox_core::value::PropertyValue;
use velox_storage::{InvRefChange, InvRefKey};

/// A delete's inbound reference set, captured before its tombstones hid
/// it, awaiting cascade generation.
struct PendingCascade {
    target: ObjectId,
    property: PropertyId,
    sources: Vec<ObjectId>,
}

/// Apply a changeset plus every cascade it induces.
pub(crate) fn apply_changeset(
    inner: &DatabaseInner,
    tran: &mut Transaction,
    changeset: &Changeset,
) -> DbResult<()> {
    let affected_mark = tran.log.affected_objects.len();
    let mut cascades: Vec<PendingCascade> = Vec::new();
    apply_blocks(inner, tran, changeset, &mut cascades)?;

    loop {
        let applied = flush_invref_ops(inner, tran)?;
        validate_inserted_references(inner, tran, &applied)?;
        let cascade = build_cascades(inner, tran, &mut cascades)?;
        match cascade {
            Some(cascade) => apply_blocks(inner, tran, &cascade, &mut cascades)?,
            None => break,
        }
    }
    validate_non_null(inner, tran, affected_mark)?;
    Ok(())
}

/// The reference set of a target as this transaction observes it: the
/// map's visible state adjusted by the not-yet-flushed pending
/// operations.
fn effective_sources(
    inner: &DatabaseInner,
    tran: &Transaction,
    target: ObjectId,
    property: PropertyId,
) -> DbResult<Vec<ObjectId>> {
    let key = InvRefKey { target, property };
    let mut sources = inner.invref.get_references(&tran.identity, key, None)?;
    for op in &tran.log.pending_invref_ops {
        if op.target == target && op.property == property {
            if op.insert {
                sources.push(op.source);
            } else {
                sources.retain(|s| *s != op.source);
            }
        }
    }
    Ok(sources)
}

fn apply_blocks(
    inner: &DatabaseInner,
    tran: &mut Transaction,
    changeset: &Changeset,
    cascades: &mut Vec<PendingCascade>,
) -> DbResult<()> {
    for block in changeset.blocks() {
        match block.op {
            BlockOp::Rewind => {
                // Undo everything the transaction has applied so far and
                // keep it open.
                undo_effects(inner, tran);
                cascades.clear();
                continue;
            }
            BlockOp::DropClass => {
                drop_class(inner, tran, block.class_id)?;
                continue;
            }
            _ => {}
        }

        let store = store_of(inner, block.class_id)?;
        lock_class_read(inner, tran, block.class_id);
        match block.op {
            BlockOp::Insert => store.insert_block(&tran.identity, &inner.slots, block, &mut tran.log)?,
            BlockOp::Update => store.update_block(
                &tran.identity,
                &inner.slots,
                block,
                inner.blob_heap.as_ref(),
                false,
                &mut tran.log,
            )?,
            BlockOp::DefaultValue => store.update_block(
                &tran.identity,
                &inner.slots,
                block,
                inner.blob_heap.as_ref(),
                true,
                &mut tran.log,
            )?,
            BlockOp::Delete => {
                store.delete_block(
                    &tran.identity,
                    &inner.slots,
                    block,
                    inner.blob_heap.as_ref(),
                    &mut tran.log,
                )?;
                // Capture each target's inbound reference set before the
                // tombstones hide it, then tombstone every inbound
                // tracked property so concurrent reference inserts
                // against the dying target conflict
                let inbound = inner.model.inbound_tracked_properties(block.class_id);
                if !inbound.is_empty() {
                    for entry in &block.entries {
                        for property in &inbound {
                            let sources = effective_sources(inner, tran, entry.id, *property)?;
                            if !sources.is_empty() {
                                cascades.push(PendingCascade {
                                    target: entry.id,
                                    property: *property,
                                    sources,
                                });
                            }
                        }
                        inner.invref.delete_target(
                            &tran.identity,
                            &inner.slots,
                            entry.id,
                            &inbound,
                            &mut tran.log,
                        )?;
                    }
                }
            }
            BlockOp::Rewind | BlockOp::DropClass => unreachable!("handled above"),
        }
        store.maybe_resize();
    }
    Ok(())
}

fn lock_class_read(inner: &DatabaseInner, tran: &mut Transaction, class: ClassId) {
    if tran.read_classes.contains(&class) || tran.write_classes.contains(&class) {
        return;
    }
    inner.class_locks.lock_read(class);
    tran.read_classes.push(class);
}

fn lock_class_write(inner: &DatabaseInner, tran: &mut Transaction, class: ClassId) {
    if tran.write_classes.contains(&class) {
        return;
    }
    if let Some(position) = tran.read_classes.iter().position(|c| *c == class) {
        tran.read_classes.remove(position);
        inner.class_locks.unlock_read(class);
    }
    inner.class_locks.lock_write(class);
    tran.write_classes.push(class);
}

/// Drop-class removes every object of the class under its write lock.
/// The removal is immediate and survives a later rollback of the
/// enclosing transaction.
fn drop_class(inner: &DatabaseInner, tran: &mut Transaction, class: ClassId) -> DbResult<()> {
    let store = store_of(inner, class)?;
    lock_class_write(inner, tran, class);
    let dropped = store.drop_all(inner.blob_heap.as_ref());
    inner.invref.purge_targets(&dropped);
    Ok(())
}

/// Group accumulated inverse-reference operations by target id (and, per
/// target, order sources) and flush them into the map.
fn flush_invref_ops(inner: &DatabaseInner, tran: &mut Transaction) -> DbResult<Vec<InvRefChange>> {
    let mut ops = std::mem::take(&mut tran.log.pending_invref_ops);
    if ops.is_empty() {
        return Ok(ops);
    }
    ops.sort_unstable_by_key(|op| (op.target.as_u64(), op.property.0, op.source.as_u64()));

    let mut start = 0;
    while start < ops.len() {
        let group = (ops[start].target, ops[start].property);
        let mut end = start;
        while end < ops.len() && (ops[end].target, ops[end].property) == group {
            end += 1;
        }
        let mut inserts = Vec::new();
        let mut deletes = Vec::new();
        for op in &ops[start..end] {
            if op.insert {
                inserts.push(op.source);
            } else {
                deletes.push(op.source);
            }
        }
        inner.invref.modify(
            &tran.identity,
            &inner.slots,
            InvRefKey {
                target: group.0,
                property: group.1,
            },
            true,
            &inserts,
            &deletes,
            &mut tran.log,
        )?;
        start = end;
    }
    Ok(ops)
}

/// The class a reference property points into, with its declaring class.
fn property_reference(inner: &DatabaseInner, property: PropertyId) -> Option<(ClassId, DeleteAction, ClassId)> {
    for class in inner.model.classes() {
        if let Some(meta) = class.property(property) {
            if let Some(reference) = &meta.reference {
                return Some((reference.target_class, reference.delete_action, class.id));
            }
        }
    }
    None
}

fn object_exists(inner: &DatabaseInner, tran: &Transaction, class: ClassId, id: ObjectId) -> bool {
    inner
        .model
        .subtree_of(class)
        .iter()
        .filter_map(|class_id| inner.stores.get(class_id))
        .any(|store| store.get(&tran.identity, id, None).is_some())
}

/// Every newly inserted reference must point at a live object.
fn validate_inserted_references(
    inner: &DatabaseInner,
    tran: &mut Transaction,
    applied: &[InvRefChange],
) -> DbResult<()> {
    for op in applied {
        if !op.insert {
            continue;
        }
        let Some((target_class, _, _)) = property_reference(inner, op.property) else {
            return Err(DbError::InverseReferenceNotTracked {
                property: op.property,
            });
        };
        if !object_exists(inner, tran, target_class, op.target) {
            return Err(DbError::UnknownReference {
                object_id: op.source,
                property: op.property,
                target: op.target,
            });
        }
    }
    Ok(())
}

/// Multiplicity-one references must never be left null by a write.
fn validate_non_null(inner: &DatabaseInner, tran: &Transaction, affected_mark: usize) -> DbResult<()> {
    for object in &tran.log.affected_objects[affected_mark..] {
        if object.kind == velox_storage::WriteKind::Delete {
            continue;
        }
        let Some(store) = inner.stores.get(&object.class_id) else {
            continue;
        };
        let record = store.heap.record(object.handle);
        if record.is_deleted() {
            continue;
        }
        let payload = record.payload();
        for (position, property) in store.class.properties.iter().enumerate() {
            let Some(reference) = &property.reference else {
                continue;
            };
            if reference.multiplicity != Multiplicity::One {
                continue;
            }
            let null = matches!(payload.get(position), Some(PropertyValue::Reference(id)) if id.is_null());
            if null {
                return Err(DbError::NullReferenceNotAllowed {
                    object_id: record.id(),
                    property: property.id,
                });
            }
        }
    }
    Ok(())
}

/// Generate the cascade changeset induced by the deletions captured so
/// far: delete-cascade removes referencing objects, set-to-null rewrites
/// their reference to null, prevent fails the transaction.
fn build_cascades(
    inner: &DatabaseInner,
    tran: &mut Transaction,
    cascades: &mut Vec<PendingCascade>,
) -> DbResult<Option<Changeset>> {
    if cascades.is_empty() {
        return Ok(None);
    }

    let mut cascade_deletes: Vec<(ClassId, ObjectId)> = Vec::new();
    let mut cascade_nulls: Vec<(ClassId, PropertyId, ObjectId)> = Vec::new();

    for pending in cascades.drain(..) {
        let PendingCascade {
            target,
            property,
            sources,
        } = pending;
        let Some((_, delete_action, declaring_class)) = property_reference(inner, property) else {
            continue;
        };
        for source in sources {
            let Some(source_class) = find_object_class(inner, tran, declaring_class, source) else {
                continue; // the source died in this same transaction
            };
            if tran.log.deleted(source_class, source) {
                continue;
            }
            match delete_action {
                DeleteAction::Prevent => {
                    return Err(DbError::UnknownReference {
                        object_id: source,
                        property,
                        target,
                    });
                }
                DeleteAction::Cascade => cascade_deletes.push((source_class, source)),
                DeleteAction::SetNull => cascade_nulls.push((source_class, property, source)),
            }
        }
    }

    if cascade_deletes.is_empty() && cascade_nulls.is_empty() {
        return Ok(None);
    }

    let mut builder = ChangesetBuilder::new();
    cascade_deletes.sort_unstable_by_key(|(class, id)| (class.0, id.as_u64()));
    cascade_deletes.dedup();
    let mut index = 0;
    while index < cascade_deletes.len() {
        let class = cascade_deletes[index].0;
        let mut block = builder.delete(class);
        while index < cascade_deletes.len() && cascade_deletes[index].0 == class {
            block.entry(cascade_deletes[index].1, vec![]);
            index += 1;
        }
    }
    cascade_nulls.sort_unstable_by_key(|(class, property, id)| (class.0, property.0, id.as_u64()));
    cascade_nulls.dedup();
    let mut index = 0;
    while index < cascade_nulls.len() {
        let (class, property, _) = cascade_nulls[index];
        let mut block = builder.update(class, vec![property]);
        while index < cascade_nulls.len()
            && cascade_nulls[index].0 == class
            && cascade_nulls[index].1 == property
        {
            block.entry(
                cascade_nulls[index].2,
                vec![PropertyValue::Reference(ObjectId::NULL)],
            );
            index += 1;
        }
    }
    Ok(Some(builder.build()))
}

/// Locate the concrete class of an object among the declaring class's
/// subtree.
fn find_object_class(
    inner: &DatabaseInner,
    tran: &Transaction,
    declaring_class: ClassId,
    id: ObjectId,
) -> Option<ClassId> {
    for class_id in inner.model.subtree_of(declaring_class) {
        if let Some(store) = inner.stores.get(class_id) {
            if store.get(&tran.identity, id, None).is_some() {
                return Some(*class_id);
            }
        }
    }
    None
}
