//! Transaction lifecycle: snapshot isolation, conflicts, rollback, GC.

mod common;

use common::*;
use velox_core::error::DbError;
use velox_core::types::ObjectId;
use velox_core::value::PropertyValue;
use velox_core::{ChangesetBuilder, TranSource, TranType};

#[test]
fn test_insert_commit_read() {
    let db = open_order_db();
    let commit_version = insert_order(&db, 1, 10);
    assert!(commit_version > 0);
    assert_eq!(read_order_x(&db, 1), Some(10));

    let (started, committed, aborted, _) = db.counters();
    assert!(started >= 2);
    assert!(committed >= 2);
    assert_eq!(aborted, 0);
}

#[test]
fn test_uncommitted_writes_invisible_to_others() {
    let db = open_order_db();
    let mut writer = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .insert(ORDER, vec![X])
        .entry(ObjectId::new(1), vec![PropertyValue::Int(10)]);
    db.apply(&mut writer, &builder.build()).unwrap();

    // The writer sees its own write
    let own = db.get_object(&mut writer, ORDER, ObjectId::new(1)).unwrap();
    assert!(own.is_some());

    // A concurrent reader does not
    assert_eq!(read_order_x(&db, 1), None);

    db.commit(writer).unwrap();
    assert_eq!(read_order_x(&db, 1), Some(10));
}

#[test]
fn test_snapshot_stability_across_commits() {
    let db = open_order_db();
    insert_order(&db, 1, 10);

    let mut old_reader = db.begin(TranType::Read, TranSource::Client).unwrap();
    update_order(&db, 1, 20);

    // The reader begun before the update keeps seeing the old value
    let values = db.get_object(&mut old_reader, ORDER, ObjectId::new(1)).unwrap().unwrap();
    assert_eq!(values[0], PropertyValue::Int(10));
    db.commit(old_reader).unwrap();

    assert_eq!(read_order_x(&db, 1), Some(20));
}

#[test]
fn test_write_write_conflict() {
    let db = open_order_db();
    insert_order(&db, 1, 10);

    let mut t1 = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .update(ORDER, vec![X])
        .entry(ObjectId::new(1), vec![PropertyValue::Int(11)]);
    db.apply(&mut t1, &builder.build()).unwrap();

    // t2 races t1's uncommitted write and conflicts; apply rolls it back
    let mut t2 = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .update(ORDER, vec![X])
        .entry(ObjectId::new(1), vec![PropertyValue::Int(12)]);
    let error = db.apply(&mut t2, &builder.build()).unwrap_err();
    assert!(error.is_conflict());
    assert!(db.commit(t2).is_err(), "a rolled-back transaction cannot commit");

    db.commit(t1).unwrap();
    assert_eq!(read_order_x(&db, 1), Some(11));

    let (_, _, aborted, conflicts) = db.counters();
    assert!(aborted >= 1);
    assert!(conflicts >= 1);
}

#[test]
fn test_stale_snapshot_write_conflicts() {
    let db = open_order_db();
    insert_order(&db, 1, 10);

    // t1 snapshots, then t2 commits a newer version
    let mut t1 = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    update_order(&db, 1, 20);

    let mut builder = ChangesetBuilder::new();
    builder
        .update(ORDER, vec![X])
        .entry(ObjectId::new(1), vec![PropertyValue::Int(30)]);
    let error = db.apply(&mut t1, &builder.build()).unwrap_err();
    assert!(error.is_conflict());
    assert_eq!(read_order_x(&db, 1), Some(20));
}

#[test]
fn test_reader_lock_conflicts_with_writer() {
    let db = open_order_db();
    insert_order(&db, 1, 10);

    // t1 (read-write) reads the object, parking a reader lock
    let mut t1 = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    assert!(db.get_object(&mut t1, ORDER, ObjectId::new(1)).unwrap().is_some());

    // t2's write on the read-locked object conflicts
    let mut t2 = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .update(ORDER, vec![X])
        .entry(ObjectId::new(1), vec![PropertyValue::Int(11)]);
    assert!(db.apply(&mut t2, &builder.build()).unwrap_err().is_conflict());

    // Once t1 commits (read only, lock committed out at its version), a
    // fresh writer passes
    db.commit(t1).unwrap();
    update_order(&db, 1, 11);
    assert_eq!(read_order_x(&db, 1), Some(11));
}

#[test]
fn test_rollback_restores_previous_state() {
    let db = open_order_db();
    insert_order(&db, 1, 10);

    let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .update(ORDER, vec![X])
        .entry(ObjectId::new(1), vec![PropertyValue::Int(99)]);
    builder
        .insert(ORDER, vec![X])
        .entry(ObjectId::new(2), vec![PropertyValue::Int(50)]);
    db.apply(&mut tran, &builder.build()).unwrap();
    db.rollback(tran).unwrap();

    assert_eq!(read_order_x(&db, 1), Some(10));
    assert_eq!(read_order_x(&db, 2), None);

    // The rolled-back insert left no index entry behind
    let mut reader = db.begin(TranType::Read, TranSource::Client).unwrap();
    let hits = db
        .hash_lookup(&mut reader, ORDER, BY_X, vec![PropertyValue::Int(50)])
        .unwrap();
    assert!(hits.is_empty());
    db.commit(reader).unwrap();
}

#[test]
fn test_delete_and_reinsert() {
    let db = open_order_db();
    insert_order(&db, 1, 10);

    let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder.delete(ORDER).entry(ObjectId::new(1), vec![]);
    db.apply(&mut tran, &builder.build()).unwrap();
    db.commit(tran).unwrap();
    assert_eq!(read_order_x(&db, 1), None);

    insert_order(&db, 1, 77);
    assert_eq!(read_order_x(&db, 1), Some(77));
}

#[test]
fn test_data_errors() {
    let db = open_order_db();
    insert_order(&db, 1, 10);

    // Duplicate id
    let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .insert(ORDER, vec![X])
        .entry(ObjectId::new(1), vec![PropertyValue::Int(1)]);
    assert!(matches!(
        db.apply(&mut tran, &builder.build()),
        Err(DbError::NonUniqueId { .. })
    ));

    // Zero id
    let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .insert(ORDER, vec![X])
        .entry(ObjectId::NULL, vec![PropertyValue::Int(1)]);
    assert!(matches!(
        db.apply(&mut tran, &builder.build()),
        Err(DbError::ZeroId { .. })
    ));

    // Update of a nonexistent object
    let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .update(ORDER, vec![X])
        .entry(ObjectId::new(42), vec![PropertyValue::Int(1)]);
    assert!(matches!(
        db.apply(&mut tran, &builder.build()),
        Err(DbError::UpdateNonExistent { .. })
    ));

    // Delete of a nonexistent object
    let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder.delete(ORDER).entry(ObjectId::new(42), vec![]);
    assert!(matches!(
        db.apply(&mut tran, &builder.build()),
        Err(DbError::DeleteNonExistent { .. })
    ));
}

#[test]
fn test_read_transaction_rejects_writes() {
    let db = open_order_db();
    let mut tran = db.begin(TranType::Read, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .insert(ORDER, vec![X])
        .entry(ObjectId::new(1), vec![PropertyValue::Int(1)]);
    assert!(matches!(
        db.apply(&mut tran, &builder.build()),
        Err(DbError::ReadTranWriteAttempt)
    ));
}

#[test]
fn test_cancellation_rolls_back() {
    let db = open_order_db();
    let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let handle = tran.cancel_handle();
    handle.cancel();

    let mut builder = ChangesetBuilder::new();
    builder
        .insert(ORDER, vec![X])
        .entry(ObjectId::new(1), vec![PropertyValue::Int(1)]);
    assert!(matches!(
        db.apply(&mut tran, &builder.build()),
        Err(DbError::TransactionCanceled)
    ));
    assert_eq!(read_order_x(&db, 1), None);
}

#[test]
fn test_rewind_undoes_and_keeps_transaction_open() {
    let db = open_order_db();
    insert_order(&db, 1, 10);

    let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .update(ORDER, vec![X])
        .entry(ObjectId::new(1), vec![PropertyValue::Int(99)]);
    builder.rewind(ORDER);
    builder
        .insert(ORDER, vec![X])
        .entry(ObjectId::new(2), vec![PropertyValue::Int(20)]);
    db.apply(&mut tran, &builder.build()).unwrap();
    db.commit(tran).unwrap();

    // The rewound update never happened; the post-rewind insert did
    assert_eq!(read_order_x(&db, 1), Some(10));
    assert_eq!(read_order_x(&db, 2), Some(20));
}

#[test]
fn test_gc_is_idempotent_and_preserves_visible_state() {
    let db = open_order_db();
    insert_order(&db, 1, 10);
    update_order(&db, 1, 20);
    update_order(&db, 1, 30);

    db.collect_garbage_now();
    assert_eq!(read_order_x(&db, 1), Some(30));
    db.collect_garbage_now();
    assert_eq!(read_order_x(&db, 1), Some(30));

    // Deleted objects disappear entirely once the horizon passes them
    let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder.delete(ORDER).entry(ObjectId::new(1), vec![]);
    db.apply(&mut tran, &builder.build()).unwrap();
    db.commit(tran).unwrap();

    db.collect_garbage_now();
    db.collect_garbage_now();
    assert_eq!(read_order_x(&db, 1), None);
}

#[test]
fn test_gc_spares_live_snapshots() {
    let db = open_order_db();
    insert_order(&db, 1, 10);

    let mut old_reader = db.begin(TranType::Read, TranSource::Client).unwrap();
    update_order(&db, 1, 20);

    db.collect_garbage_now();

    // The old snapshot still resolves through the retained version
    let values = db.get_object(&mut old_reader, ORDER, ObjectId::new(1)).unwrap().unwrap();
    assert_eq!(values[0], PropertyValue::Int(10));
    db.commit(old_reader).unwrap();
}

#[test]
fn test_blob_refcounts_follow_rollback_and_gc() {
    let db = open_order_db();
    let note = db.blob_heap().alloc(b"hello".to_vec());

    let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .insert(ORDER, vec![X, NOTE])
        .entry(
            ObjectId::new(1),
            vec![PropertyValue::Int(1), PropertyValue::String(note)],
        );
    db.apply(&mut tran, &builder.build()).unwrap();
    db.rollback(tran).unwrap();

    // Rollback released the transferred ownership
    assert!(db.blob_heap().retrieve(note).is_none());
}

#[test]
fn test_commit_assigns_monotonic_versions() {
    let db = open_order_db();
    let v1 = insert_order(&db, 1, 1);
    let v2 = insert_order(&db, 2, 2);
    let v3 = update_order(&db, 1, 3);
    assert!(v1 < v2 && v2 < v3);
    assert_eq!(db.committed_version(), v3);
}

#[test]
fn test_dispose_refuses_new_transactions() {
    let db = open_order_db();
    insert_order(&db, 1, 10);
    db.dispose();
    assert!(matches!(
        db.begin(TranType::Read, TranSource::Client),
        Err(DbError::DatabaseDisposed)
    ));
}
