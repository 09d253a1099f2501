//! Secondary indexes through the engine: uniqueness, lookups, ordered
//! scans, and range-lock phantom prevention.

mod common;

use common::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use velox_core::error::DbError;
use velox_core::types::ObjectId;
use velox_core::value::PropertyValue;
use velox_core::{ChangesetBuilder, TranSource, TranType};

#[test]
fn test_unique_hash_index_rejects_duplicates() {
    let db = open_order_db();
    insert_order(&db, 1, 5);

    // A duplicate key from another object fails
    let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .insert(ORDER, vec![X])
        .entry(ObjectId::new(2), vec![PropertyValue::Int(5)]);
    assert!(matches!(
        db.apply(&mut tran, &builder.build()),
        Err(DbError::UniquenessViolation { .. })
    ));

    // A distinct key passes
    insert_order(&db, 2, 6);

    let mut reader = db.begin(TranType::Read, TranSource::Client).unwrap();
    let five = db
        .hash_lookup(&mut reader, ORDER, BY_X, vec![PropertyValue::Int(5)])
        .unwrap();
    let six = db
        .hash_lookup(&mut reader, ORDER, BY_X, vec![PropertyValue::Int(6)])
        .unwrap();
    assert_eq!(five.len(), 1);
    assert_eq!(five[0].0, ObjectId::new(1));
    assert_eq!(six.len(), 1);
    assert_eq!(six[0].0, ObjectId::new(2));
    db.commit(reader).unwrap();
}

#[test]
fn test_hash_lookup_roundtrip_with_update_and_delete() {
    let db = open_order_db();
    insert_order(&db, 1, 5);
    update_order(&db, 1, 7);

    let mut reader = db.begin(TranType::Read, TranSource::Client).unwrap();
    assert!(db
        .hash_lookup(&mut reader, ORDER, BY_X, vec![PropertyValue::Int(5)])
        .unwrap()
        .is_empty());
    assert_eq!(
        db.hash_lookup(&mut reader, ORDER, BY_X, vec![PropertyValue::Int(7)])
            .unwrap()
            .len(),
        1
    );
    db.commit(reader).unwrap();

    let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder.delete(ORDER).entry(ObjectId::new(1), vec![]);
    db.apply(&mut tran, &builder.build()).unwrap();
    db.commit(tran).unwrap();

    let mut reader = db.begin(TranType::Read, TranSource::Client).unwrap();
    assert!(db
        .hash_lookup(&mut reader, ORDER, BY_X, vec![PropertyValue::Int(7)])
        .unwrap()
        .is_empty());
    db.commit(reader).unwrap();
}

#[test]
fn test_old_snapshot_resolves_old_index_key() {
    let db = open_order_db();
    insert_order(&db, 1, 5);

    let mut old_reader = db.begin(TranType::Read, TranSource::Client).unwrap();
    update_order(&db, 1, 7);

    // The old snapshot still finds the object under its old key
    let old_hits = db
        .hash_lookup(&mut old_reader, ORDER, BY_X, vec![PropertyValue::Int(5)])
        .unwrap();
    assert_eq!(old_hits.len(), 1);
    // ... and not under the new one
    assert!(db
        .hash_lookup(&mut old_reader, ORDER, BY_X, vec![PropertyValue::Int(7)])
        .unwrap()
        .is_empty());
    db.commit(old_reader).unwrap();
}

fn scan_xs(db: &velox_engine::Database, start: Option<(i32, bool)>, end: Option<(i32, bool)>, forward: bool) -> Vec<i32> {
    let mut reader = db.begin(TranType::Read, TranSource::Client).unwrap();
    let results = db
        .sorted_scan(
            &mut reader,
            ORDER,
            BY_X_SORTED,
            start.map(|(x, inclusive)| (vec![PropertyValue::Int(x)], inclusive)),
            end.map(|(x, inclusive)| (vec![PropertyValue::Int(x)], inclusive)),
            forward,
            usize::MAX,
        )
        .unwrap();
    db.commit(reader).unwrap();
    results
        .into_iter()
        .map(|(_, values)| match values[0] {
            PropertyValue::Int(x) => x,
            ref other => panic!("unexpected value {:?}", other),
        })
        .collect()
}

#[test]
fn test_sorted_scan_bounds_and_direction() {
    let db = open_order_db();
    for (id, x) in [(1u64, 1i32), (2, 3), (3, 5), (4, 7), (5, 9)] {
        insert_order(&db, id, x);
    }
    assert_eq!(scan_xs(&db, None, None, true), vec![1, 3, 5, 7, 9]);
    assert_eq!(scan_xs(&db, Some((2, true)), Some((7, true)), true), vec![3, 5, 7]);
    assert_eq!(scan_xs(&db, Some((3, false)), Some((9, false)), true), vec![5, 7]);
    assert_eq!(scan_xs(&db, Some((2, true)), Some((7, true)), false), vec![7, 5, 3]);
}

#[test]
fn test_range_scan_blocks_phantom_insert() {
    let db = open_order_db();
    for (id, x) in [(1u64, 1i32), (2, 3), (3, 5)] {
        insert_order(&db, id, x);
    }

    // t1 (read-write) scans x in [2, 4]
    let mut t1 = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let results = db
        .sorted_scan(
            &mut t1,
            ORDER,
            BY_X_SORTED,
            Some((vec![PropertyValue::Int(2)], true)),
            Some((vec![PropertyValue::Int(4)], true)),
            true,
            usize::MAX,
        )
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, ObjectId::new(2));

    // t2 inserts x = 4 inside the scanned interval and conflicts
    let mut t2 = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .insert(ORDER, vec![X])
        .entry(ObjectId::new(9), vec![PropertyValue::Int(4)]);
    let error = db.apply(&mut t2, &builder.build()).unwrap_err();
    assert!(error.is_conflict());

    // t1 commits; a retry on a fresh snapshot succeeds
    db.commit(t1).unwrap();
    let mut t3 = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .insert(ORDER, vec![X])
        .entry(ObjectId::new(9), vec![PropertyValue::Int(4)]);
    db.apply(&mut t3, &builder.build()).unwrap();
    db.commit(t3).unwrap();

    assert_eq!(scan_xs(&db, Some((2, true)), Some((4, true)), true), vec![3, 4]);
}

#[test]
fn test_range_scan_blocks_phantom_delete() {
    let db = open_order_db();
    for (id, x) in [(1u64, 1i32), (2, 3), (3, 5)] {
        insert_order(&db, id, x);
    }

    let mut t1 = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    db.sorted_scan(
        &mut t1,
        ORDER,
        BY_X_SORTED,
        Some((vec![PropertyValue::Int(2)], true)),
        Some((vec![PropertyValue::Int(4)], true)),
        true,
        usize::MAX,
    )
    .unwrap();

    // Deleting the scanned object from another transaction conflicts
    let mut t2 = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder.delete(ORDER).entry(ObjectId::new(2), vec![]);
    assert!(db.apply(&mut t2, &builder.build()).unwrap_err().is_conflict());
    db.commit(t1).unwrap();
}

#[test]
fn test_split_merge_stability_random_churn() {
    let db = open_order_db();
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);

    // Insert ids 1..=60 with x = id in random order, driving splits at
    // node capacity 6
    let mut ids: Vec<u64> = (1..=60).collect();
    ids.shuffle(&mut rng);
    for id in &ids {
        insert_order(&db, *id, *id as i32);
    }
    assert_eq!(scan_xs(&db, None, None, true), (1..=60).map(|x| x as i32).collect::<Vec<_>>());

    // Delete half in reverse insertion order, driving merges
    let deleted: Vec<u64> = ids.iter().rev().take(30).copied().collect();
    for id in &deleted {
        let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
        let mut builder = ChangesetBuilder::new();
        builder.delete(ORDER).entry(ObjectId::new(*id), vec![]);
        db.apply(&mut tran, &builder.build()).unwrap();
        db.commit(tran).unwrap();
    }
    db.collect_garbage_now();

    let mut survivors: Vec<i32> = ids
        .iter()
        .filter(|id| !deleted.contains(id))
        .map(|id| *id as i32)
        .collect();
    survivors.sort_unstable();
    assert_eq!(scan_xs(&db, None, None, true), survivors);
}

#[test]
fn test_class_scan_matches_index_scan() {
    let db = open_order_db();
    for id in 1..=40u64 {
        insert_order(&db, id, id as i32);
    }
    let mut reader = db.begin(TranType::Read, TranSource::Client).unwrap();
    let mut scanned: Vec<u64> = db
        .class_scan(&mut reader, ORDER, false)
        .unwrap()
        .into_iter()
        .map(|(id, _)| id.as_u64())
        .collect();
    db.commit(reader).unwrap();
    scanned.sort_unstable();
    assert_eq!(scanned, (1..=40).collect::<Vec<_>>());
}
