use super::*;
use crate::key::IndexKey;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use velox_core::external::{TranSource, TranType};
use velox_core::types::ObjectId;
use velox_core::value::PropertyValue;
use velox_core::version::TranId;

fn entry(x: i64) -> EntryKey {
    EntryKey::new(
        IndexKey::single(PropertyValue::Long(x)),
        ObjectId::new(x as u64),
        RecordHandle::new(0, x as u64),
    )
}

fn tran(counter: u64, read_version: u64) -> TranIdentity {
    TranIdentity {
        id: TranId::from_counter(counter),
        read_version,
        commit_version: 0,
        tran_type: TranType::ReadWrite,
        source: TranSource::Client,
        slot: 0,
    }
}

fn index(capacity: usize) -> SortedIndex {
    SortedIndex::new(
        ClassId(1),
        "Order".to_string(),
        SortedIndexMeta {
            id: velox_core::types::IndexId(1),
            name: "by_x".to_string(),
            unique: false,
            properties: vec![velox_core::types::PropertyId(1)],
        },
        0,
        2,
        capacity,
    )
}

fn values(entries: &[EntryKey]) -> Vec<i64> {
    entries
        .iter()
        .map(|e| match &e.key.0[0] {
            PropertyValue::Long(x) => *x,
            other => panic!("unexpected key value {:?}", other),
        })
        .collect()
}

#[test]
fn test_insert_and_in_order_scan() {
    let tree = index(4);
    for x in [5i64, 1, 9, 3, 7] {
        tree.insert_unchecked(entry(x));
    }
    assert_eq!(values(&tree.collect_in_order()), vec![1, 3, 5, 7, 9]);
    tree.check_invariants().unwrap();
}

#[test]
fn test_splits_grow_depth() {
    let tree = index(4);
    for x in 1..=64i64 {
        tree.insert_unchecked(entry(x));
    }
    assert!(tree.depth() > 1, "64 entries at capacity 4 must split");
    assert_eq!(values(&tree.collect_in_order()), (1..=64).collect::<Vec<_>>());
    tree.check_invariants().unwrap();
}

#[test]
fn test_delete_rebalances_and_collapses() {
    let tree = index(4);
    for x in 1..=64i64 {
        tree.insert_unchecked(entry(x));
    }
    for x in 1..=63i64 {
        assert!(tree.remove_unchecked(&entry(x)), "entry {} must be present", x);
        tree.check_invariants().unwrap();
    }
    assert_eq!(values(&tree.collect_in_order()), vec![64]);
    assert_eq!(tree.depth(), 1, "a nearly empty tree collapses to its root");
}

#[test]
fn test_delete_missing_returns_false() {
    let tree = index(4);
    tree.insert_unchecked(entry(1));
    assert!(!tree.remove_unchecked(&entry(2)));
    assert_eq!(tree.entry_count(), 1);
}

#[test]
fn test_random_insert_delete_stability() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    let tree = index(6);
    let mut xs: Vec<i64> = (1..=600).collect();
    xs.shuffle(&mut rng);
    for x in &xs {
        tree.insert_unchecked(entry(*x));
    }
    tree.check_invariants().unwrap();

    // Delete half in reverse insertion order, checking invariants as we go
    let (delete, keep) = xs.split_at(300);
    let mut deleted: Vec<i64> = delete.to_vec();
    deleted.reverse();
    for (step, x) in deleted.iter().enumerate() {
        assert!(tree.remove_unchecked(&entry(*x)));
        if step % 37 == 0 {
            tree.check_invariants().unwrap();
        }
    }
    tree.check_invariants().unwrap();

    let mut expected: Vec<i64> = keep.to_vec();
    expected.sort_unstable();
    assert_eq!(values(&tree.collect_in_order()), expected);
}

#[test]
fn test_forward_scan_bounds() {
    let tree = index(4);
    for x in [1i64, 3, 5, 7, 9] {
        tree.insert_unchecked(entry(x));
    }
    let t = tran(1, 10);
    let results = tree.scan_forward(
        &t,
        RangeBound::at(entry(2), true),
        RangeBound::at(entry(7), true),
        usize::MAX,
        None,
    );
    assert_eq!(values(&results), vec![3, 5, 7]);
}

#[test]
fn test_forward_scan_open_bounds_and_limit() {
    let tree = index(4);
    for x in 1..=20i64 {
        tree.insert_unchecked(entry(x));
    }
    let t = tran(1, 10);
    let all = tree.scan_forward(&t, RangeBound::unbounded(), RangeBound::unbounded(), usize::MAX, None);
    assert_eq!(values(&all), (1..=20).collect::<Vec<_>>());

    let limited = tree.scan_forward(&t, RangeBound::unbounded(), RangeBound::unbounded(), 7, None);
    assert_eq!(values(&limited), (1..=7).collect::<Vec<_>>());

    let open = tree.scan_forward(
        &t,
        RangeBound::at(entry(3), false),
        RangeBound::at(entry(6), false),
        usize::MAX,
        None,
    );
    assert_eq!(values(&open), vec![4, 5]);
}

#[test]
fn test_backward_scan() {
    let tree = index(4);
    for x in 1..=10i64 {
        tree.insert_unchecked(entry(x));
    }
    let t = tran(1, 10);
    let results = tree.scan_backward(
        &t,
        RangeBound::at(entry(3), true),
        RangeBound::at(entry(8), true),
        usize::MAX,
        None,
    );
    assert_eq!(values(&results), vec![8, 7, 6, 5, 4, 3]);
}

#[test]
fn test_range_lock_blocks_foreign_insert() {
    let tree = index(4);
    for x in [1i64, 3, 5] {
        tree.insert_unchecked(entry(x));
    }
    let t1 = tran(1, 10);
    let mut log = EffectLog::new();
    let results = tree.scan_forward(
        &t1,
        RangeBound::at(entry(2), true),
        RangeBound::at(entry(4), true),
        usize::MAX,
        Some(&mut log),
    );
    assert_eq!(values(&results), vec![3]);
    assert!(!log.range_locks.is_empty());

    // A foreign insert inside the scanned interval conflicts
    let t2 = tran(2, 10);
    let err = tree.insert(&t2, entry(4), None).unwrap_err();
    assert!(err.is_conflict());

    // The owner itself may insert into its own range
    tree.insert(&t1, entry(4), None).unwrap();

    // Outside the interval, foreign inserts pass
    tree.insert(&t2, entry(9), None).unwrap();
}

#[test]
fn test_range_lock_release_unblocks() {
    let tree = index(4);
    for x in [1i64, 3, 5] {
        tree.insert_unchecked(entry(x));
    }
    let t1 = tran(1, 10);
    let mut log = EffectLog::new();
    tree.scan_forward(
        &t1,
        RangeBound::at(entry(2), true),
        RangeBound::at(entry(4), true),
        usize::MAX,
        Some(&mut log),
    );
    let t2 = tran(2, 10);
    assert!(tree.insert(&t2, entry(4), None).is_err());

    for range_ref in &log.range_locks {
        tree.release_range(range_ref.node, range_ref.lock_id);
    }
    tree.insert(&t2, entry(4), None).unwrap();
}

#[test]
fn test_finalized_range_conflicts_by_snapshot() {
    let tree = index(4);
    for x in [1i64, 3, 5] {
        tree.insert_unchecked(entry(x));
    }
    let t1 = tran(1, 10);
    let mut log = EffectLog::new();
    tree.scan_forward(
        &t1,
        RangeBound::at(entry(2), true),
        RangeBound::at(entry(4), true),
        usize::MAX,
        Some(&mut log),
    );
    // t1 commits at version 12
    for range_ref in &log.range_locks {
        tree.finalize_range(range_ref.node, range_ref.lock_id, 12);
    }

    // A transaction whose snapshot predates the commit still conflicts
    let stale = tran(2, 10);
    assert!(tree.insert(&stale, entry(4), None).is_err());

    // A transaction reading past the commit does not
    let fresh = tran(3, 12);
    tree.insert(&fresh, entry(4), None).unwrap();

    // GC retires the committed range once no snapshot predates it
    tree.sweep_ranges(12);
    let stale2 = tran(4, 10);
    tree.insert(&stale2, entry(2), None).unwrap();
}

#[test]
fn test_delete_conflicts_with_foreign_range() {
    let tree = index(4);
    for x in [1i64, 3, 5] {
        tree.insert_unchecked(entry(x));
    }
    let t1 = tran(1, 10);
    let mut log = EffectLog::new();
    tree.scan_forward(
        &t1,
        RangeBound::at(entry(2), true),
        RangeBound::at(entry(4), true),
        usize::MAX,
        Some(&mut log),
    );
    let t2 = tran(2, 10);
    let err = tree.delete(&t2, &entry(3)).unwrap_err();
    assert!(err.is_conflict());
}

#[test]
fn test_group_ranges_collapses_onto_parent() {
    let tree = index(4);
    for x in 1..=40i64 {
        tree.insert_unchecked(entry(x));
    }
    assert!(tree.depth() >= 2);

    let t1 = tran(1, 50);
    let mut log = EffectLog::new();
    tree.scan_forward(
        &t1,
        RangeBound::unbounded(),
        RangeBound::unbounded(),
        usize::MAX,
        Some(&mut log),
    );
    let before = log.range_locks.len();
    assert!(before > 1, "a multi-leaf scan must acquire several ranges");

    tree.group_ranges(&mut log);
    assert!(
        log.range_locks.len() < before,
        "grouping must collapse sibling ranges"
    );

    // The envelope still prevents foreign inserts in the scanned span
    let t2 = tran(2, 50);
    let inside = EntryKey::new(
        IndexKey::single(PropertyValue::Long(20)),
        ObjectId::new(9999),
        RecordHandle::new(0, 9999),
    );
    assert!(tree.insert(&t2, inside, None).is_err());
}

#[test]
fn test_scan_after_heavy_churn() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let tree = index(5);
    let mut live = Vec::new();
    for round in 0..5 {
        let mut xs: Vec<i64> = (round * 200 + 1..=round * 200 + 200).collect();
        xs.shuffle(&mut rng);
        for x in xs {
            tree.insert_unchecked(entry(x));
            live.push(x);
        }
        live.shuffle(&mut rng);
        for _ in 0..80 {
            let x = live.pop().unwrap();
            assert!(tree.remove_unchecked(&entry(x)));
        }
        tree.reclaim_nodes();
    }
    live.sort_unstable();
    assert_eq!(values(&tree.collect_in_order()), live);
    tree.check_invariants().unwrap();
}

mod props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Whatever the insertion order, the in-order walk is sorted and
        /// the structural invariants hold.
        #[test]
        fn prop_in_order_walk_is_sorted(mut xs in proptest::collection::vec(1i64..10_000, 1..200)) {
            xs.sort_unstable();
            xs.dedup();
            let mut shuffled = xs.clone();
            let mut rng = rand::rngs::StdRng::seed_from_u64(xs.len() as u64);
            shuffled.shuffle(&mut rng);

            let tree = index(5);
            for x in &shuffled {
                tree.insert_unchecked(entry(*x));
            }
            prop_assert_eq!(values(&tree.collect_in_order()), xs);
            prop_assert!(tree.check_invariants().is_ok());
        }

        /// Deleting an arbitrary subset leaves exactly the complement.
        #[test]
        fn prop_delete_subset(
            xs in proptest::collection::hash_set(1i64..5_000, 1..150),
            selector in any::<u64>(),
        ) {
            let xs: Vec<i64> = xs.into_iter().collect();
            let tree = index(5);
            for x in &xs {
                tree.insert_unchecked(entry(*x));
            }
            let mut kept: Vec<i64> = Vec::new();
            for (position, x) in xs.iter().enumerate() {
                if selector.rotate_left(position as u32) & 1 == 1 {
                    prop_assert!(tree.remove_unchecked(&entry(*x)));
                } else {
                    kept.push(*x);
                }
            }
            kept.sort_unstable();
            prop_assert_eq!(values(&tree.collect_in_order()), kept);
            prop_assert!(tree.check_invariants().is_ok());
        }
    }
}

#[test]
fn test_reclaim_returns_nodes_to_pool() {
    let tree = index(4);
    for x in 1..=100i64 {
        tree.insert_unchecked(entry(x));
    }
    for x in 1..=100i64 {
        tree.remove_unchecked(&entry(x));
    }
    assert!(tree.epoch.pending() > 0, "merges must retire nodes");
    tree.reclaim_nodes();
    assert_eq!(tree.epoch.pending(), 0);
}
