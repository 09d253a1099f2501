//! Shared fixtures for the engine integration tests.
#![allow(dead_code)]

use velox_core::config::EngineConfig;
use velox_core::model::{
    ClassMeta, DataModel, DeleteAction, HashIndexMeta, Multiplicity, PropertyMeta, SortedIndexMeta,
};
use velox_core::types::{ClassId, IndexId, ObjectId, PropertyId};
use velox_core::value::{PropertyKind, PropertyValue};
use velox_core::{ChangesetBuilder, TranSource, TranType};
use velox_engine::Database;

pub const ORDER: ClassId = ClassId(1);
pub const X: PropertyId = PropertyId(10);
pub const NOTE: PropertyId = PropertyId(11);
pub const BY_X: IndexId = IndexId(100);
pub const BY_X_SORTED: IndexId = IndexId(101);

/// One class with an int property carrying a unique hash index and a
/// non-unique sorted index, plus an interned string property.
pub fn order_model() -> DataModel {
    let order = ClassMeta::new(ORDER.0, "Order")
        .with_property(PropertyMeta::simple(X.0, "x", PropertyKind::Int))
        .with_property(PropertyMeta::simple(NOTE.0, "note", PropertyKind::String))
        .with_hash_index(HashIndexMeta {
            id: BY_X,
            name: "by_x".to_string(),
            unique: true,
            properties: vec![X],
        })
        .with_sorted_index(SortedIndexMeta {
            id: BY_X_SORTED,
            name: "by_x_sorted".to_string(),
            unique: false,
            properties: vec![X],
        });
    DataModel::new(vec![order]).unwrap()
}

pub const A: ClassId = ClassId(1);
pub const B: ClassId = ClassId(2);
pub const A_X: PropertyId = PropertyId(10);
pub const A_R: PropertyId = PropertyId(11);
pub const B_Y: PropertyId = PropertyId(20);

/// Class A carrying a tracked reference to class B with the given delete
/// action.
pub fn reference_model(delete_action: DeleteAction, multiplicity: Multiplicity) -> DataModel {
    let a = ClassMeta::new(A.0, "A")
        .with_property(PropertyMeta::simple(A_X.0, "x", PropertyKind::Int))
        .with_property(PropertyMeta::reference(
            A_R.0,
            "r",
            B,
            multiplicity,
            delete_action,
            true,
        ));
    let b = ClassMeta::new(B.0, "B").with_property(PropertyMeta::simple(B_Y.0, "y", PropertyKind::Int));
    DataModel::new(vec![a, b]).unwrap()
}

pub fn small_config() -> EngineConfig {
    EngineConfig::default()
        .with_initial_buckets(4)
        .with_node_capacity(6)
        .with_commit_workers(2)
}

pub fn open_order_db() -> Database {
    Database::open(order_model(), small_config()).unwrap()
}

/// Insert one Order(id, x) in its own committed transaction; returns the
/// commit version.
pub fn insert_order(db: &Database, id: u64, x: i32) -> u64 {
    let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .insert(ORDER, vec![X])
        .entry(ObjectId::new(id), vec![PropertyValue::Int(x)]);
    db.apply(&mut tran, &builder.build()).unwrap();
    db.commit(tran).unwrap()
}

/// Update one Order's x in its own committed transaction.
pub fn update_order(db: &Database, id: u64, x: i32) -> u64 {
    let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
    let mut builder = ChangesetBuilder::new();
    builder
        .update(ORDER, vec![X])
        .entry(ObjectId::new(id), vec![PropertyValue::Int(x)]);
    db.apply(&mut tran, &builder.build()).unwrap();
    db.commit(tran).unwrap()
}

/// Read Order.x through a fresh read transaction.
pub fn read_order_x(db: &Database, id: u64) -> Option<i32> {
    let mut tran = db.begin(TranType::Read, TranSource::Client).unwrap();
    let values = db.get_object(&mut tran, ORDER, ObjectId::new(id)).unwrap();
    db.commit(tran).unwrap();
    values.map(|values| match values[0] {
        PropertyValue::Int(x) => x,
        ref other => panic!("unexpected value {:?}", other),
    })
}
