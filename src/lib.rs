//! VeloxDB: an in-memory, multi-version, ACID transactional object store
//!
//! The facade crate re-exports the engine surface plus the core types a
//! client needs to define a model, build changesets, and run
//! transactions.
//!
//! # Example
//!
//! ```
//! use veloxdb::{
//!     ChangesetBuilder, ClassMeta, DataModel, Database, EngineConfig, ObjectId, PropertyKind,
//!     PropertyMeta, PropertyValue, TranSource, TranType,
//! };
//!
//! let model = DataModel::new(vec![ClassMeta::new(1, "Point")
//!     .with_property(PropertyMeta::simple(1, "x", PropertyKind::Int))])
//! .unwrap();
//! let db = Database::open(model, EngineConfig::default()).unwrap();
//!
//! let mut tran = db.begin(TranType::ReadWrite, TranSource::Client).unwrap();
//! let mut builder = ChangesetBuilder::new();
//! builder
//!     .insert(veloxdb::ClassId(1), vec![veloxdb::PropertyId(1)])
//!     .entry(ObjectId::new(1), vec![PropertyValue::Int(7)]);
//! db.apply(&mut tran, &builder.build()).unwrap();
//! db.commit(tran).unwrap();
//! ```

pub use velox_concurrency::{CancelHandle, TranStatus, Transaction};
pub use velox_core::{
    BlobHandle, BlobHeap, BlockOp, ChangeBlock, ChangeEntry, Changeset, ChangesetBuilder, ClassId,
    ClassMeta, DataModel, DbError, DbResult, DeleteAction, EngineConfig, HashIndexMeta, IndexId,
    InMemoryBlobHeap, Multiplicity, ObjectId, Persistence, PropertyId, PropertyKind, PropertyMeta,
    PropertyValue, ReferenceMeta, Replicator, SortedIndexMeta, TranSource, TranType, Version,
};
pub use velox_engine::Database;
