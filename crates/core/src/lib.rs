//! velox-core: foundational types for the Velox object store
//!
//! This crate holds everything the storage and concurrency layers share:
//! identifier newtypes, version words, property values, the schema model,
//! changesets, the error taxonomy, transaction identity, and the traits
//! the engine consumes from its external collaborators (blob heap,
//! persistence, replication).

pub mod changeset;
pub mod config;
pub mod error;
pub mod external;
pub mod model;
pub mod tran;
pub mod types;
pub mod value;
pub mod version;

pub use changeset::{BlockOp, ChangeBlock, ChangeEntry, Changeset, ChangesetBuilder};
pub use config::EngineConfig;
pub use error::{DbError, DbResult};
pub use external::{
    BlobHeap, InMemoryBlobHeap, NullPersistence, NullReplicator, Persistence, Replicator,
    TranSource, TranType,
};
pub use model::{
    ClassMeta, DataModel, DeleteAction, HashIndexMeta, Multiplicity, PropertyMeta, ReferenceMeta,
    SortedIndexMeta,
};
pub use tran::{SlotTable, TranIdentity, TranSlot};
pub use types::{BlobHandle, ClassId, IndexId, ObjectId, PropertyId, RecordHandle};
pub use value::{PropertyKind, PropertyValue};
pub use version::{TranId, Version};
