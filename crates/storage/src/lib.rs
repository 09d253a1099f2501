//! velox-storage: the in-memory data structures of the Velox object store
//!
//! Slab arenas with 64-bit handles, bucket tables with lock-word buckets,
//! the per-class object heap with MVCC version chains, secondary hash and
//! sorted (B+tree) indexes, the inverse-reference map, and the
//! per-transaction effect log the concurrency layer finalizes or
//! reverses.

pub mod arena;
pub mod bucket;
pub mod class_store;
pub mod effects;
pub mod hash_index;
pub mod heap;
pub mod invref;
pub mod key;
pub mod record;
pub mod resize;
pub mod sorted;

pub use arena::{Slab, SlotRef};
pub use bucket::{BucketGuard, BucketTable};
pub use class_store::{ClassStore, HashIndexSlot, SortedIndexSlot};
pub use effects::{
    AffectedObject, EffectLog, IndexEntryUndo, InvRefChange, KeyReadLock, ObjectReadLock,
    RangeLockRef, WriteKind,
};
pub use hash_index::HashIndex;
pub use heap::{ClassHeap, VisibleObject, WriteOutcome};
pub use invref::{InvRefKey, InverseRefMap};
pub use key::{EntryKey, IndexKey, KeyReader};
pub use record::{ObjectRecord, ReaderLocks, RecordState};
pub use resize::ParallelGate;
pub use sorted::range::{KeyRangeLock, RangeBound};
pub use sorted::SortedIndex;
