//! External collaborator interfaces
//!
//! The core consumes durability, replication, and blob storage through
//! these traits; it owns none of their implementations. Null and in-memory
//! defaults keep the engine fully testable standalone.

use crate::error::DbResult;
use crate::types::BlobHandle;
use crate::version::TranId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Where a transaction originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranSource {
    /// Regular client request.
    Client,
    /// Inbound replication stream.
    Replication,
    /// Restore / alignment worker.
    Alignment,
    /// Engine-internal maintenance.
    Internal,
}

/// Read-only or read-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranType {
    /// Snapshot reads only.
    Read,
    /// Snapshot reads plus writes with conflict detection.
    ReadWrite,
}

/// Per-class alignment delegate: overwrites the payload positions with
/// the given values, property by property, without re-running validation.
/// One pointer is built per class from its descriptor at model load and
/// used only on replication/restore paths.
pub type AlignFn = fn(payload: &mut [crate::value::PropertyValue], positions: &[usize], values: &[crate::value::PropertyValue]);

/// The default alignment delegate: positional overwrite.
pub fn align_overwrite(
    payload: &mut [crate::value::PropertyValue],
    positions: &[usize],
    values: &[crate::value::PropertyValue],
) {
    for (position, value) in positions.iter().zip(values.iter()) {
        payload[*position] = value.clone();
    }
}

/// The interned blob/string heap.
///
/// Ref-counting is the sole ownership mechanism for blob payloads inside
/// objects: every record holding a handle owns one count.
pub trait BlobHeap: Send + Sync {
    /// Intern a payload, returning a handle with refcount 1.
    fn alloc(&self, payload: Vec<u8>) -> BlobHandle;
    /// Fetch a payload by handle.
    fn retrieve(&self, handle: BlobHandle) -> Option<Vec<u8>>;
    /// Version currently recorded on the handle.
    fn get_version(&self, handle: BlobHandle) -> u64;
    /// Record a version on the handle (commit advances first-written blobs).
    fn set_version(&self, handle: BlobHandle, version: u64);
    /// Add an owner.
    fn inc_refcount(&self, handle: BlobHandle);
    /// Drop an owner; the payload is freed when the count reaches zero.
    fn dec_refcount(&self, handle: BlobHandle);
}

/// In-memory blob heap used in tests and standalone deployments.
pub struct InMemoryBlobHeap {
    inner: Mutex<BlobHeapInner>,
}

impl Default for InMemoryBlobHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct BlobHeapInner {
    next: u64,
    slots: FxHashMap<u64, BlobSlot>,
}

struct BlobSlot {
    payload: Vec<u8>,
    version: u64,
    refcount: u64,
}

impl InMemoryBlobHeap {
    /// New empty heap.
    pub fn new() -> Self {
        InMemoryBlobHeap {
            inner: Mutex::new(BlobHeapInner {
                next: 1,
                slots: FxHashMap::default(),
            }),
        }
    }

    /// Number of live payloads; test hook.
    pub fn live_count(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

impl BlobHeap for InMemoryBlobHeap {
    fn alloc(&self, payload: Vec<u8>) -> BlobHandle {
        let mut inner = self.inner.lock();
        let raw = inner.next;
        inner.next += 1;
        inner.slots.insert(
            raw,
            BlobSlot {
                payload,
                version: 0,
                refcount: 1,
            },
        );
        BlobHandle(raw)
    }

    fn retrieve(&self, handle: BlobHandle) -> Option<Vec<u8>> {
        self.inner.lock().slots.get(&handle.0).map(|s| s.payload.clone())
    }

    fn get_version(&self, handle: BlobHandle) -> u64 {
        self.inner
            .lock()
            .slots
            .get(&handle.0)
            .map(|s| s.version)
            .unwrap_or(0)
    }

    fn set_version(&self, handle: BlobHandle, version: u64) {
        if let Some(slot) = self.inner.lock().slots.get_mut(&handle.0) {
            slot.version = version;
        }
    }

    fn inc_refcount(&self, handle: BlobHandle) {
        if handle.is_null() {
            return;
        }
        if let Some(slot) = self.inner.lock().slots.get_mut(&handle.0) {
            slot.refcount += 1;
        }
    }

    fn dec_refcount(&self, handle: BlobHandle) {
        if handle.is_null() {
            return;
        }
        let mut inner = self.inner.lock();
        let drop_slot = match inner.slots.get_mut(&handle.0) {
            Some(slot) => {
                slot.refcount = slot.refcount.saturating_sub(1);
                slot.refcount == 0
            }
            None => false,
        };
        if drop_slot {
            inner.slots.remove(&handle.0);
        }
    }
}

/// The persistence collaborator. The core delivers commits in log-sequence
/// order but owns no files.
pub trait Persistence: Send + Sync {
    /// Assign the next log sequence number; called inside the commit
    /// sequencer so sequence numbers align with commit versions.
    fn assign_log_sequence(&self) -> u64;
    /// Persist a committed transaction's effects.
    fn persist_commit(&self, tran: TranId, commit_version: u64, log_sequence: u64) -> DbResult<()>;
}

/// Persistence stub that assigns sequence numbers and drops the data.
#[derive(Default)]
pub struct NullPersistence {
    sequence: Mutex<u64>,
}

impl Persistence for NullPersistence {
    fn assign_log_sequence(&self) -> u64 {
        let mut seq = self.sequence.lock();
        *seq += 1;
        *seq
    }

    fn persist_commit(&self, _tran: TranId, _commit_version: u64, _log_sequence: u64) -> DbResult<()> {
        Ok(())
    }
}

/// The replication collaborator.
pub trait Replicator: Send + Sync {
    /// Invoked before the commit version is assigned.
    fn pre_commit(&self, tran: TranId) -> DbResult<()>;
    /// Invoked after finalization completes.
    fn post_commit(&self, tran: TranId, commit_version: u64);
    /// Invoked when a commit fails after `pre_commit`.
    fn failure(&self, tran: TranId);
    /// Permission gate for transaction creation.
    fn is_transaction_allowed(&self, source: TranSource, tran_type: TranType) -> bool;
}

/// Replicator stub that allows everything and observes nothing.
#[derive(Default)]
pub struct NullReplicator;

impl Replicator for NullReplicator {
    fn pre_commit(&self, _tran: TranId) -> DbResult<()> {
        Ok(())
    }

    fn post_commit(&self, _tran: TranId, _commit_version: u64) {}

    fn failure(&self, _tran: TranId) {}

    fn is_transaction_allowed(&self, _source: TranSource, _tran_type: TranType) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_heap_refcount_lifecycle() {
        let heap = InMemoryBlobHeap::new();
        let h = heap.alloc(b"payload".to_vec());
        assert_eq!(heap.retrieve(h).unwrap(), b"payload");

        heap.inc_refcount(h);
        heap.dec_refcount(h);
        assert!(heap.retrieve(h).is_some(), "one owner left");

        heap.dec_refcount(h);
        assert!(heap.retrieve(h).is_none(), "last owner released");
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_blob_heap_version() {
        let heap = InMemoryBlobHeap::new();
        let h = heap.alloc(vec![1]);
        assert_eq!(heap.get_version(h), 0);
        heap.set_version(h, 41);
        assert_eq!(heap.get_version(h), 41);
    }

    #[test]
    fn test_null_handle_refcount_is_noop() {
        let heap = InMemoryBlobHeap::new();
        heap.inc_refcount(BlobHandle::NULL);
        heap.dec_refcount(BlobHandle::NULL);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_null_persistence_sequences() {
        let p = NullPersistence::default();
        assert_eq!(p.assign_log_sequence(), 1);
        assert_eq!(p.assign_log_sequence(), 2);
    }
}
