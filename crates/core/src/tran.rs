//! Transaction identity and the reader slot table
//!
//! Every transaction carries a [`TranIdentity`]: its uncommitted-marked id,
//! the snapshot horizon it reads at, the commit version assigned at commit,
//! and a stable small slot integer used for reader-lock bookkeeping on
//! records.
//!
//! The [`SlotTable`] hands out those slots and tracks each live
//! transaction's read version; its minimum is the garbage-collection
//! watermark: no committed version older than every live read version can
//! still be observed.

use crate::external::{TranSource, TranType};
use crate::version::TranId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reader bookkeeping slot index.
pub type TranSlot = u16;

/// Identity of a transaction.
#[derive(Debug, Clone, Copy)]
pub struct TranIdentity {
    /// Uncommitted-marked transaction id.
    pub id: TranId,
    /// Snapshot horizon: the highest committed version at begin.
    pub read_version: u64,
    /// Commit version, assigned by the commit sequencer (0 until then).
    pub commit_version: u64,
    /// Read or read-write.
    pub tran_type: TranType,
    /// Origin of the transaction.
    pub source: TranSource,
    /// Stable slot for reader bookkeeping.
    pub slot: TranSlot,
}

impl TranIdentity {
    /// Whether this transaction may write.
    #[inline]
    pub fn is_read_write(&self) -> bool {
        self.tran_type == TranType::ReadWrite
    }

    /// Whether this transaction applies pre-assigned commit versions.
    #[inline]
    pub fn is_alignment(&self) -> bool {
        self.source == TranSource::Alignment
    }
}

const SLOT_FREE: u64 = u64::MAX;

/// Per-slot state, updated with plain atomic stores under the table mutex
/// and read lock-free by conflict checks.
struct SlotState {
    /// Read version of the occupying transaction, or `SLOT_FREE`.
    read_version: AtomicU64,
    /// Commit version once assigned, 0 while live-uncommitted.
    commit_version: AtomicU64,
}

/// Fixed-capacity table of transaction slots.
///
/// Slots are deliberately small integers so records can store reader-lock
/// owners inline. A slot stays allocated from `begin` to the end of commit
/// finalization or rollback.
pub struct SlotTable {
    slots: Box<[SlotState]>,
    free: Mutex<Vec<TranSlot>>,
}

impl SlotTable {
    /// Create a table with the given capacity (also the maximum number of
    /// concurrently live transactions).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity <= TranSlot::MAX as usize);
        let slots = (0..capacity)
            .map(|_| SlotState {
                read_version: AtomicU64::new(SLOT_FREE),
                commit_version: AtomicU64::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Hand out low slots first
        let free = (0..capacity as u16).rev().collect();
        SlotTable {
            slots,
            free: Mutex::new(free),
        }
    }

    /// Acquire a slot for a transaction reading at `read_version`.
    ///
    /// Returns `None` when every slot is occupied.
    pub fn acquire(&self, read_version: u64) -> Option<TranSlot> {
        let slot = self.free.lock().pop()?;
        let state = &self.slots[slot as usize];
        state.commit_version.store(0, Ordering::Relaxed);
        state.read_version.store(read_version, Ordering::Release);
        Some(slot)
    }

    /// Record the commit version assigned to the slot's transaction.
    pub fn mark_committed(&self, slot: TranSlot, commit_version: u64) {
        self.slots[slot as usize]
            .commit_version
            .store(commit_version, Ordering::Release);
    }

    /// Release a slot after commit finalization or rollback.
    pub fn release(&self, slot: TranSlot) {
        let state = &self.slots[slot as usize];
        state.read_version.store(SLOT_FREE, Ordering::Release);
        self.free.lock().push(slot);
    }

    /// Whether the slot currently hosts a live transaction.
    #[inline]
    pub fn is_live(&self, slot: TranSlot) -> bool {
        self.slots[slot as usize].read_version.load(Ordering::Acquire) != SLOT_FREE
    }

    /// The commit version assigned to the slot's transaction, or 0.
    #[inline]
    pub fn commit_version_of(&self, slot: TranSlot) -> u64 {
        self.slots[slot as usize].commit_version.load(Ordering::Acquire)
    }

    /// The garbage-collection watermark: the lowest read version of any
    /// live transaction, or `fallback` (typically the current committed
    /// version) when the table is idle.
    pub fn oldest_visible(&self, fallback: u64) -> u64 {
        let mut min = u64::MAX;
        for state in self.slots.iter() {
            let rv = state.read_version.load(Ordering::Acquire);
            if rv != SLOT_FREE && rv < min {
                min = rv;
            }
        }
        if min == u64::MAX {
            fallback
        } else {
            min
        }
    }

    /// Total slot capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycle() {
        let table = SlotTable::new(4);
        let s = table.acquire(10).unwrap();
        assert!(table.is_live(s));
        assert_eq!(table.commit_version_of(s), 0);

        table.release(s);
        assert!(!table.is_live(s));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let table = SlotTable::new(2);
        let a = table.acquire(1).unwrap();
        let _b = table.acquire(1).unwrap();
        assert!(table.acquire(1).is_none());

        table.release(a);
        assert!(table.acquire(2).is_some());
    }

    #[test]
    fn test_watermark_tracks_minimum() {
        let table = SlotTable::new(4);
        assert_eq!(table.oldest_visible(99), 99, "idle table uses fallback");

        let a = table.acquire(10).unwrap();
        let b = table.acquire(5).unwrap();
        assert_eq!(table.oldest_visible(99), 5);

        table.release(b);
        assert_eq!(table.oldest_visible(99), 10);
        table.release(a);
        assert_eq!(table.oldest_visible(99), 99);
    }

    #[test]
    fn test_commit_version_visible_after_mark() {
        let table = SlotTable::new(2);
        let s = table.acquire(3).unwrap();
        table.mark_committed(s, 17);
        assert_eq!(table.commit_version_of(s), 17);
        table.release(s);

        // Reacquired slots start with a clean commit version
        let s2 = table.acquire(4).unwrap();
        assert_eq!(table.commit_version_of(s2), 0);
    }
}
