//! Epoch-based reclamation for tree nodes
//!
//! Unlinked nodes cannot be recycled while a concurrent reader may still
//! hold their handle. Every tree operation enters the current epoch for
//! its duration; a retired node is stamped with the epoch of its
//! retirement and recycled only once no participant entered at or before
//! that epoch.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use velox_core::types::RecordHandle;

const IDLE: u64 = u64::MAX;

/// Epoch service for one tree.
pub struct EpochService {
    global: AtomicU64,
    participants: Mutex<Participants>,
    retired: Mutex<Vec<(u64, RecordHandle)>>,
}

#[derive(Default)]
struct Participants {
    active: Vec<u64>,
    free: Vec<usize>,
}

impl EpochService {
    /// New service at epoch zero.
    pub fn new() -> Self {
        EpochService {
            global: AtomicU64::new(1),
            participants: Mutex::new(Participants::default()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Declare "thread entered" for the duration of one tree operation.
    pub fn enter(&self) -> EpochGuard<'_> {
        let epoch = self.global.load(Ordering::Acquire);
        let mut participants = self.participants.lock();
        let slot = match participants.free.pop() {
            Some(slot) => {
                participants.active[slot] = epoch;
                slot
            }
            None => {
                participants.active.push(epoch);
                participants.active.len() - 1
            }
        };
        EpochGuard {
            service: self,
            slot,
        }
    }

    /// Stamp an unlinked node with the current epoch.
    pub fn retire(&self, handle: RecordHandle) {
        let epoch = self.global.load(Ordering::Acquire);
        self.retired.lock().push((epoch, handle));
    }

    /// Advance the epoch and recycle every node no participant can still
    /// observe.
    pub fn reclaim(&self, free: &mut dyn FnMut(RecordHandle)) {
        self.global.fetch_add(1, Ordering::AcqRel);
        let floor = {
            let participants = self.participants.lock();
            participants
                .active
                .iter()
                .copied()
                .filter(|e| *e != IDLE)
                .min()
                .unwrap_or(u64::MAX)
        };
        let mut retired = self.retired.lock();
        let mut kept = Vec::new();
        for (epoch, handle) in retired.drain(..) {
            if epoch < floor {
                free(handle);
            } else {
                kept.push((epoch, handle));
            }
        }
        *retired = kept;
    }

    /// Number of nodes awaiting reclamation; test hook.
    pub fn pending(&self) -> usize {
        self.retired.lock().len()
    }
}

impl Default for EpochService {
    fn default() -> Self {
        Self::new()
    }
}

/// Epoch participation for one operation.
pub struct EpochGuard<'a> {
    service: &'a EpochService,
    slot: usize,
}

impl<'a> Drop for EpochGuard<'a> {
    fn drop(&mut self) {
        let mut participants = self.service.participants.lock();
        participants.active[self.slot] = IDLE;
        participants.free.push(self.slot);
    }
}
