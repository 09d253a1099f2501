//! Slab arenas with 64-bit handles
//!
//! All hot data structures live in chunked slab arenas addressed by
//! [`RecordHandle`]s (`{pool:8, slot:56}`). Chunks are never moved or
//! deallocated while the slab lives, so a handle can always be
//! dereferenced; a free list recycles retired slots.
//!
//! # Publication discipline
//!
//! Every slot carries an even/odd sequence counter:
//! - the counter is bumped to an odd value when a slot is published into a
//!   data structure, and back to even when it is retired;
//! - an optimistic scanner reads the counter, reads the record, issues a
//!   full fence, re-reads the counter, and treats the slot as missing
//!   unless the counter is unchanged and odd.
//!
//! Slot payloads use interior mutability (atomics and locks), so reading a
//! concurrently retired or reused slot is memory-safe; the sequence check
//! is what restores logical correctness.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;
use velox_core::types::RecordHandle;

/// Slots per chunk (2^12).
const CHUNK_BITS: u32 = 12;
const CHUNK_SIZE: u64 = 1 << CHUNK_BITS;
const CHUNK_MASK: u64 = CHUNK_SIZE - 1;

/// One arena slot: sequence counter plus payload.
pub struct Slot<T> {
    seq: AtomicU64,
    value: T,
}

struct Chunk<T> {
    slots: Box<[Slot<T>]>,
}

impl<T: Default> Chunk<T> {
    fn new() -> Self {
        let slots = (0..CHUNK_SIZE)
            .map(|_| Slot {
                seq: AtomicU64::new(0),
                value: T::default(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Chunk { slots }
    }
}

/// Stable reference to an arena slot.
///
/// Holding a `SlotRef` keeps the chunk alive; the slot itself may be
/// retired and reused concurrently, which the sequence counter exposes.
pub struct SlotRef<T> {
    chunk: Arc<Chunk<T>>,
    index: usize,
}

impl<T> SlotRef<T> {
    /// Current sequence counter (acquire).
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.chunk.slots[self.index].seq.load(Ordering::Acquire)
    }

    /// Re-read the sequence counter after a full fence, for the second
    /// half of an optimistic read.
    #[inline]
    pub fn sequence_validate(&self) -> u64 {
        fence(Ordering::SeqCst);
        self.chunk.slots[self.index].seq.load(Ordering::Acquire)
    }

    /// Whether the slot is currently published (odd counter).
    #[inline]
    pub fn is_published(&self) -> bool {
        self.sequence() & 1 == 1
    }
}

impl<T> std::ops::Deref for SlotRef<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.chunk.slots[self.index].value
    }
}

impl<T> Clone for SlotRef<T> {
    fn clone(&self) -> Self {
        SlotRef {
            chunk: Arc::clone(&self.chunk),
            index: self.index,
        }
    }
}

/// A chunked slab pool.
pub struct Slab<T> {
    pool: u8,
    chunks: RwLock<Vec<Arc<Chunk<T>>>>,
    free: Mutex<Vec<u64>>,
    /// High-water slot index; slot 0 is reserved so the null handle never
    /// addresses a live record.
    next: Mutex<u64>,
    live: AtomicU64,
}

impl<T: Default> Slab<T> {
    /// Create a slab with the given pool index.
    pub fn new(pool: u8) -> Self {
        Slab {
            pool,
            chunks: RwLock::new(vec![Arc::new(Chunk::new())]),
            free: Mutex::new(Vec::new()),
            next: Mutex::new(1),
            live: AtomicU64::new(0),
        }
    }

    /// The pool index baked into handles of this slab.
    pub fn pool(&self) -> u8 {
        self.pool
    }

    /// Number of published slots.
    pub fn live_count(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    /// Slot index one past the highest ever allocated.
    pub fn high_water(&self) -> u64 {
        *self.next.lock()
    }

    fn ensure_capacity(&self, slot: u64) {
        let needed_chunks = ((slot >> CHUNK_BITS) + 1) as usize;
        if self.chunks.read().len() >= needed_chunks {
            return;
        }
        let mut chunks = self.chunks.write();
        while chunks.len() < needed_chunks {
            chunks.push(Arc::new(Chunk::new()));
        }
    }

    /// Allocate a slot. The slot stays unpublished (even sequence) until
    /// [`Slab::publish`] is called; the caller initializes the payload
    /// through interior mutability in between.
    pub fn allocate(&self) -> RecordHandle {
        if let Some(slot) = self.free.lock().pop() {
            return RecordHandle::new(self.pool, slot);
        }
        let slot = {
            let mut next = self.next.lock();
            let slot = *next;
            *next += 1;
            slot
        };
        self.ensure_capacity(slot);
        RecordHandle::new(self.pool, slot)
    }

    /// Allocate up to `count` slots, draining the free list first and
    /// falling back to fresh contiguous slots.
    pub fn allocate_batch(&self, count: usize, out: &mut Vec<RecordHandle>) {
        {
            let mut free = self.free.lock();
            while out.len() < count {
                match free.pop() {
                    Some(slot) => out.push(RecordHandle::new(self.pool, slot)),
                    None => break,
                }
            }
        }
        if out.len() < count {
            let missing = (count - out.len()) as u64;
            let start = {
                let mut next = self.next.lock();
                let start = *next;
                *next += missing;
                start
            };
            self.ensure_capacity(start + missing - 1);
            for slot in start..start + missing {
                out.push(RecordHandle::new(self.pool, slot));
            }
        }
    }

    /// Dereference a handle.
    ///
    /// # Panics
    /// Panics on a handle from another pool or beyond the high-water mark;
    /// both indicate engine corruption.
    pub fn get(&self, handle: RecordHandle) -> SlotRef<T> {
        debug_assert_eq!(handle.pool(), self.pool, "handle from a foreign pool");
        let slot = handle.slot();
        let chunk = {
            let chunks = self.chunks.read();
            Arc::clone(&chunks[(slot >> CHUNK_BITS) as usize])
        };
        SlotRef {
            chunk,
            index: (slot & CHUNK_MASK) as usize,
        }
    }

    /// Dereference a handle if its slot is currently published.
    pub fn get_published(&self, handle: RecordHandle) -> Option<SlotRef<T>> {
        let r = self.get(handle);
        if r.is_published() {
            Some(r)
        } else {
            None
        }
    }

    /// Publish an allocated slot: flips the sequence counter to odd with
    /// release ordering so initialized payload is observable first.
    pub fn publish(&self, handle: RecordHandle) {
        let r = self.get(handle);
        let prev = r.chunk.slots[r.index].seq.fetch_add(1, Ordering::Release);
        debug_assert_eq!(prev & 1, 0, "publishing an already published slot");
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    /// Retire a published slot and recycle it through the free list.
    pub fn retire(&self, handle: RecordHandle) {
        let r = self.get(handle);
        let prev = r.chunk.slots[r.index].seq.fetch_add(1, Ordering::Release);
        debug_assert_eq!(prev & 1, 1, "retiring an unpublished slot");
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().push(handle.slot());
    }

    /// Retire a slot without recycling it yet; the caller hands the slot
    /// back later through [`Slab::recycle`] (epoch-deferred frees).
    pub fn retire_deferred(&self, handle: RecordHandle) {
        let r = self.get(handle);
        let prev = r.chunk.slots[r.index].seq.fetch_add(1, Ordering::Release);
        debug_assert_eq!(prev & 1, 1, "retiring an unpublished slot");
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Hand a deferred-retired slot back to the free list.
    pub fn recycle(&self, handle: RecordHandle) {
        self.free.lock().push(handle.slot());
    }

    /// Split the allocated slot space into ranges for parallel scanning.
    pub fn scan_ranges(&self, parts: usize) -> Vec<std::ops::Range<u64>> {
        let high = self.high_water();
        let parts = parts.max(1) as u64;
        let span = (high - 1 + parts - 1) / parts;
        let mut ranges = Vec::new();
        let mut start = 1;
        while start < high {
            let end = (start + span.max(1)).min(high);
            ranges.push(start..end);
            start = end;
        }
        ranges
    }

    /// Visit every published slot in a range.
    pub fn for_each_published(&self, range: std::ops::Range<u64>, mut f: impl FnMut(RecordHandle, SlotRef<T>)) {
        for slot in range {
            let handle = RecordHandle::new(self.pool, slot);
            let r = self.get(handle);
            if r.is_published() {
                f(handle, r);
            }
        }
    }
}
