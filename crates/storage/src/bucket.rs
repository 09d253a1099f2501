//! Bucket tables with lock-word buckets
//!
//! A bucket word is a single `AtomicU64` doing double duty: the low 63
//! bits hold the head handle of the bucket's collision chain, bit 63 is a
//! spin-lock flag. The bucket lock is the sole gate for mutating a
//! bucket's chains and for taking per-record reader locks; optimistic
//! readers load the word without locking and mask the flag off.

use std::sync::atomic::{AtomicU64, Ordering};
use velox_core::types::RecordHandle;

const LOCK_BIT: u64 = 1 << 63;

/// Power-of-two array of bucket words.
pub struct BucketTable {
    words: Box<[AtomicU64]>,
    mask: u64,
}

impl BucketTable {
    /// Create a table with `capacity` buckets (must be a power of two).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "bucket capacity must be a power of two");
        let words = (0..capacity)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        BucketTable {
            words,
            mask: capacity as u64 - 1,
        }
    }

    /// Number of buckets.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// Bucket index for a hash value.
    #[inline]
    pub fn index_of(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    /// Lock-free read of a bucket's head handle.
    #[inline]
    pub fn head(&self, index: usize) -> RecordHandle {
        RecordHandle::from_raw(self.words[index].load(Ordering::Acquire) & !LOCK_BIT)
    }

    /// Acquire the bucket's spin lock.
    ///
    /// Bounded spinning with exponential backoff; the critical sections
    /// guarded by bucket locks are short chain edits, so contention is
    /// resolved in a few iterations.
    pub fn lock(&self, index: usize) -> BucketGuard<'_> {
        let word = &self.words[index];
        let mut spins = 1u32;
        loop {
            let current = word.load(Ordering::Relaxed);
            if current & LOCK_BIT == 0
                && word
                    .compare_exchange_weak(current, current | LOCK_BIT, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return BucketGuard {
                    word,
                    head: RecordHandle::from_raw(current),
                };
            }
            for _ in 0..spins {
                std::hint::spin_loop();
            }
            spins = (spins << 1).min(1 << 10);
        }
    }
}

/// Holds a bucket lock; unlocks and writes the head back on drop.
pub struct BucketGuard<'a> {
    word: &'a AtomicU64,
    head: RecordHandle,
}

impl<'a> BucketGuard<'a> {
    /// The bucket's head handle.
    #[inline]
    pub fn head(&self) -> RecordHandle {
        self.head
    }

    /// Replace the bucket's head handle; published on unlock.
    #[inline]
    pub fn set_head(&mut self, head: RecordHandle) {
        debug_assert_eq!(head.as_raw() & LOCK_BIT, 0);
        self.head = head;
        // Publish immediately as well so optimistic readers that tolerate
        // the lock bit see the newest chain.
        self.word.store(head.as_raw() | LOCK_BIT, Ordering::Release);
    }
}

impl<'a> Drop for BucketGuard<'a> {
    fn drop(&mut self) {
        self.word.store(self.head.as_raw(), Ordering::Release);
    }
}
