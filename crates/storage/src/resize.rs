//! Parallel read/write gate with striped operation counters
//!
//! Every data-path operation on a class holds the read side of this gate
//! for its duration and charges an operation count; a resize (or any
//! class-wide structural operation such as drop-class) takes the exclusive
//! write side, draining all readers first. Charges land on per-stripe
//! counters so cores do not contend; their sum drives the load-factor
//! resize decision.
//!
//! The read side must never be held around an operation that can block
//! indefinitely, or a pending writer would stall the whole class.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const STRIPES: usize = 16;

#[repr(align(64))]
struct Stripe {
    ops: AtomicU64,
}

/// Per-class parallel gate.
pub struct ParallelGate {
    rw: RwLock<()>,
    stripes: Box<[Stripe]>,
}

static NEXT_THREAD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_STRIPE: usize = NEXT_THREAD.fetch_add(1, Ordering::Relaxed) % STRIPES;
}

impl ParallelGate {
    /// New gate with zeroed counters.
    pub fn new() -> Self {
        let stripes = (0..STRIPES)
            .map(|_| Stripe {
                ops: AtomicU64::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ParallelGate {
            rw: RwLock::new(()),
            stripes,
        }
    }

    /// Enter the read side for the duration of one data-path operation.
    pub fn enter(&self) -> GateGuard<'_> {
        GateGuard {
            _guard: self.rw.read(),
        }
    }

    /// Take the exclusive write side, draining all readers.
    pub fn exclusive(&self) -> GateWriteGuard<'_> {
        GateWriteGuard {
            _guard: self.rw.write(),
        }
    }

    /// Charge operations to this thread's stripe.
    #[inline]
    pub fn charge(&self, count: u64) {
        let stripe = THREAD_STRIPE.with(|s| *s);
        self.stripes[stripe].ops.fetch_add(count, Ordering::Relaxed);
    }

    /// Total charged operations, summed across stripes.
    pub fn charged(&self) -> u64 {
        self.stripes.iter().map(|s| s.ops.load(Ordering::Relaxed)).sum()
    }

    /// Reset the counters (after a resize consumed them).
    pub fn reset_charges(&self) {
        for stripe in self.stripes.iter() {
            stripe.ops.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for ParallelGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-side guard.
pub struct GateGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Exclusive-side guard.
pub struct GateWriteGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}
