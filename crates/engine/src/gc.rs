//! Background garbage collection
//!
//! A single service thread periodically computes the visibility watermark
//! (the lowest read version of any live transaction) and sweeps:
//! obsolete object versions, stale inverse-reference generations,
//! committed key-range locks, and retired sorted-index nodes through the
//! epoch service.

use crate::database::DatabaseInner;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::trace;

/// Handle to the background GC thread.
pub struct GcService {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GcService {
    /// Spawn the service over the shared engine state.
    pub(crate) fn start(inner: Arc<DatabaseInner>) -> GcService {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let interval = inner.config.gc_interval;
        let handle = thread::Builder::new()
            .name("velox-gc".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    // Sleep in short slices so shutdown stays responsive
                    let slice = Duration::from_millis(10).min(interval);
                    let mut elapsed = Duration::ZERO;
                    while elapsed < interval {
                        if flag.load(Ordering::Relaxed) {
                            return;
                        }
                        thread::sleep(slice);
                        elapsed += slice;
                    }
                    run_pass(&inner);
                }
            })
            .expect("gc thread spawn");
        GcService {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the service and wait for the thread to exit.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One full collection pass at the current watermark.
pub(crate) fn run_pass(inner: &DatabaseInner) {
    let watermark = inner
        .slots
        .oldest_visible(inner.global_version.load(Ordering::Acquire));
    trace!(watermark, "garbage collection pass");

    for store in inner.stores.values() {
        for id in store.heap.live_ids() {
            store.collect_garbage(id, watermark, inner.blob_heap.as_ref());
        }
        for slot in &store.sorted_indexes {
            slot.index.sweep_ranges(watermark);
            slot.index.reclaim_nodes();
        }
    }
    inner.invref.collect_garbage(watermark);
}
