//! Engine configuration
//!
//! All tunables live here with production defaults. The inverse-reference
//! merge coefficients are load-empirical and deliberately exposed instead
//! of hard-coded.

use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Used-bucket fraction that triggers a hash-table resize.
    pub bucket_load_factor: f64,
    /// Initial bucket count of object-heap and hash-index tables
    /// (rounded up to a power of two).
    pub initial_buckets: usize,
    /// Maximum number of record buffers allocated in one contiguous batch.
    pub alloc_batch: usize,
    /// Maximum entries per sorted-index node.
    pub node_capacity: usize,
    /// Maximum live transactions (reader-slot table capacity).
    pub max_transactions: usize,
    /// Commit worker threads.
    pub commit_workers: usize,
    /// Background garbage-collection pass interval.
    pub gc_interval: Duration,
    /// Inverse-reference merge heuristic: weight per delta item.
    pub invref_merge_delta_weight: u64,
    /// Inverse-reference merge heuristic: weight per deleted reference.
    pub invref_merge_delete_weight: u64,
    /// Inverse-reference merge heuristic: weight per inserted reference.
    pub invref_merge_insert_weight: u64,
    /// Inverse-reference merge heuristic: divisor applied to the base size.
    pub invref_merge_base_divisor: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            bucket_load_factor: 0.75,
            initial_buckets: 128,
            alloc_batch: 16,
            node_capacity: 118,
            max_transactions: 1024,
            commit_workers: 2,
            gc_interval: Duration::from_millis(100),
            invref_merge_delta_weight: 32,
            invref_merge_delete_weight: 4,
            invref_merge_insert_weight: 1,
            invref_merge_base_divisor: 4,
        }
    }
}

impl EngineConfig {
    /// Override the sorted-index node capacity. Small capacities are used
    /// by tests to force splits and merges.
    pub fn with_node_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity >= 4, "node capacity below the rebalance minimum");
        self.node_capacity = capacity;
        self
    }

    /// Override the initial bucket count.
    pub fn with_initial_buckets(mut self, buckets: usize) -> Self {
        self.initial_buckets = buckets.next_power_of_two().max(2);
        self
    }

    /// Override the commit worker count.
    pub fn with_commit_workers(mut self, workers: usize) -> Self {
        self.commit_workers = workers.max(1);
        self
    }

    /// Override the GC pass interval.
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Whether accumulated delta overhead justifies an inverse-reference
    /// merge for a base of `base_len` references.
    pub fn invref_merge_due(&self, delta_count: u64, deletes: u64, inserts: u64, base_len: u64) -> bool {
        delta_count * self.invref_merge_delta_weight
            + deletes * self.invref_merge_delete_weight
            + inserts * self.invref_merge_insert_weight
            >= base_len / self.invref_merge_base_divisor
    }
}
