//! Key-range locks
//!
//! A range scan by a read-write transaction covers every interval it has
//! consumed with a key-range lock anchored on the node that hosts the
//! interval. Inserts and deletes that land inside a foreign live range
//! (or a committed range newer than the writer's snapshot) fail with an
//! index conflict, which is what prevents phantoms.

use crate::key::EntryKey;
use velox_core::tran::TranIdentity;

/// One end of a range.
#[derive(Debug, Clone)]
pub struct RangeBound {
    /// Bounding entry key; `None` leaves this end open.
    pub key: Option<EntryKey>,
    /// Whether the bound itself belongs to the range.
    pub inclusive: bool,
}

impl RangeBound {
    /// An unbounded end.
    pub fn unbounded() -> Self {
        RangeBound {
            key: None,
            inclusive: true,
        }
    }

    /// A bounded end.
    pub fn at(key: EntryKey, inclusive: bool) -> Self {
        RangeBound {
            key: Some(key),
            inclusive,
        }
    }

    /// Whether `entry` lies at or after this bound (used as a start).
    pub fn admits_from(&self, entry: &EntryKey) -> bool {
        match &self.key {
            None => true,
            Some(k) => {
                if self.inclusive {
                    entry >= k
                } else {
                    entry > k
                }
            }
        }
    }

    /// Whether `entry` lies at or before this bound (used as an end).
    pub fn admits_until(&self, entry: &EntryKey) -> bool {
        match &self.key {
            None => true,
            Some(k) => {
                if self.inclusive {
                    entry <= k
                } else {
                    entry < k
                }
            }
        }
    }
}

/// A key-range lock installed on a tree node.
///
/// The owner word starts as the owning transaction's id (uncommitted
/// marker set); commit finalization overwrites it with the commit version.
/// Committed ranges are retired by GC once no live snapshot predates them.
#[derive(Debug, Clone)]
pub struct KeyRangeLock {
    /// Id unique within the index, linking the lock to the owning
    /// transaction's chain of acquired ranges.
    pub lock_id: u64,
    /// Start of the covered interval.
    pub start: RangeBound,
    /// End of the covered interval.
    pub end: RangeBound,
    /// Owning transaction id raw word, or the commit version after
    /// finalization.
    pub owner: u64,
}

impl KeyRangeLock {
    /// Whether the interval contains `entry`.
    pub fn contains(&self, entry: &EntryKey) -> bool {
        self.start.admits_from(entry) && self.end.admits_until(entry)
    }

    /// Whether the owner is committed (owner word carries a commit
    /// version).
    pub fn is_committed(&self) -> bool {
        self.owner & (1 << 63) == 0
    }

    /// Whether a write by `tran` inside this range must fail: the range
    /// belongs to a live foreign transaction, or was committed past the
    /// writer's snapshot.
    pub fn conflicts_with(&self, tran: &TranIdentity) -> bool {
        if self.is_committed() {
            self.owner > tran.read_version
        } else {
            self.owner != tran.id.as_raw()
        }
    }
}
