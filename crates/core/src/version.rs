//! Version words and transaction ids
//!
//! Every record version carries a single 64-bit version word:
//!
//! - bit 63: uncommitted marker; when set, the low bits hold the owning
//!   transaction's counter instead of a commit version
//! - bit 62: "not last operation in transaction" flag, telling the engine
//!   that a later operation in the same transaction still targets this
//!   object (restore paths must not let other transactions advance past it)
//! - bits 0..62: commit version or transaction counter
//!
//! Commit-version assignment rewrites the word in place with a single
//! atomic store. The word scheme is load-bearing: readers inspect version
//! words optimistically without taking the bucket lock, so the word must
//! always be self-describing.

use std::fmt;

const UNCOMMITTED_BIT: u64 = 1 << 63;
const NOT_LAST_BIT: u64 = 1 << 62;
const VALUE_MASK: u64 = NOT_LAST_BIT - 1;

/// Transaction identity word: the uncommitted marker over a monotonically
/// increasing counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TranId(u64);

impl TranId {
    /// Build a transaction id from the allocation counter.
    pub fn from_counter(counter: u64) -> Self {
        debug_assert!(counter & !VALUE_MASK == 0, "transaction counter overflow");
        TranId(UNCOMMITTED_BIT | counter)
    }

    /// The raw word, with the uncommitted marker set.
    #[inline]
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// The underlying counter value.
    #[inline]
    pub fn counter(&self) -> u64 {
        self.0 & VALUE_MASK
    }
}

impl fmt::Display for TranId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.counter())
    }
}

/// A record version word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version(u64);

impl Version {
    /// The zero version: sorts before every committed version and is used
    /// as the "no previous version" marker in changesets.
    pub const ZERO: Version = Version(0);

    /// A committed version word.
    pub fn committed(version: u64) -> Self {
        debug_assert!(version & !VALUE_MASK == 0, "commit version overflow");
        Version(version)
    }

    /// An uncommitted version word owned by `tran`.
    pub fn uncommitted(tran: TranId) -> Self {
        Version(tran.as_raw())
    }

    /// Reconstruct from the raw word.
    #[inline]
    pub fn from_word(word: u64) -> Self {
        Version(word)
    }

    /// The raw word as stored in records.
    #[inline]
    pub fn as_word(&self) -> u64 {
        self.0
    }

    /// Whether the uncommitted marker is set.
    #[inline]
    pub fn is_uncommitted(&self) -> bool {
        self.0 & UNCOMMITTED_BIT != 0
    }

    /// Whether the "not last operation in transaction" flag is set.
    #[inline]
    pub fn is_not_last(&self) -> bool {
        self.0 & NOT_LAST_BIT != 0
    }

    /// Copy of this word with the not-last flag set.
    #[inline]
    pub fn with_not_last(&self) -> Version {
        Version(self.0 | NOT_LAST_BIT)
    }

    /// Copy of this word with the not-last flag cleared.
    #[inline]
    pub fn without_not_last(&self) -> Version {
        Version(self.0 & !NOT_LAST_BIT)
    }

    /// The commit version, if committed.
    #[inline]
    pub fn commit_version(&self) -> Option<u64> {
        if self.is_uncommitted() {
            None
        } else {
            Some(self.0 & VALUE_MASK)
        }
    }

    /// The owning transaction, if uncommitted.
    #[inline]
    pub fn owner(&self) -> Option<TranId> {
        if self.is_uncommitted() {
            Some(TranId(self.0 & !NOT_LAST_BIT))
        } else {
            None
        }
    }

    /// Whether this version is owned by the given transaction.
    #[inline]
    pub fn is_owned_by(&self, tran: TranId) -> bool {
        self.is_uncommitted() && (self.0 & !NOT_LAST_BIT) == tran.as_raw()
    }

    /// Snapshot visibility: committed with a version at or below the
    /// reader's horizon.
    #[inline]
    pub fn is_visible_at(&self, read_version: u64) -> bool {
        !self.is_uncommitted() && (self.0 & VALUE_MASK) <= read_version
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(owner) = self.owner() {
            write!(f, "uncommitted({})", owner)
        } else {
            write!(f, "v{}", self.0 & VALUE_MASK)
        }
    }
}


#[cfg(test)]
mod props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_word_roundtrip(raw in 0u64..(1u64 << 62)) {
            let committed = Version::committed(raw);
            prop_assert_eq!(Version::from_word(committed.as_word()), committed);
            prop_assert_eq!(committed.commit_version(), Some(raw));

            let tran = TranId::from_counter(raw);
            let uncommitted = Version::uncommitted(tran);
            prop_assert!(uncommitted.is_owned_by(tran));
            prop_assert_eq!(uncommitted.owner(), Some(tran));
        }

        #[test]
        fn prop_visibility_monotonic(version in 1u64..(1u64 << 40), horizon in 0u64..(1u64 << 40)) {
            let v = Version::committed(version);
            if v.is_visible_at(horizon) {
                prop_assert!(v.is_visible_at(horizon + 1));
            }
        }
    }
}
