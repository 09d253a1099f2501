//! Foundational identifier types
//!
//! This module defines the identity newtypes used throughout the engine:
//! - ObjectId: user-visible object identity
//! - ClassId / PropertyId / IndexId: schema-level identifiers
//! - RecordHandle: 64-bit slab handle addressing in-memory records
//! - BlobHandle: opaque handle into the external interned blob/string heap

use std::fmt;

/// User-visible object identity.
///
/// Ids are allocated by the engine in contiguous reserved ranges. The value
/// `0` is never a valid object id; writes carrying it are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The invalid / null object id.
    pub const NULL: ObjectId = ObjectId(0);

    /// Create an object id from a raw value.
    pub fn new(raw: u64) -> Self {
        ObjectId(raw)
    }

    /// Raw 64-bit value.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this is the null id.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Schema-level class identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u16);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Schema-level property identifier, unique within the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId(pub u32);

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Schema-level secondary index identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexId(pub u32);

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 64-bit slab handle: `{pool : 8, slot : 56}`.
///
/// Handles address records inside per-size-class slab pools. `0` is the
/// null handle (pool 0 reserves slot 0 and never hands it out).
///
/// Bit 63 is required to stay clear: bucket words store a handle in the low
/// 63 bits and use bit 63 as their spin-lock flag, so the pool index is
/// capped at 127.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHandle(u64);

/// Number of bits used for the slot part of a handle.
pub const HANDLE_SLOT_BITS: u32 = 56;

/// Maximum pool index that fits below the bucket-lock bit.
pub const HANDLE_MAX_POOL: u8 = 0x7f;

impl RecordHandle {
    /// The null handle.
    pub const NULL: RecordHandle = RecordHandle(0);

    /// Build a handle from a pool index and slot offset.
    ///
    /// # Panics
    /// Panics if `pool` exceeds [`HANDLE_MAX_POOL`] or `slot` does not fit
    /// in 56 bits; both indicate an engine bug, not user input.
    pub fn new(pool: u8, slot: u64) -> Self {
        assert!(pool <= HANDLE_MAX_POOL, "pool index {} exceeds handle capacity", pool);
        assert!(slot < (1u64 << HANDLE_SLOT_BITS), "slot offset does not fit in handle");
        RecordHandle(((pool as u64) << HANDLE_SLOT_BITS) | slot)
    }

    /// Reconstruct a handle from its raw word.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        RecordHandle(raw)
    }

    /// Raw 64-bit word (bit 63 always clear).
    #[inline]
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Pool index part.
    #[inline]
    pub fn pool(&self) -> u8 {
        (self.0 >> HANDLE_SLOT_BITS) as u8
    }

    /// Slot offset part.
    #[inline]
    pub fn slot(&self) -> u64 {
        self.0 & ((1u64 << HANDLE_SLOT_BITS) - 1)
    }

    /// Whether this is the null handle.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RecordHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pool(), self.slot())
    }
}

/// Opaque handle into the external interned blob/string heap.
///
/// The engine never inspects blob payloads; it only moves handles around
/// and drives their refcounts through the [`crate::external::BlobHeap`]
/// collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobHandle(pub u64);

impl BlobHandle {
    /// The null blob handle (no payload).
    pub const NULL: BlobHandle = BlobHandle(0);

    /// Whether this handle carries no payload.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_null() {
        assert!(ObjectId::NULL.is_null());
        assert!(!ObjectId::new(1).is_null());
    }

    #[test]
    fn test_handle_roundtrip() {
        let h = RecordHandle::new(3, 12345);
        assert_eq!(h.pool(), 3);
        assert_eq!(h.slot(), 12345);
        assert!(!h.is_null());

        let h2 = RecordHandle::from_raw(h.as_raw());
        assert_eq!(h, h2);
    }

    #[test]
    fn test_handle_null() {
        assert!(RecordHandle::NULL.is_null());
        assert_eq!(RecordHandle::NULL.pool(), 0);
        assert_eq!(RecordHandle::NULL.slot(), 0);
    }

    #[test]
    fn test_handle_max_pool_keeps_lock_bit_clear() {
        let h = RecordHandle::new(HANDLE_MAX_POOL, (1u64 << HANDLE_SLOT_BITS) - 1);
        assert_eq!(h.as_raw() >> 63, 0, "bit 63 must stay clear for bucket locks");
    }

    #[test]
    #[should_panic]
    fn test_handle_pool_overflow_panics() {
        let _ = RecordHandle::new(0x80, 0);
    }

    #[test]
    fn test_blob_handle_null() {
        assert!(BlobHandle::NULL.is_null());
        assert!(!BlobHandle(7).is_null());
    }
}
