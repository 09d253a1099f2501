//! Composite index keys
//!
//! Secondary indexes key on 1-4 property columns plus the object id and
//! record handle as tiebreakers. Equality and ordering go through
//! `PropertyValue::cmp_ordered`, which is total (floats by `total_cmp`),
//! so keys are usable in hash maps and ordered structures alike.

use smallvec::SmallVec;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use velox_core::model::ClassMeta;
use velox_core::types::{ObjectId, PropertyId, RecordHandle};
use velox_core::value::{mix64, PropertyValue};

/// A composite key of up to four property values.
#[derive(Debug, Clone)]
pub struct IndexKey(pub SmallVec<[PropertyValue; 4]>);

impl IndexKey {
    /// Key from a value list.
    pub fn new(values: impl Into<SmallVec<[PropertyValue; 4]>>) -> Self {
        IndexKey(values.into())
    }

    /// Single-column key.
    pub fn single(value: PropertyValue) -> Self {
        IndexKey(SmallVec::from_vec(vec![value]))
    }

    /// Stable 64-bit hash for bucket placement.
    pub fn hash_u64(&self) -> u64 {
        let mut acc = 0x51_7c_c1_b7_27_22_0a_95u64;
        for value in &self.0 {
            acc = mix64(acc ^ value.hash_u64());
        }
        acc
    }

    /// Lexicographic total order over the columns.
    pub fn cmp_key(&self, other: &IndexKey) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match a.cmp_ordered(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_key(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp_key(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_key(other)
    }
}

impl Hash for IndexKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_u64());
    }
}

/// Raw handle value reserved as the maximum-key sentinel: it sorts after
/// every real entry and marks the right spine of the sorted index.
pub const SENTINEL_HANDLE_RAW: u64 = (1 << 63) - 1;

/// A full entry key: composite key plus id and handle tiebreakers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryKey {
    /// Composite property key.
    pub key: IndexKey,
    /// Owning object id.
    pub id: ObjectId,
    /// Record handle of the version that wrote the entry.
    pub handle: RecordHandle,
}

impl EntryKey {
    /// New entry key.
    pub fn new(key: IndexKey, id: ObjectId, handle: RecordHandle) -> Self {
        EntryKey { key, id, handle }
    }

    /// The maximum-key sentinel.
    pub fn max_sentinel() -> Self {
        EntryKey {
            key: IndexKey(SmallVec::new()),
            id: ObjectId::new(u64::MAX),
            handle: RecordHandle::from_raw(SENTINEL_HANDLE_RAW),
        }
    }

    /// Whether this is the sentinel.
    #[inline]
    pub fn is_sentinel(&self) -> bool {
        self.handle.as_raw() == SENTINEL_HANDLE_RAW
    }
}

impl PartialOrd for EntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_sentinel(), other.is_sentinel()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self
                .key
                .cmp_key(&other.key)
                .then(self.id.cmp(&other.id))
                .then(self.handle.as_raw().cmp(&other.handle.as_raw())),
        }
    }
}

/// Extracts an index's key columns from a record payload.
///
/// Column positions are resolved once when the index is built; the hot
/// path is a plain positional gather.
#[derive(Debug, Clone)]
pub struct KeyReader {
    positions: SmallVec<[usize; 4]>,
}

impl KeyReader {
    /// Resolve the reader for the given key columns of a class.
    ///
    /// The model validator has already checked the columns exist, so an
    /// unknown property here is an engine bug.
    pub fn resolve(class: &ClassMeta, properties: &[PropertyId]) -> Self {
        let positions = properties
            .iter()
            .map(|pid| {
                class
                    .property_position(*pid)
                    .expect("index column validated at model load")
            })
            .collect();
        KeyReader { positions }
    }

    /// Gather the key from a payload.
    pub fn read(&self, payload: &[PropertyValue]) -> IndexKey {
        IndexKey(self.positions.iter().map(|p| payload[*p].clone()).collect())
    }

    /// Whether any key column lies within the given payload positions.
    pub fn touches(&self, positions: &[usize]) -> bool {
        self.positions.iter().any(|p| positions.contains(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering_lexicographic() {
        let a = IndexKey::new(vec![PropertyValue::Int(1), PropertyValue::Int(5)]);
        let b = IndexKey::new(vec![PropertyValue::Int(1), PropertyValue::Int(6)]);
        let c = IndexKey::new(vec![PropertyValue::Int(2), PropertyValue::Int(0)]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_key_equality_and_hash() {
        let a = IndexKey::single(PropertyValue::Long(9));
        let b = IndexKey::single(PropertyValue::Long(9));
        assert_eq!(a, b);
        assert_eq!(a.hash_u64(), b.hash_u64());
        assert_ne!(a, IndexKey::single(PropertyValue::Long(10)));
    }

    #[test]
    fn test_sentinel_sorts_last() {
        let real = EntryKey::new(
            IndexKey::single(PropertyValue::Long(i64::MAX)),
            ObjectId::new(u64::MAX - 1),
            RecordHandle::new(0x7f, (1 << 56) - 1),
        );
        let sentinel = EntryKey::max_sentinel();
        assert!(real < sentinel);
        assert_eq!(sentinel.cmp(&EntryKey::max_sentinel()), Ordering::Equal);
    }

    #[test]
    fn test_entry_key_tiebreakers() {
        let key = IndexKey::single(PropertyValue::Int(1));
        let a = EntryKey::new(key.clone(), ObjectId::new(1), RecordHandle::new(0, 1));
        let b = EntryKey::new(key.clone(), ObjectId::new(2), RecordHandle::new(0, 1));
        let c = EntryKey::new(key, ObjectId::new(2), RecordHandle::new(0, 2));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_key_reader_gathers_positions() {
        use velox_core::model::{ClassMeta, PropertyMeta};
        use velox_core::value::PropertyKind;

        let class = ClassMeta::new(1, "C")
            .with_property(PropertyMeta::simple(1, "a", PropertyKind::Int))
            .with_property(PropertyMeta::simple(2, "b", PropertyKind::Long));
        let reader = KeyReader::resolve(&class, &[PropertyId(2), PropertyId(1)]);
        let payload = vec![PropertyValue::Int(5), PropertyValue::Long(7)];
        let key = reader.read(&payload);
        assert_eq!(
            key,
            IndexKey::new(vec![PropertyValue::Long(7), PropertyValue::Int(5)])
        );
        assert!(reader.touches(&[0]));
        assert!(!reader.touches(&[5]));
    }
}
