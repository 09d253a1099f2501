//! Changesets: the write protocol of the engine
//!
//! A changeset is an ordered sequence of blocks; each block targets one
//! class with one operation kind and carries the touched property ids plus
//! one entry per object. The engine only ever consumes a changeset through
//! a forward iterator; it never parses an on-disk format.

use crate::types::{ClassId, ObjectId, PropertyId};
use crate::value::PropertyValue;
use crate::version::Version;

/// Operation kind of a change block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    /// Create new objects.
    Insert,
    /// Modify properties of existing objects.
    Update,
    /// Delete existing objects.
    Delete,
    /// Rewrite the listed properties back to the class defaults.
    DefaultValue,
    /// Remove every object of the class.
    DropClass,
    /// Undo everything the enclosing transaction has applied so far.
    Rewind,
}

/// One object-level operation inside a block.
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    /// Target object id.
    pub id: ObjectId,
    /// Version the operation expects to supersede. Client changesets leave
    /// this at [`Version::ZERO`]; restore streams carry the real value so
    /// ordering gaps can be detected and parked.
    pub previous_version: Version,
    /// Whether this is the first operation of its transaction on this id.
    pub first_in_tran: bool,
    /// Whether this is the last operation of its transaction on this id.
    pub last_in_tran: bool,
    /// Property payload aligned with the block's `property_ids`.
    pub values: Vec<PropertyValue>,
}

impl ChangeEntry {
    /// A client-side entry with no restore bookkeeping.
    pub fn new(id: ObjectId, values: Vec<PropertyValue>) -> Self {
        ChangeEntry {
            id,
            previous_version: Version::ZERO,
            first_in_tran: true,
            last_in_tran: true,
            values,
        }
    }
}

/// One class-scoped block of operations.
#[derive(Debug, Clone)]
pub struct ChangeBlock {
    /// Target class.
    pub class_id: ClassId,
    /// Operation kind.
    pub op: BlockOp,
    /// Property ids the entries' values align with.
    pub property_ids: Vec<PropertyId>,
    /// Per-object operations, applied in order.
    pub entries: Vec<ChangeEntry>,
}

/// An ordered sequence of change blocks.
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    blocks: Vec<ChangeBlock>,
}

impl Changeset {
    /// An empty changeset.
    pub fn new() -> Self {
        Changeset::default()
    }

    /// Append a block.
    pub fn push(&mut self, block: ChangeBlock) {
        self.blocks.push(block);
    }

    /// Forward iterator over blocks; the only way the engine reads a
    /// changeset.
    pub fn blocks(&self) -> impl Iterator<Item = &ChangeBlock> {
        self.blocks.iter()
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total number of object-level operations.
    pub fn operation_count(&self) -> usize {
        self.blocks.iter().map(|b| b.entries.len()).sum()
    }
}

/// Builder producing well-formed changesets for clients and tests.
///
/// # Example
///
/// ```
/// use velox_core::changeset::ChangesetBuilder;
/// use velox_core::types::{ClassId, ObjectId, PropertyId};
/// use velox_core::value::PropertyValue;
///
/// let mut builder = ChangesetBuilder::new();
/// builder
///     .insert(ClassId(1), vec![PropertyId(10)])
///     .entry(ObjectId::new(1), vec![PropertyValue::Int(10)]);
/// let changeset = builder.build();
/// assert_eq!(changeset.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct ChangesetBuilder {
    blocks: Vec<ChangeBlock>,
}

/// Handle onto the block currently being filled.
pub struct BlockBuilder<'a> {
    block: &'a mut ChangeBlock,
}

impl<'a> BlockBuilder<'a> {
    /// Append an object operation to the block.
    pub fn entry(&mut self, id: ObjectId, values: Vec<PropertyValue>) -> &mut Self {
        debug_assert_eq!(
            values.len(),
            self.block.property_ids.len(),
            "entry values must align with the block's property ids"
        );
        self.block.entries.push(ChangeEntry::new(id, values));
        self
    }

    /// Append an operation with restore bookkeeping.
    pub fn entry_versioned(
        &mut self,
        id: ObjectId,
        previous_version: Version,
        last_in_tran: bool,
        values: Vec<PropertyValue>,
    ) -> &mut Self {
        self.block.entries.push(ChangeEntry {
            id,
            previous_version,
            first_in_tran: previous_version == Version::ZERO,
            last_in_tran,
            values,
        });
        self
    }
}

impl ChangesetBuilder {
    /// New empty builder.
    pub fn new() -> Self {
        ChangesetBuilder::default()
    }

    fn begin(&mut self, class_id: ClassId, op: BlockOp, property_ids: Vec<PropertyId>) -> BlockBuilder<'_> {
        self.blocks.push(ChangeBlock {
            class_id,
            op,
            property_ids,
            entries: Vec::new(),
        });
        BlockBuilder {
            block: self.blocks.last_mut().expect("block just pushed"),
        }
    }

    /// Begin an insert block.
    pub fn insert(&mut self, class_id: ClassId, property_ids: Vec<PropertyId>) -> BlockBuilder<'_> {
        self.begin(class_id, BlockOp::Insert, property_ids)
    }

    /// Begin an update block.
    pub fn update(&mut self, class_id: ClassId, property_ids: Vec<PropertyId>) -> BlockBuilder<'_> {
        self.begin(class_id, BlockOp::Update, property_ids)
    }

    /// Begin a delete block.
    pub fn delete(&mut self, class_id: ClassId) -> BlockBuilder<'_> {
        self.begin(class_id, BlockOp::Delete, Vec::new())
    }

    /// Begin a default-value block over the listed properties.
    pub fn default_value(
        &mut self,
        class_id: ClassId,
        property_ids: Vec<PropertyId>,
    ) -> BlockBuilder<'_> {
        self.begin(class_id, BlockOp::DefaultValue, property_ids)
    }

    /// Append a drop-class block.
    pub fn drop_class(&mut self, class_id: ClassId) -> &mut Self {
        self.blocks.push(ChangeBlock {
            class_id,
            op: BlockOp::DropClass,
            property_ids: Vec::new(),
            entries: Vec::new(),
        });
        self
    }

    /// Append a rewind block.
    pub fn rewind(&mut self, class_id: ClassId) -> &mut Self {
        self.blocks.push(ChangeBlock {
            class_id,
            op: BlockOp::Rewind,
            property_ids: Vec::new(),
            entries: Vec::new(),
        });
        self
    }

    /// Finish the changeset.
    pub fn build(self) -> Changeset {
        Changeset {
            blocks: self.blocks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_produces_blocks_in_order() {
        let mut b = ChangesetBuilder::new();
        b.insert(ClassId(1), vec![PropertyId(1)])
            .entry(ObjectId::new(1), vec![PropertyValue::Int(5)]);
        b.delete(ClassId(1)).entry(ObjectId::new(2), vec![]);
        let cs = b.build();

        let ops: Vec<_> = cs.blocks().map(|b| b.op).collect();
        assert_eq!(ops, vec![BlockOp::Insert, BlockOp::Delete]);
        assert_eq!(cs.operation_count(), 2);
    }

    #[test]
    fn test_entry_defaults() {
        let e = ChangeEntry::new(ObjectId::new(3), vec![]);
        assert_eq!(e.previous_version, Version::ZERO);
        assert!(e.first_in_tran);
        assert!(e.last_in_tran);
    }

    #[test]
    fn test_versioned_entry_flags() {
        let mut b = ChangesetBuilder::new();
        b.update(ClassId(1), vec![]).entry_versioned(
            ObjectId::new(1),
            Version::committed(4),
            false,
            vec![],
        );
        let cs = b.build();
        let entry = &cs.blocks().next().unwrap().entries[0];
        assert!(!entry.first_in_tran);
        assert!(!entry.last_in_tran);
        assert_eq!(entry.previous_version, Version::committed(4));
    }

    #[test]
    fn test_empty_changeset() {
        let cs = Changeset::new();
        assert!(cs.is_empty());
        assert_eq!(cs.operation_count(), 0);
    }
}
