//! Data-model descriptors
//!
//! The schema is loaded once and stays immutable for the lifetime of the
//! engine (schema evolution swaps the whole model behind the engine-wide
//! gate). Classes declare fixed property lists, reference behavior, and
//! their secondary indexes; the model validates itself at load so the hot
//! paths never re-check schema shape.

use crate::error::{DbError, DbResult};
use crate::types::{ClassId, IndexId, ObjectId, PropertyId};
use crate::value::{PropertyKind, PropertyValue};
use rustc_hash::FxHashMap;

/// How many targets a reference property may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
    /// Exactly one target; a null reference fails validation.
    One,
    /// Zero or one target.
    ZeroOrOne,
    /// Any number of targets (reference array).
    Many,
}

/// What happens to a reference when its target is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAction {
    /// The delete fails while references exist.
    Prevent,
    /// Referencing objects are deleted as well.
    Cascade,
    /// The reference is rewritten to null.
    SetNull,
}

/// Reference-specific property metadata.
#[derive(Debug, Clone)]
pub struct ReferenceMeta {
    /// Class the reference points into (targets may be any descendant).
    pub target_class: ClassId,
    /// Cardinality of the reference.
    pub multiplicity: Multiplicity,
    /// Cascade behavior on target delete.
    pub delete_action: DeleteAction,
    /// Whether the inverse-reference map tracks this property.
    pub tracked: bool,
}

/// A single property descriptor.
#[derive(Debug, Clone)]
pub struct PropertyMeta {
    /// Model-wide property id.
    pub id: PropertyId,
    /// Property name.
    pub name: String,
    /// Value kind.
    pub kind: PropertyKind,
    /// Default used to seed inserts and `DefaultValue` blocks.
    pub default: PropertyValue,
    /// Present for `Reference` / `ReferenceArray` kinds.
    pub reference: Option<ReferenceMeta>,
}

impl PropertyMeta {
    /// Plain data property with the kind's default.
    pub fn simple(id: u32, name: impl Into<String>, kind: PropertyKind) -> Self {
        PropertyMeta {
            id: PropertyId(id),
            name: name.into(),
            kind,
            default: kind.default_value(),
            reference: None,
        }
    }

    /// Single-target reference property.
    pub fn reference(
        id: u32,
        name: impl Into<String>,
        target: ClassId,
        multiplicity: Multiplicity,
        delete_action: DeleteAction,
        tracked: bool,
    ) -> Self {
        PropertyMeta {
            id: PropertyId(id),
            name: name.into(),
            kind: PropertyKind::Reference,
            default: PropertyValue::Reference(ObjectId::NULL),
            reference: Some(ReferenceMeta {
                target_class: target,
                multiplicity,
                delete_action,
                tracked,
            }),
        }
    }

    /// Whether this property participates in the inverse-reference map.
    pub fn is_tracked_reference(&self) -> bool {
        self.reference.as_ref().map(|r| r.tracked).unwrap_or(false)
    }
}

/// Hash-index descriptor.
#[derive(Debug, Clone)]
pub struct HashIndexMeta {
    /// Model-wide index id.
    pub id: IndexId,
    /// Index name.
    pub name: String,
    /// Whether duplicate keys are rejected.
    pub unique: bool,
    /// Key columns, in order (1-4).
    pub properties: Vec<PropertyId>,
}

/// Sorted-index descriptor.
#[derive(Debug, Clone)]
pub struct SortedIndexMeta {
    /// Model-wide index id.
    pub id: IndexId,
    /// Index name.
    pub name: String,
    /// Whether duplicate keys are rejected.
    pub unique: bool,
    /// Key columns, in order (1-4).
    pub properties: Vec<PropertyId>,
}

/// A class descriptor.
#[derive(Debug, Clone)]
pub struct ClassMeta {
    /// Class id.
    pub id: ClassId,
    /// Class name.
    pub name: String,
    /// Abstract classes cannot hold objects; only their descendants can.
    pub is_abstract: bool,
    /// Base class, if any.
    pub base: Option<ClassId>,
    /// Declared properties, in payload order.
    pub properties: Vec<PropertyMeta>,
    /// Hash indexes over this class.
    pub hash_indexes: Vec<HashIndexMeta>,
    /// Sorted indexes over this class.
    pub sorted_indexes: Vec<SortedIndexMeta>,
}

impl ClassMeta {
    /// New concrete class with no base.
    pub fn new(id: u16, name: impl Into<String>) -> Self {
        ClassMeta {
            id: ClassId(id),
            name: name.into(),
            is_abstract: false,
            base: None,
            properties: Vec::new(),
            hash_indexes: Vec::new(),
            sorted_indexes: Vec::new(),
        }
    }

    /// Mark the class abstract.
    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Set the base class.
    pub fn with_base(mut self, base: ClassId) -> Self {
        self.base = Some(base);
        self
    }

    /// Append a property.
    pub fn with_property(mut self, property: PropertyMeta) -> Self {
        self.properties.push(property);
        self
    }

    /// Append a hash index.
    pub fn with_hash_index(mut self, index: HashIndexMeta) -> Self {
        self.hash_indexes.push(index);
        self
    }

    /// Append a sorted index.
    pub fn with_sorted_index(mut self, index: SortedIndexMeta) -> Self {
        self.sorted_indexes.push(index);
        self
    }

    /// Position of a property inside the payload, if declared.
    pub fn property_position(&self, id: PropertyId) -> Option<usize> {
        self.properties.iter().position(|p| p.id == id)
    }

    /// Property descriptor by id.
    pub fn property(&self, id: PropertyId) -> Option<&PropertyMeta> {
        self.properties.iter().find(|p| p.id == id)
    }

    /// The default payload template for inserts.
    pub fn default_template(&self) -> Vec<PropertyValue> {
        self.properties.iter().map(|p| p.default.clone()).collect()
    }

    /// Reference properties that feed the inverse-reference map.
    pub fn tracked_reference_properties(&self) -> impl Iterator<Item = &PropertyMeta> {
        self.properties.iter().filter(|p| p.is_tracked_reference())
    }
}

/// The loaded data model: class registry plus derived lookups.
#[derive(Debug)]
pub struct DataModel {
    classes: Vec<ClassMeta>,
    by_id: FxHashMap<ClassId, usize>,
    by_name: FxHashMap<String, ClassId>,
    /// class -> class plus all transitive subclasses
    subtree: FxHashMap<ClassId, Vec<ClassId>>,
}

impl DataModel {
    /// Build and validate a model from class descriptors.
    pub fn new(classes: Vec<ClassMeta>) -> DbResult<Self> {
        let mut by_id = FxHashMap::default();
        let mut by_name = FxHashMap::default();
        for (pos, class) in classes.iter().enumerate() {
            by_id.insert(class.id, pos);
            by_name.insert(class.name.clone(), class.id);
        }

        let mut subtree: FxHashMap<ClassId, Vec<ClassId>> = FxHashMap::default();
        for class in &classes {
            subtree.entry(class.id).or_default().push(class.id);
            // Walk the base chain, adding this class to every ancestor's subtree.
            let mut base = class.base;
            while let Some(b) = base {
                subtree.entry(b).or_default().push(class.id);
                base = classes
                    .iter()
                    .find(|c| c.id == b)
                    .and_then(|c| c.base);
            }
        }

        let model = DataModel {
            classes,
            by_id,
            by_name,
            subtree,
        };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> DbResult<()> {
        for class in &self.classes {
            for index in &class.hash_indexes {
                for pid in &index.properties {
                    let prop = class.property(*pid).ok_or(DbError::IndexPropertyWrongType {
                        property: *pid,
                        index: index.name.clone(),
                    })?;
                    if !prop.kind.is_hashable() {
                        return Err(DbError::IndexPropertyWrongType {
                            property: *pid,
                            index: index.name.clone(),
                        });
                    }
                }
            }
            for index in &class.sorted_indexes {
                for pid in &index.properties {
                    let prop = class.property(*pid).ok_or(DbError::IndexPropertyWrongType {
                        property: *pid,
                        index: index.name.clone(),
                    })?;
                    if !prop.kind.is_orderable() {
                        return Err(DbError::IndexPropertyWrongType {
                            property: *pid,
                            index: index.name.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Class by id.
    pub fn class(&self, id: ClassId) -> Option<&ClassMeta> {
        self.by_id.get(&id).map(|pos| &self.classes[*pos])
    }

    /// Class by name.
    pub fn class_by_name(&self, name: &str) -> Option<&ClassMeta> {
        self.by_name.get(name).and_then(|id| self.class(*id))
    }

    /// Name of a class, or a placeholder for unknown ids.
    pub fn class_name(&self, id: ClassId) -> String {
        self.class(id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| format!("class#{}", id))
    }

    /// All declared classes.
    pub fn classes(&self) -> &[ClassMeta] {
        &self.classes
    }

    /// Concrete (non-abstract) classes.
    pub fn concrete_classes(&self) -> impl Iterator<Item = &ClassMeta> {
        self.classes.iter().filter(|c| !c.is_abstract)
    }

    /// A class together with every transitive subclass, for inherited scans
    /// and reference-target checks.
    pub fn subtree_of(&self, id: ClassId) -> &[ClassId] {
        self.subtree.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// A class together with its transitive base classes.
    pub fn ancestors_of(&self, id: ClassId) -> Vec<ClassId> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            chain.push(current);
            cursor = self.class(current).and_then(|c| c.base);
        }
        chain
    }

    /// Tracked reference properties (declared anywhere in the model) whose
    /// target type admits objects of `class`: these are the properties a
    /// deleted object of `class` must tombstone in the inverse-reference
    /// map.
    pub fn inbound_tracked_properties(&self, class: ClassId) -> Vec<PropertyId> {
        let ancestors = self.ancestors_of(class);
        let mut properties = Vec::new();
        for declared in &self.classes {
            for property in &declared.properties {
                if let Some(reference) = &property.reference {
                    if reference.tracked && ancestors.contains(&reference.target_class) {
                        properties.push(property.id);
                    }
                }
            }
        }
        properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model() -> DataModel {
        let base = ClassMeta::new(1, "Item")
            .abstract_class()
            .with_property(PropertyMeta::simple(10, "x", PropertyKind::Int));
        let order = ClassMeta::new(2, "Order")
            .with_base(ClassId(1))
            .with_property(PropertyMeta::simple(20, "total", PropertyKind::Long))
            .with_hash_index(HashIndexMeta {
                id: IndexId(100),
                name: "by_total".to_string(),
                unique: true,
                properties: vec![PropertyId(20)],
            });
        DataModel::new(vec![base, order]).unwrap()
    }

    #[test]
    fn test_lookup_by_id_and_name() {
        let model = sample_model();
        assert_eq!(model.class(ClassId(2)).unwrap().name, "Order");
        assert_eq!(model.class_by_name("Order").unwrap().id, ClassId(2));
        assert!(model.class(ClassId(99)).is_none());
    }

    #[test]
    fn test_subtree_includes_descendants() {
        let model = sample_model();
        let subtree = model.subtree_of(ClassId(1));
        assert!(subtree.contains(&ClassId(1)));
        assert!(subtree.contains(&ClassId(2)));
        assert_eq!(model.subtree_of(ClassId(2)), &[ClassId(2)]);
    }

    #[test]
    fn test_concrete_classes_skip_abstract() {
        let model = sample_model();
        let names: Vec<_> = model.concrete_classes().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Order"]);
    }

    #[test]
    fn test_default_template_matches_properties() {
        let model = sample_model();
        let order = model.class(ClassId(2)).unwrap();
        let template = order.default_template();
        assert_eq!(template.len(), order.properties.len());
        assert_eq!(template[0], PropertyValue::Long(0));
    }

    #[test]
    fn test_index_over_blob_rejected() {
        let class = ClassMeta::new(1, "Doc")
            .with_property(PropertyMeta::simple(1, "payload", PropertyKind::Blob))
            .with_hash_index(HashIndexMeta {
                id: IndexId(1),
                name: "by_payload".to_string(),
                unique: false,
                properties: vec![PropertyId(1)],
            });
        let err = DataModel::new(vec![class]).unwrap_err();
        assert!(matches!(err, DbError::IndexPropertyWrongType { .. }));
    }

    #[test]
    fn test_sorted_index_over_string_rejected() {
        let class = ClassMeta::new(1, "Doc")
            .with_property(PropertyMeta::simple(1, "title", PropertyKind::String))
            .with_sorted_index(SortedIndexMeta {
                id: IndexId(1),
                name: "by_title".to_string(),
                unique: false,
                properties: vec![PropertyId(1)],
            });
        assert!(DataModel::new(vec![class]).is_err());
    }

    #[test]
    fn test_tracked_reference_enumeration() {
        let a = ClassMeta::new(1, "A").with_property(PropertyMeta::reference(
            1,
            "r",
            ClassId(2),
            Multiplicity::ZeroOrOne,
            DeleteAction::SetNull,
            true,
        ));
        let b = ClassMeta::new(2, "B");
        let model = DataModel::new(vec![a, b]).unwrap();
        let tracked: Vec<_> = model
            .class(ClassId(1))
            .unwrap()
            .tracked_reference_properties()
            .map(|p| p.id)
            .collect();
        assert_eq!(tracked, vec![PropertyId(1)]);
    }
}
