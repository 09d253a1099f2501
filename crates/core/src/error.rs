//! Error taxonomy for the engine
//!
//! A single `DbError` enum carries every user-visible failure kind plus the
//! contextual fields (object id, class name, property name) the caller
//! needs to diagnose it. `thiserror` provides `Display`/`Error`.
//!
//! Propagation policy:
//! - Any error raised inside a public engine operation triggers an
//!   immediate rollback of the enclosing transaction before it is returned.
//! - Errors inside commit finalization (after the commit version has been
//!   assigned) and on restore/alignment paths indicate engine corruption or
//!   inconsistent upstream input; callers crash fast with a diagnostic
//!   rather than returning them.

use crate::types::{ObjectId, PropertyId};
use thiserror::Error;

/// Result type alias for engine operations.
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Unified error type for all engine operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DbError {
    // =========================================================================
    // Structural errors
    // =========================================================================
    /// The database has been disposed; no further operations are accepted.
    #[error("database has been disposed")]
    DatabaseDisposed,

    /// The database is draining for an exclusive operation and cannot
    /// accept the request right now.
    #[error("database is busy")]
    DatabaseBusy,

    /// Operation requires a persistence collaborator and none is attached.
    #[error("persistence is not configured")]
    MissingPersistence,

    /// The supplied data model version does not match the engine's.
    #[error("invalid model version {got}, expected {expected}")]
    InvalidModelVersion {
        /// Version presented by the caller
        got: u64,
        /// Version the engine is running
        expected: u64,
    },

    /// Another configuration update is already in flight.
    #[error("concurrent configuration update in progress")]
    ConcurrentConfigUpdate,

    /// The configured number of persistence logs exceeds the limit.
    #[error("log count limit exceeded: {0}")]
    LogCountLimit(usize),

    /// A persistence log name is not valid.
    #[error("invalid log name: {0}")]
    InvalidLogName(String),

    /// Two persistence logs share the same name.
    #[error("log name is not unique: {0}")]
    NonUniqueLogName(String),

    /// A persistence log directory is not valid.
    #[error("invalid log directory: {0}")]
    InvalidLogDirectory(String),

    // =========================================================================
    // Transactional errors
    // =========================================================================
    /// Snapshot-isolation conflict: the write raced a concurrent
    /// transaction and must be retried.
    #[error("transaction conflict on object {object_id} of class {class}")]
    Conflict {
        /// Conflicted object id (NULL when the conflict is not object-scoped)
        object_id: ObjectId,
        /// Class name
        class: String,
    },

    /// A write operation was attempted inside a read transaction.
    #[error("write attempted in a read transaction")]
    ReadTranWriteAttempt,

    /// Commit was called on a transaction that is already closed.
    #[error("transaction is already closed")]
    CommitClosedTransaction,

    /// The transaction was canceled by the caller.
    #[error("transaction was canceled")]
    TransactionCanceled,

    /// The engine shut down before the commit outcome could be determined.
    #[error("commit result is unavailable")]
    UnavailableCommitResult,

    // =========================================================================
    // Data-integrity errors
    // =========================================================================
    /// Zero is not a valid object id.
    #[error("object id 0 is not valid in class {class}")]
    ZeroId {
        /// Class name
        class: String,
    },

    /// The same id was inserted twice.
    #[error("object id {object_id} already exists in class {class}")]
    NonUniqueId {
        /// Duplicate id
        object_id: ObjectId,
        /// Class name
        class: String,
    },

    /// Update targeted an object that does not exist in the snapshot.
    #[error("cannot update nonexistent object {object_id} of class {class}")]
    UpdateNonExistent {
        /// Missing id
        object_id: ObjectId,
        /// Class name
        class: String,
    },

    /// Delete targeted an object that does not exist in the snapshot.
    #[error("cannot delete nonexistent object {object_id} of class {class}")]
    DeleteNonExistent {
        /// Missing id
        object_id: ObjectId,
        /// Class name
        class: String,
    },

    /// A unique index already contains an equal key.
    #[error("uniqueness violation on index {index} of class {class} by object {object_id}")]
    UniquenessViolation {
        /// Offending object
        object_id: ObjectId,
        /// Class name
        class: String,
        /// Index name
        index: String,
    },

    /// A multiplicity-one reference was left null.
    #[error("reference property {property} of object {object_id} must not be null")]
    NullReferenceNotAllowed {
        /// Owner of the reference
        object_id: ObjectId,
        /// Reference property
        property: PropertyId,
    },

    /// A reference points at an object that does not exist.
    #[error("object {object_id} references unknown object {target} through property {property}")]
    UnknownReference {
        /// Owner of the reference
        object_id: ObjectId,
        /// Reference property
        property: PropertyId,
        /// Missing target
        target: ObjectId,
    },

    /// Inverse references were requested for an untracked property.
    #[error("property {property} does not track inverse references")]
    InverseReferenceNotTracked {
        /// The untracked property
        property: PropertyId,
    },

    /// Objects of an abstract class cannot be written.
    #[error("class {class} is abstract and cannot be written")]
    AbstractClassWrite {
        /// Class name
        class: String,
    },

    /// A secondary-index operation raced a concurrent transaction.
    #[error("index conflict on index {index} of class {class}")]
    IndexConflict {
        /// Class name
        class: String,
        /// Index name
        index: String,
    },

    /// An index was declared over a property whose kind cannot be indexed.
    #[error("property {property} has the wrong type for index {index}")]
    IndexPropertyWrongType {
        /// Offending property
        property: PropertyId,
        /// Index name
        index: String,
    },
}

impl DbError {
    /// Conflict on a specific object.
    pub fn conflict(object_id: ObjectId, class: impl Into<String>) -> Self {
        DbError::Conflict {
            object_id,
            class: class.into(),
        }
    }

    /// Conflict not tied to a single object (e.g. range or key locks).
    pub fn index_conflict(class: impl Into<String>, index: impl Into<String>) -> Self {
        DbError::IndexConflict {
            class: class.into(),
            index: index.into(),
        }
    }

    /// Whether a retry of the whole transaction may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DbError::Conflict { .. } | DbError::IndexConflict { .. })
    }

    /// Whether this error reports invalid data rather than a race.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            DbError::ZeroId { .. }
                | DbError::NonUniqueId { .. }
                | DbError::UpdateNonExistent { .. }
                | DbError::DeleteNonExistent { .. }
                | DbError::UniquenessViolation { .. }
                | DbError::NullReferenceNotAllowed { .. }
                | DbError::UnknownReference { .. }
                | DbError::InverseReferenceNotTracked { .. }
                | DbError::AbstractClassWrite { .. }
                | DbError::IndexPropertyWrongType { .. }
        )
    }

    /// Whether the engine as a whole is unusable.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            DbError::DatabaseDisposed
                | DbError::DatabaseBusy
                | DbError::MissingPersistence
                | DbError::InvalidModelVersion { .. }
                | DbError::ConcurrentConfigUpdate
                | DbError::LogCountLimit(_)
                | DbError::InvalidLogName(_)
                | DbError::NonUniqueLogName(_)
                | DbError::InvalidLogDirectory(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        let e = DbError::conflict(ObjectId::new(5), "Order");
        assert!(e.is_conflict());
        assert!(!e.is_data_error());
        assert!(!e.is_structural());

        let e = DbError::index_conflict("Order", "by_total");
        assert!(e.is_conflict());
    }

    #[test]
    fn test_data_error_classification() {
        let e = DbError::NonUniqueId {
            object_id: ObjectId::new(1),
            class: "Order".to_string(),
        };
        assert!(e.is_data_error());
        assert!(!e.is_conflict());
    }

    #[test]
    fn test_display_carries_context() {
        let e = DbError::UniquenessViolation {
            object_id: ObjectId::new(2),
            class: "User".to_string(),
            index: "by_email".to_string(),
        };
        let msg = e.to_string();
        assert!(msg.contains("by_email"));
        assert!(msg.contains("User"));
        assert!(msg.contains('2'));
    }

    #[test]
    fn test_structural_classification() {
        assert!(DbError::DatabaseDisposed.is_structural());
        assert!(!DbError::TransactionCanceled.is_structural());
    }
}
