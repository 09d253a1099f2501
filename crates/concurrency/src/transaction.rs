//! Transaction objects
//!
//! A [`Transaction`] bundles its identity (id, snapshot horizon, slot)
//! with the per-transaction context: the storage effect log, the class
//! locks held, cancellation state, and the lifecycle status. The engine
//! finalizes or reverses everything recorded here at commit or rollback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use velox_core::error::{DbError, DbResult};
use velox_core::external::{TranSource, TranType};
use velox_core::tran::TranIdentity;
use velox_core::types::ClassId;
use velox_storage::EffectLog;

/// Lifecycle status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranStatus {
    /// Accepting operations.
    Active,
    /// Handed to the commit machinery.
    Committing,
    /// Committed at the carried version.
    Committed(u64),
    /// Rolled back; every effect reversed.
    RolledBack,
}

/// Handle for canceling a transaction from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Request cancellation; honored at the next public engine operation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One transaction.
pub struct Transaction {
    /// Identity: id, read version, type, source, slot.
    pub identity: TranIdentity,
    /// Lifecycle status.
    pub status: TranStatus,
    /// Storage-level effect log.
    pub log: EffectLog,
    /// Classes read-locked by this transaction (multiset).
    pub read_classes: Vec<ClassId>,
    /// Classes write-locked by this transaction (multiset).
    pub write_classes: Vec<ClassId>,
    cancel: CancelHandle,
}

impl Transaction {
    /// New active transaction.
    pub fn new(identity: TranIdentity) -> Self {
        Transaction {
            identity,
            status: TranStatus::Active,
            log: EffectLog::new(),
            read_classes: Vec::new(),
            write_classes: Vec::new(),
            cancel: CancelHandle::default(),
        }
    }

    /// The cancellation handle for this transaction.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Whether the transaction still accepts operations.
    pub fn is_active(&self) -> bool {
        self.status == TranStatus::Active
    }

    /// Fail unless the transaction is active.
    pub fn ensure_active(&self) -> DbResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(DbError::CommitClosedTransaction)
        }
    }

    /// Cancellation check at the entry of every public engine operation.
    pub fn check_canceled(&self) -> DbResult<()> {
        if self.cancel.is_canceled() {
            Err(DbError::TransactionCanceled)
        } else {
            Ok(())
        }
    }

    /// Guard against writes in read transactions.
    pub fn ensure_writable(&self) -> DbResult<()> {
        if self.identity.tran_type == TranType::ReadWrite {
            Ok(())
        } else {
            Err(DbError::ReadTranWriteAttempt)
        }
    }

    /// Whether this transaction may merge others into itself: merging is
    /// reserved for replication batches.
    pub fn accepts_merge(&self) -> bool {
        self.identity.source == TranSource::Replication
    }

    /// Merge another transaction's recorded effects into this one,
    /// transferring ownership of every logged item and class lock. The
    /// merged whole commits (or rolls back) as a single transaction.
    pub fn merge_from(&mut self, mut other: Transaction) {
        debug_assert!(self.accepts_merge() && other.accepts_merge());
        self.log.merge_from(std::mem::take(&mut other.log));
        self.read_classes.append(&mut other.read_classes);
        self.write_classes.append(&mut other.write_classes);
        other.status = TranStatus::RolledBack; // absorbed; must not finalize twice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use velox_core::version::TranId;

    fn identity(source: TranSource) -> TranIdentity {
        TranIdentity {
            id: TranId::from_counter(1),
            read_version: 0,
            commit_version: 0,
            tran_type: TranType::ReadWrite,
            source,
            slot: 0,
        }
    }

    #[test]
    fn test_lifecycle_guards() {
        let mut tran = Transaction::new(identity(TranSource::Client));
        assert!(tran.ensure_active().is_ok());
        assert!(tran.ensure_writable().is_ok());

        tran.status = TranStatus::Committed(5);
        assert!(matches!(
            tran.ensure_active(),
            Err(DbError::CommitClosedTransaction)
        ));
    }

    #[test]
    fn test_read_transaction_rejects_writes() {
        let mut id = identity(TranSource::Client);
        id.tran_type = TranType::Read;
        let tran = Transaction::new(id);
        assert!(matches!(
            tran.ensure_writable(),
            Err(DbError::ReadTranWriteAttempt)
        ));
    }

    #[test]
    fn test_cancellation() {
        let tran = Transaction::new(identity(TranSource::Client));
        let handle = tran.cancel_handle();
        assert!(tran.check_canceled().is_ok());
        handle.cancel();
        assert!(matches!(
            tran.check_canceled(),
            Err(DbError::TransactionCanceled)
        ));
    }

    #[test]
    fn test_merge_transfers_class_locks() {
        let mut a = Transaction::new(identity(TranSource::Replication));
        let mut b = Transaction::new(identity(TranSource::Replication));
        a.write_classes.push(ClassId(1));
        b.write_classes.push(ClassId(2));
        b.read_classes.push(ClassId(3));

        a.merge_from(b);
        assert_eq!(a.write_classes, vec![ClassId(1), ClassId(2)]);
        assert_eq!(a.read_classes, vec![ClassId(3)]);
    }

    #[test]
    fn test_client_transactions_do_not_merge() {
        let tran = Transaction::new(identity(TranSource::Client));
        assert!(!tran.accepts_merge());
        let repl = Transaction::new(identity(TranSource::Replication));
        assert!(repl.accepts_merge());
    }
}
