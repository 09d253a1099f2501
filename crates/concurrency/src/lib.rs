//! velox-concurrency: transaction objects, locks, and commit machinery
//!
//! Builds the transaction layer on top of velox-storage: the transaction
//! object with its effect log and cancellation state, class locks and the
//! engine-wide gate, and the commit sequencer plus worker pool that
//! serialize version assignment and execute commits asynchronously.

pub mod commit;
pub mod locks;
pub mod transaction;

pub use commit::{CommitPool, CommitSequencer, CommitTicket};
pub use locks::{ClassLockTable, CountLock, EngineGate};
pub use transaction::{CancelHandle, TranStatus, Transaction};
