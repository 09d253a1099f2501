//! Commit machinery: sequencer and worker pool
//!
//! Commit-version assignment is serialized by a single sequencer so
//! commit versions stay monotonic and aligned with the persistence
//! collaborator's log sequence numbers. The actual commit work of client
//! transactions runs on a fixed pool of workers fed through a channel;
//! the submitting thread blocks on a completion handle. If the pool shuts
//! down before a handed-off commit completes, the waiter observes
//! `UnavailableCommitResult` rather than hanging.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;
use velox_core::error::{DbError, DbResult};

/// Serializes commit-version assignment and persistence hand-off.
pub struct CommitSequencer {
    lock: Mutex<()>,
    global_version: Arc<AtomicU64>,
}

impl CommitSequencer {
    /// New sequencer over the shared committed-version counter.
    pub fn new(global_version: Arc<AtomicU64>) -> Self {
        CommitSequencer {
            lock: Mutex::new(()),
            global_version,
        }
    }

    /// The highest committed version.
    pub fn committed_version(&self) -> u64 {
        self.global_version.load(Ordering::Acquire)
    }

    /// Run the sequenced section: `f` receives the assigned commit
    /// version; the global committed version advances only after `f`
    /// returns success, so snapshots never see half-finalized commits
    /// sequenced after them.
    pub fn sequence<R>(&self, f: impl FnOnce(u64) -> DbResult<R>) -> DbResult<(u64, R)> {
        let _serialized = self.lock.lock();
        let commit_version = self.global_version.load(Ordering::Acquire) + 1;
        let result = f(commit_version)?;
        Ok((commit_version, result))
    }

    /// Publish a fully finalized commit version.
    pub fn publish(&self, commit_version: u64) {
        self.global_version.store(commit_version, Ordering::Release);
    }
}

type CommitJob = Box<dyn FnOnce() + Send + 'static>;

/// Completion handle for a handed-off commit.
pub struct CommitTicket<T> {
    receiver: Receiver<DbResult<T>>,
}

impl<T> CommitTicket<T> {
    /// Block until the commit outcome is determined. A disconnected
    /// channel means the engine shut down mid-commit.
    pub fn wait(self) -> DbResult<T> {
        match self.receiver.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(DbError::UnavailableCommitResult),
        }
    }
}

/// Fixed pool of commit workers.
pub struct CommitPool {
    sender: Mutex<Option<Sender<CommitJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CommitPool {
    /// Spawn `workers` commit threads.
    pub fn new(workers: usize) -> Self {
        let (sender, receiver) = unbounded::<CommitJob>();
        let handles = (0..workers.max(1))
            .map(|index| {
                let receiver: Receiver<CommitJob> = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("velox-commit-{index}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("commit worker spawn")
            })
            .collect();
        CommitPool {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    /// Hand a commit off to the pool, returning the completion ticket.
    ///
    /// `work` runs on a worker thread and must send its outcome through
    /// the provided sender exactly once on every path.
    pub fn submit<T, F>(&self, work: F) -> DbResult<CommitTicket<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> DbResult<T> + Send + 'static,
    {
        let (result_sender, receiver) = bounded::<DbResult<T>>(1);
        let job: CommitJob = Box::new(move || {
            let outcome = work();
            let _ = result_sender.send(outcome);
        });
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                sender.send(job).map_err(|_| DbError::UnavailableCommitResult)?;
                Ok(CommitTicket { receiver })
            }
            None => Err(DbError::UnavailableCommitResult),
        }
    }

    /// Shut the pool down: stop accepting work, drain workers. Queued
    /// jobs that never ran complete their waiters with
    /// `UnavailableCommitResult` through channel disconnection.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
        debug!("commit pool drained");
    }
}

impl Drop for CommitPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
