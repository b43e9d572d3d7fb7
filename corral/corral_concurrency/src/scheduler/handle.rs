//! Single-resolution handles for submitted jobs.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a job did not produce a value
#[derive(Error, Debug, PartialEq, Eq)]
pub enum JobError<E> {
    /// The job's `perform` returned an error
    #[error("job failed: {0}")]
    Failed(E),

    /// The job panicked
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The job was dropped without running to completion
    #[error("job was abandoned before producing a result")]
    Abandoned,
}

/// Outcome delivered to a [`JobHandle`]
pub type JobResult<T, E> = Result<T, JobError<E>>;

/// The eventual result of one submitted job.
///
/// Dropping the handle does not cancel the job.
pub struct JobHandle<T, E> {
    id: u64,
    receiver: Receiver<JobResult<T, E>>,
}

/// Resolves the paired handle exactly once
pub(crate) struct Resolver<T, E> {
    sender: Sender<JobResult<T, E>>,
}

/// Create a resolver and the handle it resolves
pub(crate) fn pair<T, E>(id: u64) -> (Resolver<T, E>, JobHandle<T, E>) {
    let (sender, receiver) = bounded(1);
    (Resolver { sender }, JobHandle { id, receiver })
}

impl<T, E> Resolver<T, E> {
    pub(crate) fn resolve(self, outcome: JobResult<T, E>) {
        // The handle may already be gone; the outcome is then discarded
        let _ = self.sender.send(outcome);
    }
}

impl<T, E> JobHandle<T, E> {
    /// Submission sequence number of the job
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the outcome is ready to be taken without blocking
    pub fn is_resolved(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Block until the job finishes and return its outcome
    pub fn wait(self) -> JobResult<T, E> {
        self.receiver.recv().unwrap_or(Err(JobError::Abandoned))
    }

    /// Wait at most `timeout`; on timeout the handle is given back
    pub fn wait_timeout(self, timeout: Duration) -> Result<JobResult<T, E>, Self> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Ok(outcome),
            Err(RecvTimeoutError::Timeout) => Err(self),
            Err(RecvTimeoutError::Disconnected) => Ok(Err(JobError::Abandoned)),
        }
    }

    /// Take the outcome if it is ready; otherwise the handle is given back
    pub fn try_wait(self) -> Result<JobResult<T, E>, Self> {
        match self.receiver.try_recv() {
            Ok(outcome) => Ok(outcome),
            Err(TryRecvError::Empty) => Err(self),
            Err(TryRecvError::Disconnected) => Ok(Err(JobError::Abandoned)),
        }
    }
}

impl<T, E> fmt::Debug for JobHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
