//! Units of work accepted by the job queue.

use std::fmt;

/// Scheduling priority of a job (higher runs first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Background work
    Low,

    /// The default
    #[default]
    Normal,

    /// Jumps ahead of normal work
    High,

    /// Jumps ahead of everything else
    Critical,
}

/// Execution flags for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobFlags {
    /// Run alone: wait until no other job holds a slot and hold all of them
    pub barrier: bool,
}

impl JobFlags {
    /// No special handling
    pub const NONE: JobFlags = JobFlags { barrier: false };

    /// Run with exclusive use of the queue
    pub const BARRIER: JobFlags = JobFlags { barrier: true };
}

/// A unit of work for a [`JobQueue`](super::JobQueue).
///
/// Only [`Job::perform`] is required. The queue reads `priority` and `flags`
/// once at submission and calls `scheduled` when a worker picks the job up,
/// which may be before a concurrency slot is free.
pub trait Job: Send + 'static {
    /// Value produced on success
    type Output: Send + 'static;

    /// Error produced on failure
    type Error: Send + 'static;

    /// Position in the backlog relative to other jobs
    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// Execution flags
    fn flags(&self) -> JobFlags {
        JobFlags::NONE
    }

    /// Called once the job leaves the backlog, before it waits for a slot
    fn scheduled(&self) {}

    /// Do the work
    fn perform(self) -> Result<Self::Output, Self::Error>;
}

/// A job wrapping a closure, with default priority and no flags
pub struct BlockJob<F> {
    block: F,
}

impl<F> BlockJob<F> {
    /// Wrap `block` as a job
    pub fn new(block: F) -> Self {
        Self { block }
    }
}

impl<F, T, E> Job for BlockJob<F>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    type Output = T;
    type Error = E;

    fn perform(self) -> Result<T, E> {
        (self.block)()
    }
}

impl<F> fmt::Debug for BlockJob<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlockJob")
    }
}
