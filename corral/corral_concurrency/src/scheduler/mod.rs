//! Bounded job execution.
//!
//! This module provides an admission-controlled job queue:
//!
//! - Jobs with priorities, run-alone flags and a `scheduled` hook
//! - Single-resolution handles to each job's outcome
//! - Job groups for waiting on a subset of submissions
//! - A worker pool capped by a shared semaphore, with barrier-style draining

pub mod group;
pub mod handle;
pub mod job;
pub mod queue;

// Re-export key types from group
pub use group::JobGroup;

// Re-export key types from handle
pub use handle::{JobError, JobHandle, JobResult};

// Re-export key types from job
pub use job::{BlockJob, Job, JobFlags, Priority};

// Re-export key types from queue
pub use queue::{JobQueue, JobQueueConfig, JobQueueStats};
