#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Corral Concurrency
//!
//! Bounded-concurrency building blocks for code that must cap how much
//! expensive work runs at once.
//!
//! This crate provides:
//!
//! - A mutex with exclusive and reentrant modes and scoped acquisition
//! - A value box serialized through an injected lock
//! - A lazily filled resource pool with blocking and timed checkout
//! - A job queue that runs at most N jobs at once and hands back a handle per job
//! - A compute-if-absent cache
//!
//! Contract violations such as unlocking a mutex the caller does not hold, or
//! building a pool or queue with zero capacity, panic. Operational failures
//! (a job failing, a provider failing, a timed wait expiring) are returned as
//! errors and never affect other callers.
//!
//! The crate logs through the `log` facade and installs no logger itself.

/// Keyed compute-if-absent cache
pub mod cache;

/// Resource pooling and reuse of expensive resources
pub mod pool;

/// Admission-controlled job execution
pub mod scheduler;

/// Synchronization primitives the pools and queues are built on
pub mod sync;

// Re-export key types for easier access
pub use cache::Cache;
pub use pool::{ResourceHandle, ResourcePool, ResourcePoolConfig, ResourcePoolError};
pub use scheduler::{
    BlockJob, Job, JobError, JobFlags, JobGroup, JobHandle, JobQueue, JobQueueConfig, Priority,
};
pub use sync::{Atomic, LockError, Mutex, MutexKind, Semaphore, Synchronized};
