//! Synchronization primitives the pools and queues are built on.
//!
//! - A mutex with exclusive and reentrant modes, raw lock/unlock and scoped acquisition
//! - A counting admission semaphore with RAII permits
//! - A value box serialized through an injected lock

pub mod atomic;
pub mod lock;
pub mod semaphore;

// Re-export key types from atomic
pub use atomic::Atomic;

// Re-export key types from lock
pub use lock::{LockError, LockStats, Mutex, MutexKind, Synchronized};

// Re-export key types from semaphore
pub use semaphore::{Permit, Semaphore};
