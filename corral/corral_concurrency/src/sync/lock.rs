//! Mutual exclusion with exclusive and reentrant modes.
//!
//! [`Mutex`] exposes raw `lock`/`unlock` calls in addition to scoped
//! acquisition, so ownership is tracked per thread rather than through a
//! borrowed guard. Contract violations (unlocking a mutex the caller does not
//! hold, dropping a held mutex) panic.

use log::{error, trace, warn};
use parking_lot::{Condvar, ReentrantMutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error when acquiring a lock
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock could not be acquired within the specified timeout
    #[error("lock acquisition timed out after {0:?}")]
    Timeout(Duration),
}

/// Locking behavior of a [`Mutex`], fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutexKind {
    /// Non-reentrant. Locking again from the owning thread deadlocks.
    #[default]
    Normal,

    /// Reentrant. The owning thread may lock repeatedly and must unlock the
    /// same number of times.
    Recursive,
}

/// Statistics about lock usage
#[derive(Debug, Default, Clone)]
pub struct LockStats {
    /// Number of successful lock acquisitions (nested acquisitions included)
    pub acquisition_count: usize,

    /// Number of timed acquisitions that gave up
    pub failed_count: usize,

    /// Total time spent waiting for the lock (microseconds)
    pub total_wait_time_us: u64,

    /// Maximum time spent waiting for the lock (microseconds)
    pub max_wait_time_us: u64,
}

#[derive(Debug, Default)]
struct MutexStats {
    acquisition_count: AtomicUsize,
    failed_count: AtomicUsize,
    total_wait_time_us: AtomicUsize,
    max_wait_time_us: AtomicUsize,
}

#[derive(Debug, Default)]
struct Ownership {
    owner: Option<ThreadId>,
    depth: usize,
}

/// A lock-like capability that can run a closure while holding exclusive access.
///
/// The closure's return value, including any `Result` error, is passed back
/// unchanged and the lock is released on every exit path, unwinding included.
pub trait Synchronized {
    /// Run `f` while holding the lock.
    fn synchronized<T>(&self, f: impl FnOnce() -> T) -> T;
}

/// A mutual-exclusion lock with a fixed [`MutexKind`].
pub struct Mutex {
    kind: MutexKind,

    /// Owner thread and hold depth
    state: parking_lot::Mutex<Ownership>,

    /// Signalled whenever the lock becomes free
    released: Condvar,

    stats: MutexStats,

    /// Name of this mutex for debugging
    name: Option<String>,
}

impl Mutex {
    /// Create a new mutex of the given kind
    pub fn new(kind: MutexKind) -> Self {
        Self {
            kind,
            state: parking_lot::Mutex::new(Ownership::default()),
            released: Condvar::new(),
            stats: MutexStats::default(),
            name: None,
        }
    }

    /// Create a new non-reentrant mutex
    pub fn normal() -> Self {
        Self::new(MutexKind::Normal)
    }

    /// Create a new reentrant mutex
    pub fn recursive() -> Self {
        Self::new(MutexKind::Recursive)
    }

    /// Create a new mutex with a name for debugging
    pub fn with_name(kind: MutexKind, name: impl Into<String>) -> Self {
        let mut mutex = Self::new(kind);
        mutex.name = Some(name.into());
        mutex
    }

    /// The kind this mutex was created with
    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    /// Get the name of this mutex
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Block until the current thread owns the mutex.
    ///
    /// For a [`MutexKind::Normal`] mutex already held by the current thread
    /// this never returns.
    pub fn lock(&self) {
        let me = thread::current().id();
        let start = Instant::now();
        let mut state = self.state.lock();

        if state.owner == Some(me) {
            match self.kind {
                MutexKind::Recursive => {
                    state.depth += 1;
                    let depth = state.depth;
                    drop(state);
                    self.record_acquisition(start.elapsed());
                    trace!("Lock re-entered: {} (depth: {})", self.label(), depth);
                    return;
                }
                MutexKind::Normal => {
                    error!(
                        "Lock {}: thread {:?} locked a non-recursive mutex it already holds, deadlocking",
                        self.label(),
                        me
                    );
                }
            }
        }

        while state.owner.is_some() {
            self.released.wait(&mut state);
        }

        state.owner = Some(me);
        state.depth = 1;
        drop(state);

        let wait_time = start.elapsed();
        self.record_acquisition(wait_time);

        trace!(
            "Lock acquired: {} (wait time: {:.2}ms)",
            self.label(),
            wait_time.as_secs_f64() * 1000.0
        );
    }

    /// Try to lock the mutex without blocking.
    ///
    /// Returns `true` if the current thread now owns the mutex.
    pub fn try_lock(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();

        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
            }
            Some(owner) if owner == me && self.kind == MutexKind::Recursive => {
                state.depth += 1;
            }
            Some(_) => return false,
        }

        drop(state);
        self.record_acquisition(Duration::ZERO);
        true
    }

    /// Try to lock the mutex, giving up after `timeout`.
    ///
    /// A non-recursive mutex already held by the current thread times out
    /// instead of deadlocking.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<(), LockError> {
        let me = thread::current().id();
        let start = Instant::now();
        let deadline = start.checked_add(timeout);
        let mut state = self.state.lock();

        if state.owner == Some(me) && self.kind == MutexKind::Recursive {
            state.depth += 1;
            drop(state);
            self.record_acquisition(start.elapsed());
            return Ok(());
        }

        while state.owner.is_some() {
            let Some(deadline) = deadline else {
                self.released.wait(&mut state);
                continue;
            };

            if self.released.wait_until(&mut state, deadline).timed_out() && state.owner.is_some()
            {
                drop(state);
                self.stats.failed_count.fetch_add(1, Ordering::Relaxed);

                warn!(
                    "Lock timeout: {} (waited: {:.2}ms, timeout: {:.2}ms)",
                    self.label(),
                    start.elapsed().as_secs_f64() * 1000.0,
                    timeout.as_secs_f64() * 1000.0
                );

                return Err(LockError::Timeout(timeout));
            }
        }

        state.owner = Some(me);
        state.depth = 1;
        drop(state);
        self.record_acquisition(start.elapsed());

        Ok(())
    }

    /// Release one level of ownership.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is not locked or is owned by another thread.
    pub fn unlock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();

        match state.owner {
            Some(owner) if owner == me => {}
            Some(_) => {
                drop(state);
                panic!(
                    "Failed to release lock {}: the unlocking thread does not hold the mutex",
                    self.label()
                );
            }
            None => {
                drop(state);
                panic!("Failed to release lock {}: the mutex is not locked", self.label());
            }
        }

        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
            trace!("Lock released: {}", self.label());
        }
    }

    /// Lock, run `f`, and unlock on every exit path.
    pub fn synchronized<T>(&self, f: impl FnOnce() -> T) -> T {
        self.lock();
        let _unlock = Unlock(self);
        f()
    }

    /// Whether any thread currently holds the mutex
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Whether the current thread holds the mutex
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Number of unmatched `lock` calls made by the current owner
    pub fn hold_depth(&self) -> usize {
        self.state.lock().depth
    }

    /// Get the statistics for this mutex
    pub fn stats(&self) -> LockStats {
        LockStats {
            acquisition_count: self.stats.acquisition_count.load(Ordering::Relaxed),
            failed_count: self.stats.failed_count.load(Ordering::Relaxed),
            total_wait_time_us: self.stats.total_wait_time_us.load(Ordering::Relaxed) as u64,
            max_wait_time_us: self.stats.max_wait_time_us.load(Ordering::Relaxed) as u64,
        }
    }

    /// Reset the statistics
    pub fn reset_stats(&self) {
        self.stats.acquisition_count.store(0, Ordering::Relaxed);
        self.stats.failed_count.store(0, Ordering::Relaxed);
        self.stats.total_wait_time_us.store(0, Ordering::Relaxed);
        self.stats.max_wait_time_us.store(0, Ordering::Relaxed);
    }

    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }

    fn record_acquisition(&self, wait_time: Duration) {
        let wait_time_us = wait_time.as_micros() as usize;

        self.stats.acquisition_count.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_wait_time_us
            .fetch_add(wait_time_us, Ordering::Relaxed);

        let mut current_max = self.stats.max_wait_time_us.load(Ordering::Relaxed);
        while wait_time_us > current_max {
            match self.stats.max_wait_time_us.compare_exchange(
                current_max,
                wait_time_us,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current_max = actual,
            }
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::normal()
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }

        let state = self.state.get_mut();
        assert!(
            state.owner.is_none(),
            "Unable to destroy a locked mutex: {}",
            self.name.as_deref().unwrap_or("unnamed")
        );
    }
}

/// Releases one level of a [`Mutex`] when dropped
struct Unlock<'a>(&'a Mutex);

impl Drop for Unlock<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

impl Synchronized for Mutex {
    fn synchronized<T>(&self, f: impl FnOnce() -> T) -> T {
        Mutex::synchronized(self, f)
    }
}

impl Synchronized for parking_lot::Mutex<()> {
    fn synchronized<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.lock();
        f()
    }
}

impl Synchronized for ReentrantMutex<()> {
    fn synchronized<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.lock();
        f()
    }
}

impl<L: Synchronized> Synchronized for Arc<L> {
    fn synchronized<T>(&self, f: impl FnOnce() -> T) -> T {
        (**self).synchronized(f)
    }
}

impl<L: Synchronized> Synchronized for &L {
    fn synchronized<T>(&self, f: impl FnOnce() -> T) -> T {
        (**self).synchronized(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mutex_basic() {
        let mutex = Mutex::normal();

        mutex.lock();
        assert!(mutex.is_locked());
        assert!(mutex.is_owned_by_current_thread());
        mutex.unlock();

        assert!(!mutex.is_locked());
        assert_eq!(mutex.stats().acquisition_count, 1);
    }

    #[test]
    fn test_mutex_try_lock() {
        let mutex = Mutex::normal();

        assert!(mutex.try_lock());

        // Non-recursive: a second try from the owner fails instead of deadlocking
        assert!(!mutex.try_lock());

        mutex.unlock();
        assert!(mutex.try_lock());
        mutex.unlock();

        let stats = mutex.stats();
        assert_eq!(stats.acquisition_count, 2);
        assert_eq!(stats.failed_count, 0);
    }

    #[test]
    fn test_recursive_mutex_nesting() {
        let mutex = Arc::new(Mutex::recursive());

        mutex.lock();
        mutex.lock();
        assert_eq!(mutex.hold_depth(), 2);

        mutex.unlock();
        assert!(mutex.is_locked());

        let contender = Arc::clone(&mutex);
        let blocked = thread::spawn(move || contender.try_lock_for(Duration::from_millis(50)))
            .join()
            .unwrap();
        assert_eq!(blocked, Err(LockError::Timeout(Duration::from_millis(50))));

        mutex.unlock();
        assert!(!mutex.is_locked());

        let contender = Arc::clone(&mutex);
        thread::spawn(move || {
            contender.try_lock_for(Duration::from_secs(1)).unwrap();
            contender.unlock();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_normal_mutex_self_deadlock_times_out() {
        let mutex = Mutex::with_name(MutexKind::Normal, "self_deadlock");

        mutex.lock();
        let result = mutex.try_lock_for(Duration::from_millis(20));
        assert!(matches!(result, Err(LockError::Timeout(_))));
        assert_eq!(mutex.stats().failed_count, 1);
        mutex.unlock();
    }

    #[test]
    fn test_try_lock_for_waits_for_release() {
        let mutex = Arc::new(Mutex::normal());
        mutex.lock();

        let contender = Arc::clone(&mutex);
        let waiter = thread::spawn(move || {
            let result = contender.try_lock_for(Duration::from_secs(2));
            if result.is_ok() {
                contender.unlock();
            }
            result
        });

        thread::sleep(Duration::from_millis(20));
        mutex.unlock();

        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_try_lock_for_beyond_instant_range() {
        let mutex = Arc::new(Mutex::normal());

        assert_eq!(mutex.try_lock_for(Duration::MAX), Ok(()));

        let contender = Arc::clone(&mutex);
        let waiter = thread::spawn(move || {
            let result = contender.try_lock_for(Duration::MAX);
            contender.unlock();
            result
        });

        thread::sleep(Duration::from_millis(20));
        mutex.unlock();

        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert!(!mutex.is_locked());
    }

    #[test]
    #[should_panic(expected = "not locked")]
    fn test_unlock_without_lock_panics() {
        let mutex = Mutex::normal();
        mutex.unlock();
    }

    #[test]
    fn test_unlock_from_other_thread_panics() {
        let mutex = Arc::new(Mutex::normal());
        mutex.lock();

        let other = Arc::clone(&mutex);
        let result = thread::spawn(move || other.unlock()).join();
        assert!(result.is_err());

        // Still owned by this thread
        assert!(mutex.is_owned_by_current_thread());
        mutex.unlock();
    }

    #[test]
    #[should_panic(expected = "Unable to destroy a locked mutex")]
    fn test_drop_while_locked_panics() {
        let mutex = Mutex::normal();
        mutex.lock();
        drop(mutex);
    }

    #[test]
    fn test_synchronized_releases_on_error() {
        let mutex = Mutex::normal();

        let result: Result<(), &str> = mutex.synchronized(|| Err("boom"));
        assert_eq!(result, Err("boom"));
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn test_synchronized_releases_on_panic() {
        let mutex = Mutex::recursive();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            mutex.synchronized(|| -> () { panic!("inside") })
        }));
        assert!(result.is_err());
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_mutex_contention() {
        let mutex = Arc::new(Mutex::with_name(MutexKind::Normal, "test_mutex"));
        let counter = Arc::new(AtomicUsize::new(0));
        let threads = 8;
        let iterations = 100;

        let mut handles = vec![];

        for _ in 0..threads {
            let mutex = Arc::clone(&mutex);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..iterations {
                    mutex.synchronized(|| {
                        // Non-atomic read-modify-write made safe by the lock
                        let value = counter.load(Ordering::Relaxed);
                        thread::sleep(Duration::from_micros(5));
                        counter.store(value + 1, Ordering::Relaxed);
                    });
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), threads * iterations);
        assert_eq!(mutex.stats().acquisition_count, threads * iterations);
    }

    #[test]
    fn test_synchronized_impls_for_parking_lot() {
        let plain = parking_lot::Mutex::new(());
        assert_eq!(plain.synchronized(|| 7), 7);

        let reentrant = ReentrantMutex::new(());
        let nested = reentrant.synchronized(|| reentrant.synchronized(|| 3));
        assert_eq!(nested, 3);

        let shared = Arc::new(Mutex::recursive());
        assert_eq!(Synchronized::synchronized(&shared, || "ok"), "ok");
    }
}
