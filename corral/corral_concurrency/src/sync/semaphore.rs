//! Counting admission semaphore.
//!
//! Permits are handed out as RAII [`Permit`] values, so every successful
//! acquisition is released exactly once, unwinding included.

use log::trace;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::lock::Synchronized;

/// A counting semaphore bounding concurrent access to `capacity` slots.
///
/// Waiters are granted permits first-available, with no FIFO fairness.
#[derive(Debug)]
pub struct Semaphore {
    capacity: usize,

    /// Permits not currently held
    available: Mutex<usize>,

    /// Signalled whenever permits are returned
    released: Condvar,
}

/// Held permits of a [`Semaphore`], returned when dropped.
#[derive(Debug)]
#[must_use = "the permit is released as soon as it is dropped"]
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
    count: usize,
}

impl Semaphore {
    /// Create a semaphore with `capacity` permits.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "A semaphore needs at least one permit");

        Self {
            capacity,
            available: Mutex::new(capacity),
            released: Condvar::new(),
        }
    }

    /// Total number of permits
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of permits not currently held
    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    /// Number of permits currently held
    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    /// Block until one permit is available
    pub fn acquire(&self) -> Permit<'_> {
        self.acquire_many(1)
    }

    /// Block until every permit is available and take all of them.
    ///
    /// While the returned permit is held nobody else can hold one.
    pub fn acquire_all(&self) -> Permit<'_> {
        self.acquire_many(self.capacity)
    }

    /// Take a permit only if one is available right now
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut available = self.available.lock();
        if *available == 0 {
            return None;
        }

        *available -= 1;
        Some(Permit {
            semaphore: self,
            count: 1,
        })
    }

    /// Wait at most `timeout` for a permit
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<Permit<'_>> {
        // A timeout past the representable range waits without a deadline
        let deadline = Instant::now().checked_add(timeout);
        let mut available = self.available.lock();

        while *available == 0 {
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut available, deadline).timed_out()
                        && *available == 0
                    {
                        return None;
                    }
                }
                None => self.released.wait(&mut available),
            }
        }

        *available -= 1;
        Some(Permit {
            semaphore: self,
            count: 1,
        })
    }

    fn acquire_many(&self, count: usize) -> Permit<'_> {
        let mut available = self.available.lock();

        while *available < count {
            self.released.wait(&mut available);
        }

        *available -= count;
        trace!("Acquired {} permit(s), {} left", count, *available);

        Permit {
            semaphore: self,
            count,
        }
    }

    fn release(&self, count: usize) {
        let mut available = self.available.lock();
        *available += count;
        debug_assert!(*available <= self.capacity);
        drop(available);

        // Single-permit and acquire-all waiters share the condvar
        self.released.notify_all();
    }
}

impl Permit<'_> {
    /// Number of permits held
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.semaphore.release(self.count);
    }
}

/// Holding every permit serializes the closure against all other holders.
impl Synchronized for Semaphore {
    fn synchronized<T>(&self, f: impl FnOnce() -> T) -> T {
        let _permit = self.acquire_all();
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_semaphore_basic() {
        let semaphore = Semaphore::new(2);

        let first = semaphore.acquire();
        let second = semaphore.try_acquire();
        assert!(second.is_some());
        assert_eq!(semaphore.available(), 0);
        assert!(semaphore.try_acquire().is_none());

        drop(first);
        assert_eq!(semaphore.available(), 1);
        drop(second);
        assert_eq!(semaphore.in_use(), 0);
    }

    #[test]
    fn test_semaphore_timeout() {
        let semaphore = Semaphore::new(1);
        let _held = semaphore.acquire();

        let start = Instant::now();
        assert!(semaphore.acquire_timeout(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_acquire_timeout_beyond_instant_range() {
        let semaphore = Semaphore::new(1);

        let permit = semaphore.acquire_timeout(Duration::MAX);
        assert!(permit.is_some());

        // Falls back to an untimed wait until the holder lets go
        thread::scope(|s| {
            s.spawn(move || {
                thread::sleep(Duration::from_millis(20));
                drop(permit);
            });

            assert!(semaphore.acquire_timeout(Duration::MAX).is_some());
        });
        assert_eq!(semaphore.available(), 1);
    }

    #[test]
    fn test_semaphore_bounds_concurrency() {
        let semaphore = Semaphore::new(3);
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..12 {
                s.spawn(|| {
                    let _permit = semaphore.acquire();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(semaphore.available(), 3);
    }

    #[test]
    fn test_acquire_all_waits_for_holders() {
        let semaphore = Semaphore::new(2);
        let held = semaphore.acquire();

        thread::scope(|s| {
            let exclusive = s.spawn(|| {
                let permit = semaphore.acquire_all();
                permit.count()
            });

            thread::sleep(Duration::from_millis(20));
            assert!(!exclusive.is_finished());

            drop(held);
            assert_eq!(exclusive.join().unwrap(), 2);
        });

        assert_eq!(semaphore.available(), 2);
    }

    #[test]
    #[should_panic(expected = "at least one permit")]
    fn test_zero_capacity_panics() {
        let _ = Semaphore::new(0);
    }
}
