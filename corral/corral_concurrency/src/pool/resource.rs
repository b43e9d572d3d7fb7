//! Bounded pooling for expensive resources like connections, decoders, buffers.
//!
//! Resources are created lazily: a pool that is never used by more than one
//! thread at a time creates exactly one resource. At most `capacity`
//! resources are ever created and at most `capacity` are checked out at once.
//!
//! Only checkout and checkin are synchronized. The pool does not guard the
//! resource itself, so callers must not keep using a resource after checking
//! it back in.

use log::{debug, info, trace, warn};
use std::convert::Infallible;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::sync::{Atomic, Mutex, MutexKind, Permit, Semaphore, Synchronized};

/// Error returned when a resource cannot be checked out of the pool
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResourcePoolError<E> {
    /// No permit became available within the timeout
    #[error("timed out after {0:?} waiting for a resource")]
    Timeout(Duration),

    /// Every resource is checked out and the caller asked not to wait
    #[error("resource pool exhausted")]
    Exhausted,

    /// The provider failed to create a new resource
    #[error("failed to create resource: {0}")]
    Provider(E),
}

/// Configuration for a resource pool
#[derive(Debug, Clone)]
pub struct ResourcePoolConfig {
    /// Maximum number of resources the pool will create and lend out at once
    pub capacity: usize,

    /// Name used in log output
    pub name: Option<String>,
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self {
            capacity: num_cpus::get(),
            name: None,
        }
    }
}

/// Point-in-time view of one pool slot
#[derive(Debug, Clone)]
pub struct SlotStatus {
    /// Whether the slot's resource is waiting in the pool
    pub available: bool,

    /// How many times the resource has been checked out
    pub checkouts: u64,

    /// When the resource was created
    pub created_at: Instant,

    /// When the resource was last checked out
    pub last_checkout: Instant,
}

struct Slot<R> {
    /// Present while the slot is available
    resource: Option<R>,
    available: bool,
    checkouts: u64,
    created_at: Instant,
    last_checkout: Instant,
}

impl<R> Slot<R> {
    /// A freshly created slot, already checked out by its creator
    fn checked_out() -> Self {
        let now = Instant::now();
        Self {
            resource: None,
            available: false,
            checkouts: 1,
            created_at: now,
            last_checkout: now,
        }
    }

    fn check_out(&mut self) -> Option<R> {
        let resource = self.resource.take()?;
        self.available = false;
        self.checkouts += 1;
        self.last_checkout = Instant::now();
        Some(resource)
    }

    fn check_in(&mut self, resource: R) {
        self.resource = Some(resource);
        self.available = true;
    }

    fn status(&self) -> SlotStatus {
        SlotStatus {
            available: self.available,
            checkouts: self.checkouts,
            created_at: self.created_at,
            last_checkout: self.last_checkout,
        }
    }
}

type Provider<R, E> = Box<dyn Fn() -> Result<R, E> + Send + Sync>;

/// A bounded pool of lazily created, reusable resources
pub struct ResourcePool<R, E = Infallible, L = Mutex> {
    /// Creates resources on demand, called while holding the pool lock
    provider: Provider<R, E>,

    /// Created resources, scanned in order for an available one
    slots: Atomic<Vec<Slot<R>>, L>,

    /// Bounds outstanding checkouts to `capacity`
    admission: Semaphore,

    capacity: usize,

    name: String,
}

/// A checked-out resource that returns to its pool when dropped
pub struct ResourceHandle<'a, R, E = Infallible, L: Synchronized = Mutex> {
    resource: Option<R>,
    slot: usize,
    pool: &'a ResourcePool<R, E, L>,
    acquired_at: Instant,

    /// Released after the resource is marked available again
    _permit: Permit<'a>,
}

impl<R> ResourcePool<R> {
    /// Create a pool of `capacity` resources built by an infallible provider.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new<F>(capacity: usize, provider: F) -> Self
    where
        F: Fn() -> R + Send + Sync + 'static,
    {
        Self::with_config(
            ResourcePoolConfig {
                capacity,
                name: None,
            },
            move || Ok(provider()),
        )
    }
}

impl<R, E> ResourcePool<R, E> {
    /// Create a pool of `capacity` resources built by a fallible provider.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn try_new<F>(capacity: usize, provider: F) -> Self
    where
        F: Fn() -> Result<R, E> + Send + Sync + 'static,
    {
        Self::with_config(
            ResourcePoolConfig {
                capacity,
                name: None,
            },
            provider,
        )
    }

    /// Create a pool from a configuration, guarded by its own mutex
    pub fn with_config<F>(config: ResourcePoolConfig, provider: F) -> Self
    where
        F: Fn() -> Result<R, E> + Send + Sync + 'static,
    {
        let lock = match &config.name {
            Some(name) => Mutex::with_name(MutexKind::Normal, name.clone()),
            None => Mutex::normal(),
        };
        Self::with_lock(config, lock, provider)
    }
}

impl<R, E, L: Synchronized> ResourcePool<R, E, L> {
    /// Create a pool whose bookkeeping is serialized through `lock`.
    ///
    /// # Panics
    ///
    /// Panics if `config.capacity` is zero.
    pub fn with_lock<F>(config: ResourcePoolConfig, lock: L, provider: F) -> Self
    where
        F: Fn() -> Result<R, E> + Send + Sync + 'static,
    {
        assert!(
            config.capacity > 0,
            "A resource pool needs a capacity of at least one"
        );

        let name = config
            .name
            .unwrap_or_else(|| std::any::type_name::<R>().to_string());

        info!(
            "Creating resource pool {} with capacity {}",
            name, config.capacity
        );

        Self {
            provider: Box::new(provider),
            slots: Atomic::new(lock, Vec::with_capacity(config.capacity)),
            admission: Semaphore::new(config.capacity),
            capacity: config.capacity,
            name,
        }
    }

    /// Check out a resource, blocking until one is available.
    ///
    /// Fails only if a new resource had to be created and the provider failed.
    pub fn checkout(&self) -> Result<ResourceHandle<'_, R, E, L>, ResourcePoolError<E>> {
        self.acquire().map_err(ResourcePoolError::Provider)
    }

    /// Check out a resource, waiting at most `timeout` for one to free up
    pub fn checkout_timeout(
        &self,
        timeout: Duration,
    ) -> Result<ResourceHandle<'_, R, E, L>, ResourcePoolError<E>> {
        let permit = self.admission.acquire_timeout(timeout).ok_or_else(|| {
            warn!(
                "Resource pool {}: no resource available within {:.2}ms",
                self.name,
                timeout.as_secs_f64() * 1000.0
            );
            ResourcePoolError::Timeout(timeout)
        })?;

        self.claim(permit).map_err(ResourcePoolError::Provider)
    }

    /// Check out a resource only if one can be had without waiting
    pub fn try_checkout(&self) -> Result<ResourceHandle<'_, R, E, L>, ResourcePoolError<E>> {
        let permit = self
            .admission
            .try_acquire()
            .ok_or(ResourcePoolError::Exhausted)?;

        self.claim(permit).map_err(ResourcePoolError::Provider)
    }

    /// Run `f` with a checked-out resource, returning it to the pool afterwards
    pub fn try_with_resource<T>(
        &self,
        f: impl FnOnce(&mut R) -> T,
    ) -> Result<T, ResourcePoolError<E>> {
        let mut handle = self.checkout()?;
        Ok(f(&mut handle))
    }

    /// Like [`ResourcePool::try_with_resource`], giving up after `timeout`
    pub fn with_resource_timeout<T>(
        &self,
        timeout: Duration,
        f: impl FnOnce(&mut R) -> T,
    ) -> Result<T, ResourcePoolError<E>> {
        let mut handle = self.checkout_timeout(timeout)?;
        Ok(f(&mut handle))
    }

    /// Maximum number of resources
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Name used in log output
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of resources created so far
    pub fn created_count(&self) -> usize {
        self.slots.update(|slots| slots.len())
    }

    /// Number of created resources waiting in the pool
    pub fn available_count(&self) -> usize {
        self.slots
            .update(|slots| slots.iter().filter(|slot| slot.available).count())
    }

    /// Number of resources currently lent out
    pub fn checked_out_count(&self) -> usize {
        self.slots
            .update(|slots| slots.iter().filter(|slot| !slot.available).count())
    }

    /// Snapshot of every created slot, in creation order
    pub fn slots(&self) -> Vec<SlotStatus> {
        self.slots
            .update(|slots| slots.iter().map(Slot::status).collect())
    }

    fn acquire(&self) -> Result<ResourceHandle<'_, R, E, L>, E> {
        let permit = self.admission.acquire();
        self.claim(permit)
    }

    /// Hand out an available resource, creating one if none is free.
    ///
    /// Holding a permit guarantees either a free slot or room for a new one.
    fn claim<'a>(&'a self, permit: Permit<'a>) -> Result<ResourceHandle<'a, R, E, L>, E> {
        let claimed = self.slots.update(|slots| -> Result<(usize, R), E> {
            if let Some((index, resource)) = slots
                .iter_mut()
                .enumerate()
                .find_map(|(index, slot)| slot.check_out().map(|resource| (index, resource)))
            {
                trace!("Resource pool {}: reusing slot {}", self.name, index);
                return Ok((index, resource));
            }

            debug_assert!(slots.len() < self.capacity);

            let resource = (self.provider)()?;
            slots.push(Slot::checked_out());
            debug!(
                "Resource pool {}: created resource {} of {}",
                self.name,
                slots.len(),
                self.capacity
            );

            Ok((slots.len() - 1, resource))
        });

        match claimed {
            Ok((slot, resource)) => Ok(ResourceHandle {
                resource: Some(resource),
                slot,
                pool: self,
                acquired_at: Instant::now(),
                _permit: permit,
            }),
            Err(e) => {
                drop(permit);
                warn!("Resource pool {}: provider failed", self.name);
                Err(e)
            }
        }
    }

    fn checkin(&self, slot: usize, resource: R) {
        self.slots.update(|slots| slots[slot].check_in(resource));
        trace!("Resource pool {}: slot {} checked in", self.name, slot);
    }
}

impl<R, L: Synchronized> ResourcePool<R, Infallible, L> {
    /// Run `f` with a checked-out resource, blocking until one is available.
    ///
    /// The resource goes back to the pool on every exit path, including
    /// unwinding out of `f`.
    pub fn with_resource<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        let mut handle = match self.acquire() {
            Ok(handle) => handle,
            Err(never) => match never {},
        };
        f(&mut handle)
    }
}

impl<R, E, L: Synchronized> fmt::Debug for ResourcePool<R, E, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("created", &self.created_count())
            .field("available", &self.available_count())
            .finish()
    }
}

impl<R, E, L: Synchronized> ResourceHandle<'_, R, E, L> {
    /// Index of the pool slot this resource lives in
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Get the time since this resource was checked out
    pub fn held_duration(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Return the resource to the pool
    pub fn checkin(self) {
        drop(self);
    }
}

impl<R, E, L: Synchronized> Deref for ResourceHandle<'_, R, E, L> {
    type Target = R;

    fn deref(&self) -> &R {
        self.resource.as_ref().expect("Resource missing")
    }
}

impl<R, E, L: Synchronized> DerefMut for ResourceHandle<'_, R, E, L> {
    fn deref_mut(&mut self) -> &mut R {
        self.resource.as_mut().expect("Resource missing")
    }
}

impl<R, E, L: Synchronized> Drop for ResourceHandle<'_, R, E, L> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.checkin(self.slot, resource);
        }
    }
}

impl<R: fmt::Debug, E, L: Synchronized> fmt::Debug for ResourceHandle<'_, R, E, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("slot", &self.slot)
            .field("resource", &self.resource)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn counting_pool(capacity: usize) -> (ResourcePool<usize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = ResourcePool::new(capacity, move || counter.fetch_add(1, Ordering::SeqCst));
        (pool, created)
    }

    #[test]
    fn test_resource_pool_basic() {
        let (pool, created) = counting_pool(2);
        assert_eq!(pool.created_count(), 0);

        let first = pool.checkout().unwrap();
        assert_eq!(*first, 0);
        assert_eq!(pool.checked_out_count(), 1);

        first.checkin();
        assert_eq!(pool.available_count(), 1);

        // Sequential use keeps reusing the first resource
        for _ in 0..10 {
            assert_eq!(pool.with_resource(|id| *id), 0);
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resource_pool_growth() {
        let (pool, _) = counting_pool(3);

        let handle1 = pool.checkout().unwrap();
        let handle2 = pool.checkout().unwrap();
        let handle3 = pool.checkout().unwrap();
        assert_eq!(pool.created_count(), 3);

        let result = pool.try_checkout();
        assert!(matches!(result, Err(ResourcePoolError::Exhausted)));

        drop(handle2);

        let handle4 = pool.try_checkout().unwrap();
        assert_eq!(handle4.slot(), 1);
        assert_eq!(pool.created_count(), 3);

        drop(handle1);
        drop(handle3);
        drop(handle4);
        assert_eq!(pool.available_count(), 3);
    }

    #[test]
    fn test_linear_scan_prefers_lowest_slot() {
        let (pool, _) = counting_pool(3);

        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        let c = pool.checkout().unwrap();
        drop(c);
        drop(a);
        drop(b);

        let next = pool.checkout().unwrap();
        assert_eq!(next.slot(), 0);
        assert_eq!(pool.slots()[0].checkouts, 2);
    }

    #[test]
    fn test_checkout_timeout() {
        let (pool, _) = counting_pool(1);
        let _held = pool.checkout().unwrap();

        let result = pool.checkout_timeout(Duration::from_millis(20));
        assert_eq!(
            result.err(),
            Some(ResourcePoolError::Timeout(Duration::from_millis(20)))
        );
    }

    #[test]
    fn test_checkout_timeout_succeeds_after_release() {
        let (pool, _) = counting_pool(1);

        thread::scope(|s| {
            let held = pool.checkout().unwrap();
            s.spawn(move || {
                thread::sleep(Duration::from_millis(20));
                drop(held);
            });

            let value = pool
                .with_resource_timeout(Duration::from_secs(2), |id| *id)
                .unwrap();
            assert_eq!(value, 0);
        });
    }

    #[test]
    fn test_timed_checkout_beyond_instant_range() {
        let (pool, _) = counting_pool(1);

        assert_eq!(pool.with_resource_timeout(Duration::MAX, |id| *id), Ok(0));

        let handle = pool.checkout_timeout(Duration::MAX).unwrap();
        assert_eq!(*handle, 0);

        thread::scope(|s| {
            s.spawn(move || {
                thread::sleep(Duration::from_millis(20));
                drop(handle);
            });

            let value = pool.checkout_timeout(Duration::MAX).map(|handle| *handle);
            assert_eq!(value, Ok(0));
        });
    }

    #[test]
    fn test_provider_failure_releases_permit() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let pool = ResourcePool::try_new(1, move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("connection refused")
            } else {
                Ok(42)
            }
        });

        let first = pool.checkout();
        assert!(matches!(first, Err(ResourcePoolError::Provider("connection refused"))));
        assert_eq!(pool.created_count(), 0);

        // The failed attempt must not have consumed the only permit
        let value = pool
            .with_resource_timeout(Duration::from_millis(100), |value| *value)
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.created_count(), 1);
    }

    #[test]
    fn test_with_resource_releases_on_error_and_panic() {
        let (pool, _) = counting_pool(1);

        let result: Result<(), String> = pool.with_resource(|_| Err("failed".to_string()));
        assert!(result.is_err());
        assert_eq!(pool.available_count(), 1);

        let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.with_resource(|_| -> () { panic!("use failed") })
        }));
        assert!(unwound.is_err());

        assert!(pool.try_checkout().is_ok());
    }

    #[test]
    fn test_resources_are_mutable_and_recycled() {
        let pool = ResourcePool::new(1, Vec::<u8>::new);

        pool.with_resource(|buffer| buffer.push(1));
        pool.with_resource(|buffer| buffer.push(2));

        assert_eq!(pool.with_resource(|buffer| buffer.clone()), vec![1, 2]);
    }

    #[test]
    fn test_custom_lock_and_name() {
        let config = ResourcePoolConfig {
            capacity: 2,
            name: Some("decoders".to_string()),
        };
        let pool: ResourcePool<u32, Infallible, _> =
            ResourcePool::with_lock(config, Mutex::recursive(), || Ok(7));

        assert_eq!(pool.name(), "decoders");
        assert_eq!(pool.with_resource(|value| *value), 7);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    #[should_panic(expected = "capacity of at least one")]
    fn test_zero_capacity_panics() {
        let _ = ResourcePool::new(0, || ());
    }
}
