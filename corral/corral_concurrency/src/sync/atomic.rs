//! A value box whose accesses are serialized through an injected lock.

use std::fmt;

use super::lock::{Mutex, Synchronized};

/// A value whose every read and write happens while holding `L`.
///
/// `get` and `set` are each atomic, but not jointly: a read followed by a
/// write can lose an update made in between. Use [`Atomic::update`] for a
/// read-modify-write, or hold [`Atomic::lock`] around several calls when `L`
/// is reentrant.
///
/// Closures passed to `update` must not access the same `Atomic` again.
pub struct Atomic<T, L = Mutex> {
    lock: L,
    value: parking_lot::Mutex<T>,
}

impl<T, L: Synchronized> Atomic<T, L> {
    /// Wrap `value`, serializing access through `lock`
    pub fn new(lock: L, value: T) -> Self {
        Self {
            lock,
            value: parking_lot::Mutex::new(value),
        }
    }

    /// Read a copy of the current value
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.lock.synchronized(|| self.value.lock().clone())
    }

    /// Overwrite the current value
    pub fn set(&self, value: T) {
        self.lock.synchronized(|| *self.value.lock() = value);
    }

    /// Overwrite the current value and return the previous one
    pub fn replace(&self, value: T) -> T {
        self.lock
            .synchronized(|| std::mem::replace(&mut *self.value.lock(), value))
    }

    /// Read and modify the value under a single acquisition of the lock
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.lock.synchronized(|| f(&mut self.value.lock()))
    }

    /// The injected lock, for scoping several operations together
    pub fn lock(&self) -> &L {
        &self.lock
    }

    /// Consume the box and return the value
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default, L: Synchronized + Default> Default for Atomic<T, L> {
    fn default() -> Self {
        Self::new(L::default(), T::default())
    }
}

impl<T: fmt::Debug, L: Synchronized> fmt::Debug for Atomic<T, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.lock
            .synchronized(|| f.debug_tuple("Atomic").field(&*self.value.lock()).finish())
    }
}
