use core::{
    marker::PhantomData,
    num::Wrapping,
    ops::Deref,
    panic::Location,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::warn;

use crate::per_cpu::context_id;

/// A spin lock that the owning execution context may acquire again while it
/// already holds it.
///
/// Because the same context can hold several guards at once, guards only hand
/// out shared references. Values that need to be mutated through the lock
/// must use interior mutability that is only sound under the lock.
pub struct RecursiveMutex<T> {
    /// The context id of the owner or 0 if the lock is free.
    owner: AtomicUsize,
    /// Number of guards held by the owner. Only touched by the owner.
    depth: AtomicUsize,
    value: T,
}

impl<T> RecursiveMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
            value,
        }
    }

    #[track_caller]
    pub fn lock(&self) -> RecursiveMutexGuard<'_, T> {
        let id = context_id();

        if self.owner.load(Ordering::Relaxed) == id {
            #[cfg(feature = "lock-debugging")]
            log::trace!("re-entering recursive lock at {}", Location::caller());

            self.depth.fetch_add(1, Ordering::Relaxed);
            return RecursiveMutexGuard {
                mutex: self,
                _not_send: PhantomData,
            };
        }

        let mut counter = Wrapping(0u32);
        while self
            .owner
            .compare_exchange_weak(0, id, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
            counter += 1;
            if counter.0 == 0 {
                warn!("recursive lock stalling at {}", Location::caller());
            }
        }

        let prev = self.depth.swap(1, Ordering::Relaxed);
        assert_eq!(prev, 0, "recursive lock acquired with stale depth");
        RecursiveMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    /// Returns whether the current execution context holds the lock.
    pub fn is_held_by_current_context(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == context_id()
    }

    /// Returns how many guards the owner currently holds.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

// SAFETY: Only one execution context at a time can observe the value.
unsafe impl<T> Sync for RecursiveMutex<T> where T: Send {}

/// Ownership is tied to the execution context, so guards can't be sent
/// elsewhere.
pub struct RecursiveMutexGuard<'a, T> {
    mutex: &'a RecursiveMutex<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for RecursiveMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.mutex.value
    }
}

impl<T> Drop for RecursiveMutexGuard<'_, T> {
    fn drop(&mut self) {
        let prev = self.mutex.depth.fetch_sub(1, Ordering::Relaxed);
        assert_ne!(prev, 0, "recursive lock released more often than acquired");
        if prev == 1 {
            self.mutex.owner.store(0, Ordering::Release);
        }
    }
}
