use core::{
    cell::UnsafeCell,
    num::Wrapping,
    ops::{Deref, DerefMut},
    panic::Location,
    sync::atomic::{AtomicBool, Ordering},
};

#[cfg(feature = "lock-debugging")]
use crossbeam_utils::atomic::AtomicCell;
use log::warn;

/// A spin lock based mutex to create unique references to shared values.
///
/// The critical sections guarded by this lock must be short and must never
/// block.
pub struct Mutex<T> {
    locked: AtomicBool,
    #[cfg(feature = "lock-debugging")]
    holder: AtomicCell<Option<&'static Location<'static>>>,
    cell: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            #[cfg(feature = "lock-debugging")]
            holder: AtomicCell::new(None),
            cell: UnsafeCell::new(value),
        }
    }

    /// Try to acquire the mutex without spinning.
    #[inline]
    #[track_caller]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;

        #[cfg(feature = "lock-debugging")]
        self.holder.store(Some(Location::caller()));

        Some(MutexGuard { mutex: self })
    }

    /// Acquire the mutex.
    #[inline]
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        if let Some(guard) = self.try_lock() {
            return guard;
        }
        self.lock_slow_path()
    }

    #[inline(never)]
    #[cold]
    #[track_caller]
    fn lock_slow_path(&self) -> MutexGuard<'_, T> {
        let mut counter = Wrapping(0u32);
        loop {
            core::hint::spin_loop();

            if let Some(guard) = self.try_lock() {
                return guard;
            }
            counter += 1;
            if counter.0 == 0 {
                self.report_stall(Location::caller());
            }
        }
    }

    #[cold]
    fn report_stall(&self, location: &'static Location<'static>) {
        #[cfg(feature = "lock-debugging")]
        if let Some(holder) = self.holder.load() {
            warn!("lock stalling at {location}, held by {holder}");
            return;
        }

        warn!("lock stalling at {location}");
    }

    /// Returns whether some context currently holds the mutex.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Get a mutable reference to the contained value.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }
}

unsafe impl<T> Send for Mutex<T> where T: Send {}
unsafe impl<T> Sync for Mutex<T> where T: Send {}

impl<T> Default for Mutex<T>
where
    T: Default,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe {
            // SAFETY: The existence of this guard implies that the mutex has
            // been acquired.
            &*self.mutex.cell.get()
        }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe {
            // SAFETY: The existence of this guard implies that the mutex has
            // been acquired.
            &mut *self.mutex.cell.get()
        }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        #[cfg(feature = "lock-debugging")]
        self.mutex.holder.store(None);

        self.mutex.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, vec::Vec};

    use super::Mutex;

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = Mutex::new(5);
        let guard = mutex.lock();
        assert!(mutex.is_locked());
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert_eq!(*mutex.try_lock().unwrap(), 5);
    }

    #[test]
    fn increments_from_many_threads_are_not_lost() {
        let counter = Arc::new(Mutex::new(0u32));
        let handles = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 4000);
    }
}
