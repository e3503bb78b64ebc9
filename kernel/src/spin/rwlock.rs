use core::{
    cell::UnsafeCell,
    num::Wrapping,
    ops::{Deref, DerefMut},
    panic::Location,
    sync::atomic::{AtomicI64, Ordering},
};

use log::warn;

const RELOAD_LIMIT: i64 = i64::MIN / 2;

/// A spin lock based read-write lock.
pub struct RwLock<T> {
    cell: UnsafeCell<T>,
    ///  0 -> Unlocked
    /// \>0 -> Read-locked
    /// <0 -> Write-locked
    state: AtomicI64,
}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            cell: UnsafeCell::new(value),
            state: AtomicI64::new(0),
        }
    }

    /// Try to acquire a read guard without spinning.
    #[inline]
    pub fn try_read(&self) -> Option<ReadRwLockGuard<'_, T>> {
        // Optimistically register a reader. A writer parks `state` at a large
        // negative value, so the increment leaves it negative. Should it ever
        // creep up past `RELOAD_LIMIT`, it's reset to `i64::MIN`.
        let value = self.state.fetch_add(1, Ordering::Acquire);
        match value {
            0.. => Some(ReadRwLockGuard { lock: self }),
            ..=RELOAD_LIMIT => None,
            _ => {
                self.reload();
                None
            }
        }
    }

    #[inline(never)]
    #[cold]
    fn reload(&self) {
        let mut value = self.state.load(Ordering::Relaxed);
        while (RELOAD_LIMIT + 1..0).contains(&value) {
            match self.state.compare_exchange(
                value,
                i64::MIN,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(new_value) => value = new_value,
            }
        }
    }

    /// Acquire a read guard.
    #[inline]
    #[track_caller]
    pub fn read(&self) -> ReadRwLockGuard<'_, T> {
        if let Some(guard) = self.try_read() {
            return guard;
        }
        spin_until(|| self.try_read())
    }

    /// Try to acquire the write guard without spinning.
    #[inline]
    pub fn try_write(&self) -> Option<WriteRwLockGuard<'_, T>> {
        self.state
            .compare_exchange(0, i64::MIN, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| WriteRwLockGuard { lock: self })
    }

    /// Acquire the write guard.
    #[inline]
    #[track_caller]
    pub fn write(&self) -> WriteRwLockGuard<'_, T> {
        if let Some(guard) = self.try_write() {
            return guard;
        }
        spin_until(|| self.try_write())
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }
}

#[inline(never)]
#[cold]
#[track_caller]
fn spin_until<G>(mut f: impl FnMut() -> Option<G>) -> G {
    let mut counter = Wrapping(0u32);
    loop {
        core::hint::spin_loop();

        if let Some(guard) = f() {
            return guard;
        }
        counter += 1;
        if counter.0 == 0 {
            warn!("rwlock stalling at {}", Location::caller());
        }
    }
}

unsafe impl<T> Send for RwLock<T> where T: Send {}
unsafe impl<T> Sync for RwLock<T> where T: Send + Sync {}

pub struct ReadRwLockGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for ReadRwLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe {
            // SAFETY: Read guards only coexist with other read guards.
            &*self.lock.cell.get()
        }
    }
}

impl<T> Drop for ReadRwLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

pub struct WriteRwLockGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for WriteRwLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe {
            // SAFETY: The write guard is unique.
            &*self.lock.cell.get()
        }
    }
}

impl<T> DerefMut for WriteRwLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe {
            // SAFETY: The write guard is unique.
            &mut *self.lock.cell.get()
        }
    }
}

impl<T> Drop for WriteRwLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}
