use core::{
    num::Wrapping,
    ops::{Deref, DerefMut},
    panic::Location,
};

use log::warn;

use crate::spin::mutex::{Mutex as SpinMutex, MutexGuard as SpinMutexGuard};

/// A mutex whose holder may block while holding it.
///
/// Contending callers give up their time slice instead of burning it. This
/// lock must never be acquired while a spin lock is held.
pub struct Mutex<T> {
    inner: SpinMutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinMutex::new(value),
        }
    }

    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let mut counter = Wrapping(0u32);
        loop {
            if let Some(guard) = self.inner.try_lock() {
                return MutexGuard { guard };
            }

            yield_now();

            counter += 1;
            if counter.0 & 0xffff == 0 {
                warn!("blocking mutex contended at {}", Location::caller());
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct MutexGuard<'a, T> {
    guard: SpinMutexGuard<'a, T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

fn yield_now() {
    #[cfg(any(test, feature = "std"))]
    std::thread::yield_now();

    #[cfg(not(any(test, feature = "std")))]
    core::hint::spin_loop();
}
