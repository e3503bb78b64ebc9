use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    num::Wrapping,
    panic::Location,
    sync::atomic::{AtomicU8, Ordering},
};

use log::warn;

const EMPTY: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETE: u8 = 2;

/// A value that is set exactly once, e.g. a hook installed during boot.
pub struct Once<T> {
    state: AtomicU8,
    cell: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Once<T> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            cell: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Returns the value, running `init` first if nobody did yet.
    ///
    /// Concurrent callers spin until the value is stored.
    #[track_caller]
    pub fn call_once(&self, init: impl FnOnce() -> T) -> &T {
        if self
            .state
            .compare_exchange(EMPTY, RUNNING, Ordering::Acquire, Ordering::Acquire)
            .is_ok()
        {
            // SAFETY: Only the caller that moved the state to `RUNNING` writes
            // the cell.
            unsafe { (*self.cell.get()).write(init()) };
            self.state.store(COMPLETE, Ordering::Release);
        }

        let mut counter = Wrapping(0u32);
        loop {
            if let Some(value) = self.get() {
                return value;
            }
            counter += 1;
            if counter.0 == 0 {
                warn!("once stalling at {}", Location::caller());
            }
            core::hint::spin_loop();
        }
    }

    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) != COMPLETE {
            return None;
        }
        // SAFETY: The value is never written again once it's complete.
        Some(unsafe { (*self.cell.get()).assume_init_ref() })
    }
}

impl<T> Drop for Once<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == COMPLETE {
            // SAFETY: The value was initialized and nobody can observe it
            // anymore.
            unsafe { self.cell.get_mut().assume_init_drop() }
        }
    }
}

// SAFETY: The value is only written once and shared afterwards.
unsafe impl<T> Send for Once<T> where T: Send {}
unsafe impl<T> Sync for Once<T> where T: Send + Sync {}
