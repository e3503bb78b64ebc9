//! Identification of the execution context that is currently running kernel
//! code.
//!
//! The recursive locks use this to recognize re-entry. On a kernel target the
//! architecture code installs a function returning the index of the current
//! CPU during boot. Host builds treat every thread as its own context.

use crate::spin::once::Once;

static CONTEXT_SOURCE: Once<fn() -> usize> = Once::new();

/// Install the function that returns the index of the current CPU.
///
/// Only the first call has an effect.
pub fn init(source: fn() -> usize) {
    CONTEXT_SOURCE.call_once(|| source);
}

/// Returns a non-zero identifier of the current execution context.
#[inline]
pub fn context_id() -> usize {
    #[cfg(any(test, feature = "std"))]
    {
        host_context_id()
    }

    #[cfg(not(any(test, feature = "std")))]
    {
        CONTEXT_SOURCE.get().map_or(1, |source| source() + 1)
    }
}

#[cfg(any(test, feature = "std"))]
fn host_context_id() -> usize {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

    std::thread_local! {
        static ID: usize = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    }

    ID.with(|id| *id)
}
