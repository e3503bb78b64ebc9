//! Security-critical values that are kept write-protected.
//!
//! A [`ProtectedData`] block spends almost all of its life write-protected.
//! Writers open a [`WriteWindow`] through
//! [`ProtectedData::with_mutable_protected_data`]. The protection is only
//! lifted when the first window opens and only reinstated when the last one
//! closes, so nested writers from the same execution context toggle it
//! exactly once.

use alloc::boxed::Box;
use core::{
    cell::UnsafeCell,
    fmt,
    ops::Range,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::spin::recursive::RecursiveMutex;

/// The mechanism that makes a protected block writable and read-only again.
///
/// On a kernel target this flips the write bit of the page holding the block.
pub trait PageProtection: Send + Sync {
    fn unprotect(&self);

    fn protect(&self);

    fn is_writable(&self) -> bool;
}

impl<P> PageProtection for Box<P>
where
    P: PageProtection + ?Sized,
{
    fn unprotect(&self) {
        (**self).unprotect();
    }

    fn protect(&self) {
        (**self).protect();
    }

    fn is_writable(&self) -> bool {
        (**self).is_writable()
    }
}

/// Tracks writability in software. Writes outside of a window panic.
pub struct SoftwareProtection {
    writable: AtomicBool,
}

impl SoftwareProtection {
    pub const fn new() -> Self {
        Self {
            writable: AtomicBool::new(false),
        }
    }
}

impl Default for SoftwareProtection {
    fn default() -> Self {
        Self::new()
    }
}

impl PageProtection for SoftwareProtection {
    fn unprotect(&self) {
        self.writable.store(true, Ordering::Release);
    }

    fn protect(&self) {
        self.writable.store(false, Ordering::Release);
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }
}

pub struct ProtectedData<T, P = SoftwareProtection> {
    value: RecursiveMutex<T>,
    /// The number of open write windows.
    writers: AtomicUsize,
    protection: P,
}

impl<T, P> ProtectedData<T, P>
where
    P: PageProtection,
{
    pub fn new(value: T, protection: P) -> Self {
        protection.protect();
        Self {
            value: RecursiveMutex::new(value),
            writers: AtomicUsize::new(0),
            protection,
        }
    }

    /// Call `f` with read access to the protected values.
    #[track_caller]
    pub fn with_protected_data<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.value.lock();
        f(&guard)
    }

    /// Call `f` with write access to the protected values.
    ///
    /// This may be nested. The window stays open until the outermost call
    /// returns, even if `f` unwinds.
    #[track_caller]
    pub fn with_mutable_protected_data<R>(&self, f: impl FnOnce(&T, &WriteWindow<'_>) -> R) -> R {
        let guard = self.value.lock();

        if self.writers.fetch_add(1, Ordering::AcqRel) == 0 {
            self.protection.unprotect();
        }

        let value: &T = &guard;
        let start = core::ptr::from_ref(value).addr();
        let window = WriteWindow {
            protection: &self.protection,
            writers: &self.writers,
            range: start..start + size_of::<T>(),
        };
        f(value, &window)
    }

    /// Returns whether a write window is currently open.
    pub fn is_writable(&self) -> bool {
        self.protection.is_writable()
    }
}

/// Proof that the protection of a block has been lifted.
///
/// Closing the window reinstates the protection if no other window is open.
pub struct WriteWindow<'a> {
    protection: &'a dyn PageProtection,
    writers: &'a AtomicUsize,
    range: Range<usize>,
}

impl WriteWindow<'_> {
    fn covers<T>(&self, cell: &ProtectedCell<T>) -> bool {
        let start = core::ptr::from_ref(cell).addr();
        self.range.contains(&start) && start + size_of::<ProtectedCell<T>>() <= self.range.end
    }
}

impl Drop for WriteWindow<'_> {
    fn drop(&mut self) {
        let prev = self.writers.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(prev, 0, "write window closed more often than opened");
        if prev == 1 {
            self.protection.protect();
        }
    }
}

/// A field of a protected block.
///
/// Values are only ever copied or cloned out, never borrowed, so a nested
/// writer can't invalidate a reference a reader is still holding.
pub struct ProtectedCell<T>(UnsafeCell<T>);

// SAFETY: Cells are only reachable through the callbacks of
// `ProtectedData`, which run while the block's lock is held by the current
// execution context. Cells are not `Sync`, so callbacks can't share them
// with other contexts.
unsafe impl<T> Send for ProtectedCell<T> where T: Send {}

impl<T> ProtectedCell<T> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Replace the value and return the old one.
    #[track_caller]
    pub fn replace(&self, window: &WriteWindow<'_>, value: T) -> T {
        assert!(
            window.covers(self),
            "write window belongs to a different block"
        );
        assert!(
            window.protection.is_writable(),
            "write to a write-protected block"
        );
        unsafe {
            // SAFETY: The window proves that the lock is held by this context
            // and no references into the cell exist.
            core::mem::replace(&mut *self.0.get(), value)
        }
    }

    #[track_caller]
    pub fn set(&self, window: &WriteWindow<'_>, value: T) {
        drop(self.replace(window, value));
    }
}

impl<T> ProtectedCell<T>
where
    T: Copy,
{
    pub fn get(&self) -> T {
        unsafe {
            // SAFETY: See `replace`.
            *self.0.get()
        }
    }

    #[track_caller]
    pub fn update(&self, window: &WriteWindow<'_>, f: impl FnOnce(T) -> T) -> T {
        let value = f(self.get());
        self.set(window, value);
        value
    }
}

impl<T> ProtectedCell<T>
where
    T: Clone,
{
    /// Clone the value out of the cell.
    pub fn cloned(&self) -> T {
        unsafe {
            // SAFETY: See `replace`. `Clone` implementations of the stored
            // types don't access the block.
            (*self.0.get()).clone()
        }
    }
}

impl<T> fmt::Debug for ProtectedCell<T>
where
    T: Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.cloned().fmt(f)
    }
}
