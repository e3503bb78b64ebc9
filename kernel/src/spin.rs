//! Synchronization primitives that spin until they reach the desired state.
//!
//! None of these may be held across an operation that blocks. Use
//! [`crate::rt::mutex::Mutex`] for state that is held while waiting on other
//! subsystems.

pub mod mutex;
pub mod once;
pub mod recursive;
pub mod rwlock;
