//! Primitives for operations that block the calling thread.
//!
//! Blocking operations are expressed as futures. The scheduler polls them and
//! parks the thread while they are pending.

pub mod mutex;
pub mod notify;
pub mod oneshot;
