//! Process lifecycle and sandboxing.
//!
//! The crate owns processes and threads, their pledges and filesystem veils,
//! file descriptor tables, futex keys and the write-protected storage for
//! security-sensitive process state. Filesystems, program loading and page
//! protection are provided by the embedder through traits.

#![no_std]
#![forbid(unsafe_op_in_unsafe_fn)]

extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod error;
pub mod fs;
pub mod limited_index;
pub mod logging;
pub mod memory;
pub mod per_cpu;
pub mod rt;
pub mod spin;
#[cfg(test)]
mod testing;
pub mod user;
