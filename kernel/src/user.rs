//! Processes, threads and everything they own.

pub mod futex;
pub mod memory;
pub mod process;
pub mod registry;
pub mod syscall;
pub mod thread;
