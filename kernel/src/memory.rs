//! Kernel memory that needs special treatment.

pub mod protected;
