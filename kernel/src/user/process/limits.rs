//! Per-process resource limits.

use crate::error::{Result, ensure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RLimit {
    /// The limit that's enforced.
    pub soft: u64,
    /// The ceiling for the soft limit.
    pub hard: u64,
}

impl RLimit {
    pub const INFINITY: u64 = u64::MAX;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// One more than the highest file descriptor number.
    NoFile,
}

/// Copied into children on fork and kept across exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    no_file: RLimit,
}

impl Limits {
    pub const fn new() -> Self {
        Self {
            no_file: RLimit {
                soft: 1024,
                hard: 65536,
            },
        }
    }

    pub fn get(&self, resource: Resource) -> RLimit {
        match resource {
            Resource::NoFile => self.no_file,
        }
    }

    /// Replace the limit for `resource`.
    ///
    /// The soft limit can't exceed the hard limit. Raising the hard limit
    /// requires `privileged`.
    pub fn set(&mut self, resource: Resource, limit: RLimit, privileged: bool) -> Result<()> {
        ensure!(limit.soft <= limit.hard, Inval);
        let current = match resource {
            Resource::NoFile => &mut self.no_file,
        };
        ensure!(privileged || limit.hard <= current.hard, Perm);
        *current = limit;
        Ok(())
    }
}
