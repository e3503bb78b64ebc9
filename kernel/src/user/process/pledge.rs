//! Promises a process makes about the privileged operations it still needs.

use core::fmt::{self, Display};

use bitflags::bitflags;

use crate::error::{Result, bail, ensure};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Promises: u32 {
        const STDIO = 1 << 0;
        const RPATH = 1 << 1;
        const WPATH = 1 << 2;
        const CPATH = 1 << 3;
        const DPATH = 1 << 4;
        const INET = 1 << 5;
        const ID = 1 << 6;
        const PROC = 1 << 7;
        const PTRACE = 1 << 8;
        const EXEC = 1 << 9;
        const UNIX = 1 << 10;
        const RECVFD = 1 << 11;
        const SENDFD = 1 << 12;
        const FATTR = 1 << 13;
        const TTY = 1 << 14;
        const CHOWN = 1 << 15;
        const THREAD = 1 << 16;
        const VIDEO = 1 << 17;
        const ACCEPT = 1 << 18;
        const SETTIME = 1 << 19;
        const SIGACTION = 1 << 20;
        const SETKEYMAP = 1 << 21;
        const PROT_EXEC = 1 << 22;
        const MAP_FIXED = 1 << 23;
        const GETKEYMAP = 1 << 24;
        const JAIL = 1 << 25;
        const NO_ERROR = 1 << 26;
    }
}

const NAMES: [(&str, Promises); 27] = [
    ("stdio", Promises::STDIO),
    ("rpath", Promises::RPATH),
    ("wpath", Promises::WPATH),
    ("cpath", Promises::CPATH),
    ("dpath", Promises::DPATH),
    ("inet", Promises::INET),
    ("id", Promises::ID),
    ("proc", Promises::PROC),
    ("ptrace", Promises::PTRACE),
    ("exec", Promises::EXEC),
    ("unix", Promises::UNIX),
    ("recvfd", Promises::RECVFD),
    ("sendfd", Promises::SENDFD),
    ("fattr", Promises::FATTR),
    ("tty", Promises::TTY),
    ("chown", Promises::CHOWN),
    ("thread", Promises::THREAD),
    ("video", Promises::VIDEO),
    ("accept", Promises::ACCEPT),
    ("settime", Promises::SETTIME),
    ("sigaction", Promises::SIGACTION),
    ("setkeymap", Promises::SETKEYMAP),
    ("prot_exec", Promises::PROT_EXEC),
    ("map_fixed", Promises::MAP_FIXED),
    ("getkeymap", Promises::GETKEYMAP),
    ("jail", Promises::JAIL),
    ("no_error", Promises::NO_ERROR),
];

impl Promises {
    /// Parse a whitespace separated list of promise names.
    pub fn parse(names: &[u8]) -> Result<Self> {
        let mut promises = Self::empty();
        for name in names.split(u8::is_ascii_whitespace).filter(|n| !n.is_empty()) {
            let Some((_, promise)) = NAMES.iter().find(|(n, _)| n.as_bytes() == name) else {
                bail!(Inval);
            };
            promises |= *promise;
        }
        Ok(promises)
    }
}

impl Display for Promises {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = NAMES
            .iter()
            .filter(|(_, promise)| self.contains(*promise))
            .map(|(name, _)| name);
        if let Some(name) = names.next() {
            write!(f, "{name}")?;
            for name in names {
                write!(f, " {name}")?;
            }
        }
        Ok(())
    }
}

/// The promises of the running program and of the next one.
///
/// `None` means that the process never pledged and is unrestricted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PledgeState {
    promises: Option<Promises>,
    exec_promises: Option<Promises>,
}

impl PledgeState {
    pub const fn unrestricted() -> Self {
        Self {
            promises: None,
            exec_promises: None,
        }
    }

    pub fn promises(&self) -> Option<Promises> {
        self.promises
    }

    pub fn exec_promises(&self) -> Option<Promises> {
        self.exec_promises
    }

    pub fn has_promises(&self) -> bool {
        self.promises.is_some()
    }

    /// Returns the state after a pledge. `None` leaves a set unchanged.
    ///
    /// Once a set was pledged, it can only ever shrink. Both sets are
    /// validated before either is applied.
    pub fn pledge(&self, promises: Option<Promises>, exec_promises: Option<Promises>) -> Result<Self> {
        if let Some((current, new)) = self.promises.zip(promises) {
            ensure!(current.contains(new), Perm);
        }
        if let Some((current, new)) = self.exec_promises.zip(exec_promises) {
            ensure!(current.contains(new), Perm);
        }

        Ok(Self {
            promises: promises.or(self.promises),
            exec_promises: exec_promises.or(self.exec_promises),
        })
    }

    /// Succeeds if the process never pledged or kept all of `promise`.
    pub fn check(&self, promise: Promises) -> Result<()> {
        if let Some(promises) = self.promises {
            ensure!(promises.contains(promise), Perm);
        }
        Ok(())
    }

    /// The state of the next program image. Processes that didn't pledge
    /// exec promises start the new image unrestricted.
    pub fn after_exec(&self) -> Self {
        Self {
            promises: self.exec_promises,
            exec_promises: None,
        }
    }
}
