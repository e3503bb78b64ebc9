use core::{convert::Infallible, fmt, num::TryFromIntError, panic::Location};

use x86_64::addr::VirtAddrNotValid;

#[derive(Clone, Copy)]
pub struct Error {
    kind: ErrorKind,
    caller_location: &'static Location<'static>,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The value returned to userspace at the syscall boundary.
    pub fn errno(&self) -> i64 {
        -(self.kind as i64)
    }

    #[track_caller]
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            caller_location: Location::caller(),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} at {}", self.kind, self.caller_location)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (errno {})", self.kind, self.kind as i64)
    }
}

impl PartialEq<ErrorKind> for Error {
    fn eq(&self, other: &ErrorKind) -> bool {
        self.kind == *other
    }
}

macro_rules! errors {
    (
        $($variant:ident $expr:expr,)*
    ) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum ErrorKind {
            $($variant = $expr,)*
        }
    };
}

errors! {
    Perm 1,
    NoEnt 2,
    Srch 3,
    Intr 4,
    NoExec 8,
    BadF 9,
    Child 10,
    Again 11,
    NoMem 12,
    Acces 13,
    Fault 14,
    Exist 17,
    NotDir 20,
    IsDir 21,
    Inval 22,
    Mfile 24,
    Deadlk 35,
    NameTooLong 36,
    NoSys 38,
    Loop 40,
    TimedOut 110,
}

/// Create an [`Error`] of the given kind, recording the caller's location.
macro_rules! err {
    ($kind:ident) => {
        $crate::error::Error::from_kind($crate::error::ErrorKind::$kind)
    };
}

/// Return early with an [`Error`] of the given kind.
macro_rules! bail {
    ($kind:ident) => {
        return Err($crate::error::err!($kind))
    };
}

/// Return early with an [`Error`] of the given kind if the condition doesn't
/// hold.
macro_rules! ensure {
    ($cond:expr, $kind:ident) => {
        if !$cond {
            $crate::error::bail!($kind);
        }
    };
}

pub(crate) use {bail, ensure, err};

impl From<TryFromIntError> for Error {
    #[track_caller]
    fn from(_: TryFromIntError) -> Self {
        err!(Inval)
    }
}

impl From<Infallible> for Error {
    fn from(err: Infallible) -> Self {
        match err {}
    }
}

impl From<VirtAddrNotValid> for Error {
    #[track_caller]
    fn from(_: VirtAddrNotValid) -> Self {
        err!(Fault)
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
