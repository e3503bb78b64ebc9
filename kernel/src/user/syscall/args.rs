use core::fmt::{self, Display};

use crate::error::{Result, bail, ensure, err};

/// A value that can be parsed from a raw syscall argument.
pub trait SyscallArg: Send + Copy {
    fn parse(value: u64) -> Result<Self>;
}

macro_rules! bitflags {
    (pub struct $strukt:ident {
        $(
            $(#[$inner:ident $($args:tt)*])*
            const $constant:ident = $expr:expr;
        )*
    }) => {
        bitflags::bitflags! {
            #[derive(Debug, Clone, Copy, PartialEq, Eq)]
            pub struct $strukt: u64 {
                $(
                    $(#[$inner $($args)*])*
                    const $constant = $expr;
                )*
            }
        }

        impl Display for $strukt {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{self:?}")
            }
        }

        impl SyscallArg for $strukt {
            fn parse(value: u64) -> Result<Self> {
                Self::from_bits(value).ok_or(err!(Inval))
            }
        }
    };
}

macro_rules! enum_arg {
    (pub enum $enuhm:ident {
        $(
            $variant:ident = $expr:expr,
        )*
    }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $enuhm {
            $(
                $variant = $expr,
            )*
        }

        impl Display for $enuhm {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{self:?}")
            }
        }

        impl SyscallArg for $enuhm {
            fn parse(value: u64) -> Result<Self> {
                match value {
                    $(
                        value if value == Self::$variant as u64 => Ok(Self::$variant),
                    )*
                    _ => bail!(Inval),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FdNum(i32);

impl FdNum {
    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i32 {
        self.0
    }
}

impl Display for FdNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl SyscallArg for FdNum {
    fn parse(value: u64) -> Result<Self> {
        let value = value as u32 as i32;
        ensure!(value >= 0, BadF);
        Ok(Self(value))
    }
}

bitflags! {
    pub struct OpenFlags {
        const WRONLY = 1 << 0;
        const RDWR = 1 << 1;
        const CREAT = 1 << 6;
        const EXCL = 1 << 7;
        const NOCTTY = 1 << 8;
        const TRUNC = 1 << 9;
        const APPEND = 1 << 10;
        const NONBLOCK = 1 << 11;
        const DIRECTORY = 1 << 16;
        const NOFOLLOW = 1 << 17;
        const CLOEXEC = 1 << 19;
    }
}

impl OpenFlags {
    pub fn is_readable(&self) -> bool {
        !self.contains(Self::WRONLY)
    }

    pub fn is_writable(&self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

bitflags! {
    pub struct FdFlags {
        const CLOEXEC = 1;
    }
}

impl From<OpenFlags> for FdFlags {
    fn from(value: OpenFlags) -> Self {
        let mut flags = Self::empty();
        flags.set(Self::CLOEXEC, value.contains(OpenFlags::CLOEXEC));
        flags
    }
}

bitflags! {
    pub struct FileMode {
        const ALL = 0o777;
        const ALL_READ_WRITE = 0o666;

        const OTHER_EXECUTE = 0o001;
        const OTHER_WRITE = 0o002;
        const OTHER_READ = 0o004;
        const GROUP_EXECUTE = 0o010;
        const GROUP_WRITE = 0o020;
        const GROUP_READ = 0o040;
        const OWNER_EXECUTE = 0o100;
        const OWNER_WRITE = 0o200;
        const OWNER_READ = 0o400;
        const OWNER_ALL = 0o700;
        const STICKY = 0o1000;
        const SET_GROUP_ID = 0o2000;
        const SET_USER_ID = 0o4000;
    }
}

impl FileMode {
    pub fn is_executable(&self) -> bool {
        self.intersects(Self::OWNER_EXECUTE | Self::GROUP_EXECUTE | Self::OTHER_EXECUTE)
    }
}

enum_arg! {
    pub enum FcntlCmd {
        DupFd = 0,
        GetFd = 1,
        SetFd = 2,
        GetFl = 3,
        DupFdCloExec = 1030,
    }
}

enum_arg! {
    pub enum FutexOp {
        Wait = 0,
        Wake = 1,
        WaitBitset = 9,
        WakeBitset = 10,
    }
}

bitflags! {
    pub struct FutexFlags {
        const PRIVATE_FLAG = 1 << 7;
        const CLOCK_REALTIME = 1 << 8;
    }
}

#[derive(Clone, Copy)]
pub struct FutexOpWithFlags {
    pub op: FutexOp,
    pub flags: FutexFlags,
}

impl Display for FutexOpWithFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {}", self.op, self.flags)
    }
}

impl SyscallArg for FutexOpWithFlags {
    fn parse(value: u64) -> Result<Self> {
        let op = FutexOp::parse(value & 0x7f)?;
        let flags = FutexFlags::parse(value & !0x7f)?;
        Ok(Self { op, flags })
    }
}

bitflags! {
    pub struct WaitOptions {
        const NOHANG = 1 << 0;
        const EXITED = 1 << 2;
    }
}

enum_arg! {
    pub enum IdType {
        All = 0,
        Pid = 1,
        Pgid = 2,
    }
}

bitflags! {
    pub struct UnveilFlags {
        const CURRENT_PROGRAM = 1 << 0;
        const AFTER_EXEC = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Signal(u8);

impl Signal {
    pub const HUP: Self = Self(1);
    pub const INT: Self = Self(2);
    pub const QUIT: Self = Self(3);
    pub const ILL: Self = Self(4);
    pub const TRAP: Self = Self(5);
    pub const ABRT: Self = Self(6);
    pub const BUS: Self = Self(7);
    pub const FPE: Self = Self(8);
    pub const KILL: Self = Self(9);
    pub const USR1: Self = Self(10);
    pub const SEGV: Self = Self(11);
    pub const USR2: Self = Self(12);
    pub const PIPE: Self = Self(13);
    pub const ALRM: Self = Self(14);
    pub const TERM: Self = Self(15);
    pub const CHLD: Self = Self(17);
    pub const CONT: Self = Self(18);
    pub const STOP: Self = Self(19);
    pub const TSTP: Self = Self(20);
    pub const TTIN: Self = Self(21);
    pub const TTOU: Self = Self(22);
    pub const URG: Self = Self(23);
    pub const XCPU: Self = Self(24);
    pub const XFSZ: Self = Self(25);
    pub const WINCH: Self = Self(28);
    pub const SYS: Self = Self(31);

    pub fn new(value: u8) -> Result<Self> {
        ensure!((1..=64).contains(&value), Inval);
        Ok(Self(value))
    }

    pub const fn get(&self) -> usize {
        self.0 as usize
    }

    /// What happens when the signal is delivered while its action is the
    /// default.
    pub fn default_action(&self) -> DefaultAction {
        match *self {
            Self::QUIT
            | Self::ILL
            | Self::TRAP
            | Self::ABRT
            | Self::BUS
            | Self::FPE
            | Self::SEGV
            | Self::XCPU
            | Self::XFSZ
            | Self::SYS => DefaultAction::DumpCore,
            Self::CHLD | Self::URG | Self::WINCH => DefaultAction::Ignore,
            Self::STOP | Self::TSTP | Self::TTIN | Self::TTOU => DefaultAction::Stop,
            Self::CONT => DefaultAction::Continue,
            _ => DefaultAction::Terminate,
        }
    }
}

impl Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", self.0)
    }
}

impl SyscallArg for Signal {
    fn parse(value: u64) -> Result<Self> {
        let value = u8::try_from(value)?;
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    DumpCore,
    Ignore,
    Stop,
    Continue,
}
