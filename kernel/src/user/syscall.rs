//! Syscall-shaped entry points.
//!
//! Every entry point takes the calling thread and raw register values.
//! Strings and string arrays have already been copied in from userspace by
//! the caller. Structs that live in user memory are read and written through
//! the address space of the calling process.

use core::{num::NonZeroU32, ops::Range, pin::pin};

use alloc::{sync::Arc, vec::Vec};
use bytemuck::{Pod, Zeroable, bytes_of, bytes_of_mut};
use futures::future::{Either, select};
use log::{debug, trace};
use x86_64::VirtAddr;

use crate::{
    error::{ErrorKind, Result, bail, ensure, err},
    fs::{
        path::Path,
        unveil::{UnveilAccess, UnveilTarget},
    },
    user::{
        process::{
            exec::ProgramLoader,
            pledge::Promises,
            wait::{ExitStatus, WaitFilter},
        },
        registry::ProcessRegistry,
        thread::{BlockReason, SigHandler, Sigaction, SigactionFlags, Sigset, Thread},
    },
};

use self::args::{
    FcntlCmd, FdFlags, FdNum, FileMode, FutexOp, FutexOpWithFlags, IdType, OpenFlags, Signal,
    SyscallArg, UnveilFlags, WaitOptions,
};

pub mod args;

pub type SyscallResult = Result<u64>;

/// Convert the result of a syscall into the value returned to userspace.
pub fn syscall_return(result: SyscallResult) -> i64 {
    match result {
        Ok(value) => value as i64,
        Err(err) => {
            trace!("syscall failed: {err:?}");
            err.errno()
        }
    }
}

fn read_struct<T: Pod>(thread: &Thread, addr: u64) -> Result<T> {
    let mut value = T::zeroed();
    thread
        .process()
        .memory()?
        .read_bytes(addr, bytes_of_mut(&mut value))?;
    Ok(value)
}

fn write_struct<T: Pod>(thread: &Thread, addr: u64, value: &T) -> Result<()> {
    thread.process().memory()?.write_bytes(addr, bytes_of(value))
}

/// Parse a promise list. `None` leaves that set unchanged.
fn parse_promises(names: Option<&[u8]>) -> Result<Option<Promises>> {
    names.map(Promises::parse).transpose()
}

pub fn sys_pledge(
    thread: &Thread,
    promises: Option<&[u8]>,
    exec_promises: Option<&[u8]>,
) -> SyscallResult {
    let promises = parse_promises(promises)?;
    let exec_promises = parse_promises(exec_promises)?;
    thread.process().pledge(promises, exec_promises)?;
    Ok(0)
}

/// Grant access to `path` or, without a path and permissions, lock the veil.
pub fn sys_unveil(
    thread: &Thread,
    path: Option<&[u8]>,
    permissions: Option<&[u8]>,
    flags: u64,
) -> SyscallResult {
    let process = thread.process();
    let flags = UnveilFlags::parse(flags)?;
    let target = if flags.contains(UnveilFlags::AFTER_EXEC) {
        UnveilTarget::AfterExec
    } else {
        UnveilTarget::Current
    };

    let (path, permissions) = match (path, permissions) {
        (None, None) => {
            process.veil(target).lock()?;
            return Ok(0);
        }
        (Some(path), Some(permissions)) => (path, permissions),
        _ => bail!(Inval),
    };
    ensure!(!process.veil(target).state().is_locked(), Perm);
    let access = UnveilAccess::parse(permissions)?;

    let path = process.absolute_path(&Path::new(path)?);
    let ctx = process.file_access_context();
    let vfs = process.vfs_root().vfs();
    let path = match vfs.resolve(&path, &ctx) {
        Ok(custody) => custody.path().clone(),
        Err(err) if err.kind() == ErrorKind::NoEnt => {
            // The last component may be created later.
            let parent = path.parent().ok_or(err)?;
            vfs.resolve(&parent, &ctx)?;
            path
        }
        Err(err) => return Err(err),
    };

    process.veil(target).unveil(&path, access)?;
    Ok(0)
}

fn required_access(flags: OpenFlags) -> UnveilAccess {
    let mut access = UnveilAccess::empty();
    access.set(UnveilAccess::READ, flags.is_readable());
    access.set(UnveilAccess::WRITE, flags.is_writable());
    access.set(UnveilAccess::CREATE, flags.contains(OpenFlags::CREAT));
    access
}

pub fn sys_open(thread: &Thread, path: &[u8], flags: u64, mode: u64) -> SyscallResult {
    let process = thread.process();
    let flags = OpenFlags::parse(flags)?;
    let mode = FileMode::parse(mode)?;

    if flags.is_readable() {
        process.require_promise(Promises::RPATH)?;
    }
    if flags.is_writable() {
        process.require_promise(Promises::WPATH)?;
    }
    if flags.contains(OpenFlags::CREAT) {
        process.require_promise(Promises::CPATH)?;
    }

    let path = process.absolute_path(&Path::new(path)?);
    let ctx = process.file_access_context();
    let vfs = process.vfs_root().vfs();

    // Reserve the descriptor first so a full table fails before any side
    // effects.
    let allocation = process.fdtable().allocate(FdNum::new(0), process.fd_limit())?;

    // Hidden paths must fail the same way whether they exist or not.
    process.check_unveil(&path, required_access(flags))?;

    let custody = match vfs.resolve(&path, &ctx) {
        Ok(custody) => {
            ensure!(
                !flags.contains(OpenFlags::CREAT | OpenFlags::EXCL),
                Exist
            );
            custody
        }
        Err(err) if err.kind() == ErrorKind::NoEnt && flags.contains(OpenFlags::CREAT) => {
            let name = path.file_name().ok_or(err)?;
            let parent = path.parent().ok_or(err)?;
            let parent = vfs.resolve(&parent, &ctx)?;
            let umask = process.with_protected_data(|values| values.umask.get());
            vfs.create(&parent, name, mode & FileMode::ALL & !umask, &ctx)?
        }
        Err(err) => return Err(err),
    };

    let fd = vfs.open(&custody, flags, &ctx)?;
    let fd_num = allocation.commit(fd, FdFlags::from(flags));
    debug!("process {} opened {path} as {fd_num}", process.pid());
    Ok(fd_num.get() as u64)
}

pub fn sys_close(thread: &Thread, fd: u64) -> SyscallResult {
    let process = thread.process();
    process.require_promise(Promises::STDIO)?;
    let fd = FdNum::parse(fd)?;
    process.fdtable().close(fd)?;
    Ok(0)
}

pub fn sys_dup2(thread: &Thread, oldfd: u64, newfd: u64) -> SyscallResult {
    let process = thread.process();
    process.require_promise(Promises::STDIO)?;
    let oldfd = FdNum::parse(oldfd)?;
    let newfd = FdNum::parse(newfd)?;
    let fd = process
        .fdtable()
        .duplicate(oldfd, newfd, process.fd_limit())?;
    Ok(fd.get() as u64)
}

pub fn sys_fcntl(thread: &Thread, fd: u64, cmd: u64, arg: u64) -> SyscallResult {
    let process = thread.process();
    process.require_promise(Promises::STDIO)?;
    let fd = FdNum::parse(fd)?;
    let cmd = FcntlCmd::parse(cmd)?;
    let fdtable = process.fdtable();

    match cmd {
        FcntlCmd::DupFd | FcntlCmd::DupFdCloExec => {
            let min = FdNum::parse(arg)?;
            let mut flags = FdFlags::empty();
            flags.set(FdFlags::CLOEXEC, cmd == FcntlCmd::DupFdCloExec);
            let fd = fdtable.duplicate_from(fd, min, flags, process.fd_limit())?;
            Ok(fd.get() as u64)
        }
        FcntlCmd::GetFd => Ok(fdtable.flags(fd)?.bits()),
        FcntlCmd::SetFd => {
            fdtable.set_flags(fd, FdFlags::parse(arg)?)?;
            Ok(0)
        }
        FcntlCmd::GetFl => Ok(fdtable.get(fd)?.flags().bits()),
    }
}

pub async fn sys_futex(
    registry: &ProcessRegistry,
    thread: &Thread,
    uaddr: u64,
    op: u64,
    val: u64,
    val3: u64,
) -> SyscallResult {
    let process = thread.process();
    process.require_promise(Promises::THREAD)?;
    let op = FutexOpWithFlags::parse(op)?;
    let memory = process.memory()?;
    let shared = !op.flags.contains(args::FutexFlags::PRIVATE_FLAG);
    let key = memory.futex_key(uaddr, shared)?;

    let bitset = match op.op {
        FutexOp::Wait | FutexOp::Wake => None,
        FutexOp::WaitBitset | FutexOp::WakeBitset => {
            Some(NonZeroU32::try_from(val3 as u32)?)
        }
    };

    match op.op {
        FutexOp::Wait | FutexOp::WaitBitset => {
            let word = memory.futex_word(uaddr)?;
            let signal = thread.wait_for_signal();
            ensure!(thread.pending_signals().is_empty(), Intr);
            let wait = registry.futexes().wait(key, &word, val as u32, bitset)?;
            let wait = pin!(wait);
            let signal = pin!(signal);
            let woken = thread
                .block_on(BlockReason::Futex, select(wait, signal))
                .await;
            match woken {
                Either::Left(_) => Ok(0),
                Either::Right(_) => bail!(Intr),
            }
        }
        FutexOp::Wake | FutexOp::WakeBitset => {
            let woken = registry.futexes().wake(key, val as u32, bitset);
            Ok(u64::from(woken))
        }
    }
}

/// Returns the pid of the child to the parent.
pub fn sys_fork(registry: &ProcessRegistry, thread: &Thread) -> SyscallResult {
    let child = thread.process().fork(registry, thread)?;
    Ok(u64::from(child.process().pid()))
}

pub fn sys_execve(
    registry: &ProcessRegistry,
    thread: &Thread,
    loader: &dyn ProgramLoader,
    path: &[u8],
    argv: Vec<Vec<u8>>,
    envp: Vec<Vec<u8>>,
) -> SyscallResult {
    let path = Path::new(path)?;
    thread
        .process()
        .exec(registry, thread, loader, &path, argv, envp)?;
    Ok(0)
}

/// Start a thread at `entry`. A stack size of zero lets the kernel allocate
/// the stack.
pub fn sys_create_thread(
    registry: &ProcessRegistry,
    thread: &Thread,
    entry: u64,
    stack_addr: u64,
    stack_size: u64,
) -> SyscallResult {
    let stack = if stack_size == 0 {
        None
    } else {
        let start = VirtAddr::try_new(stack_addr)?;
        let end = stack_addr.checked_add(stack_size).ok_or(err!(Inval))?;
        let end = VirtAddr::try_new(end)?;
        Some(Range { start, end })
    };
    let new = thread.process().create_thread(registry, entry, stack)?;
    Ok(u64::from(new.tid()))
}

pub async fn sys_join_thread(
    registry: &ProcessRegistry,
    thread: &Thread,
    tid: u64,
) -> SyscallResult {
    thread.process().require_promise(Promises::THREAD)?;
    let tid = u32::try_from(tid)?;
    thread.join(registry, tid).await
}

pub fn sys_detach_thread(registry: &ProcessRegistry, thread: &Thread, tid: u64) -> SyscallResult {
    thread.process().require_promise(Promises::THREAD)?;
    let tid = u32::try_from(tid)?;
    thread.detach(registry, tid)?;
    Ok(0)
}

pub fn sys_kill_thread(
    registry: &ProcessRegistry,
    thread: &Thread,
    tid: u64,
    signal: u64,
) -> SyscallResult {
    thread.process().require_promise(Promises::THREAD)?;
    let tid = u32::try_from(tid)?;
    let signal = match signal {
        0 => None,
        signal => Some(Signal::new(u8::try_from(signal)?)?),
    };
    thread.kill_thread(registry, tid, signal)?;
    Ok(0)
}

/// The part of `siginfo_t` filled in for dead children.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct ChildInfo {
    pub signo: u32,
    pub errno: i32,
    pub code: u32,
    pub pid: u32,
    pub status: u32,
}

impl ChildInfo {
    pub const CLD_EXITED: u32 = 1;
    pub const CLD_KILLED: u32 = 2;
    pub const CLD_DUMPED: u32 = 3;
}

/// Collect a dead child. Returns its pid or 0 if `NOHANG` was given and no
/// child is dead yet. The details are written to `infop` unless it's null.
pub async fn sys_waitid(
    registry: &ProcessRegistry,
    thread: &Thread,
    idtype: u64,
    id: u64,
    infop: u64,
    options: u64,
) -> SyscallResult {
    let process = thread.process();
    process.require_promise(Promises::PROC)?;
    let idtype = IdType::parse(idtype)?;
    let options = WaitOptions::parse(options)?;
    ensure!(options.contains(WaitOptions::EXITED), Inval);

    let filter = match idtype {
        IdType::All => WaitFilter::Any,
        IdType::Pid => WaitFilter::Pid(u32::try_from(id)?),
        IdType::Pgid => match u32::try_from(id)? {
            0 => WaitFilter::Pgid(process.pgid()),
            pgid => WaitFilter::Pgid(pgid),
        },
    };

    let result = thread
        .block_on(BlockReason::Wait, process.waitid(registry, filter, options))
        .await?;
    let Some(result) = result else {
        return Ok(0);
    };

    if infop != 0 {
        let (code, status) = match result.status {
            ExitStatus::Exited(status) => (ChildInfo::CLD_EXITED, u32::from(status)),
            ExitStatus::Killed(signal) if result.core_dumped => {
                (ChildInfo::CLD_DUMPED, signal.get() as u32)
            }
            ExitStatus::Killed(signal) => (ChildInfo::CLD_KILLED, signal.get() as u32),
        };
        let info = ChildInfo {
            signo: Signal::CHLD.get() as u32,
            errno: 0,
            code,
            pid: result.pid,
            status,
        };
        write_struct(thread, infop, &info)?;
    }

    Ok(u64::from(result.pid))
}

/// Terminate the whole process.
pub fn sys_exit(registry: &ProcessRegistry, thread: &Thread, status: u64) -> SyscallResult {
    thread.process().exit(registry, status as u8);
    Ok(0)
}

/// Terminate only the calling thread.
pub fn sys_exit_thread(
    registry: &ProcessRegistry,
    thread: &Arc<Thread>,
    value: u64,
) -> SyscallResult {
    thread.exit(registry, value);
    Ok(0)
}

pub fn sys_disown(registry: &ProcessRegistry, thread: &Thread, pid: u64) -> SyscallResult {
    let process = thread.process();
    process.require_promise(Promises::PROC)?;
    process.disown(registry, u32::try_from(pid)?)?;
    Ok(0)
}

pub fn sys_umask(thread: &Thread, mask: u64) -> SyscallResult {
    let process = thread.process();
    process.require_promise(Promises::STDIO)?;
    let old = process.umask(FileMode::from_bits_truncate(mask));
    Ok(old.bits())
}

pub fn sys_setpgid(
    registry: &ProcessRegistry,
    thread: &Thread,
    pid: u64,
    pgid: u64,
) -> SyscallResult {
    thread
        .process()
        .setpgid(registry, u32::try_from(pid)?, u32::try_from(pgid)?)?;
    Ok(0)
}

pub fn sys_setsid(registry: &ProcessRegistry, thread: &Thread) -> SyscallResult {
    let sid = thread.process().setsid(registry)?;
    Ok(u64::from(sid))
}

/// The layout of a signal action in user memory.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct UserSigaction {
    pub handler: u64,
    pub flags: u64,
    pub mask: u64,
}

impl UserSigaction {
    pub const SIG_DFL: u64 = 0;
    pub const SIG_IGN: u64 = 1;
}

impl TryFrom<UserSigaction> for Sigaction {
    type Error = crate::error::Error;

    fn try_from(value: UserSigaction) -> Result<Self> {
        let handler = match value.handler {
            UserSigaction::SIG_DFL => SigHandler::Default,
            UserSigaction::SIG_IGN => SigHandler::Ignore,
            addr => SigHandler::Handler(addr),
        };
        let flags = u32::try_from(value.flags)?;
        let flags = SigactionFlags::from_bits(flags).ok_or(err!(Inval))?;
        Ok(Self {
            handler,
            flags,
            mask: Sigset::from_bits(value.mask),
        })
    }
}

impl From<Sigaction> for UserSigaction {
    fn from(value: Sigaction) -> Self {
        let handler = match value.handler {
            SigHandler::Default => Self::SIG_DFL,
            SigHandler::Ignore => Self::SIG_IGN,
            SigHandler::Handler(addr) => addr,
        };
        Self {
            handler,
            flags: u64::from(value.flags.bits()),
            mask: value.mask.to_bits(),
        }
    }
}

pub fn sys_sigaction(thread: &Thread, signum: u64, act: u64, oldact: u64) -> SyscallResult {
    let process = thread.process();
    process.require_promise(Promises::SIGACTION)?;
    let signal = Signal::new(u8::try_from(signum)?)?;

    let new = if act != 0 {
        let act = read_struct::<UserSigaction>(thread, act)?;
        Some(Sigaction::try_from(act)?)
    } else {
        None
    };

    let old = process.sigaction(signal, new)?;
    if oldact != 0 {
        write_struct(thread, oldact, &UserSigaction::from(old))?;
    }
    Ok(0)
}

pub fn sys_getpid(thread: &Thread) -> SyscallResult {
    thread.process().require_promise(Promises::STDIO)?;
    Ok(u64::from(thread.process().pid()))
}

pub fn sys_getppid(thread: &Thread) -> SyscallResult {
    thread.process().require_promise(Promises::STDIO)?;
    Ok(u64::from(thread.process().ppid()))
}

pub fn sys_gettid(thread: &Thread) -> SyscallResult {
    thread.process().require_promise(Promises::STDIO)?;
    Ok(u64::from(thread.tid()))
}
