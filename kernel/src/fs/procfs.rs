//! Text views of a process for `/proc/<pid>/`.
//!
//! Every file is rendered from a fresh snapshot when it's read.

use core::fmt::{self, Write};

use alloc::string::String;

use crate::{
    fs::unveil::UnveilTarget,
    user::{process::Process, thread::ThreadLifecycle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcFile {
    Pledge,
    Unveil,
    Fds,
    Stacks,
    Status,
}

impl ProcFile {
    pub const ALL: [Self; 5] = [
        Self::Pledge,
        Self::Unveil,
        Self::Fds,
        Self::Stacks,
        Self::Status,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProcFile::Pledge => "pledge",
            ProcFile::Unveil => "unveil",
            ProcFile::Fds => "fds",
            ProcFile::Stacks => "stacks",
            ProcFile::Status => "status",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|file| file.name().as_bytes() == name)
    }

    pub fn render(self, process: &Process) -> String {
        let mut out = String::new();
        // Writing into a `String` doesn't fail.
        let _ = match self {
            ProcFile::Pledge => write_pledge(process, &mut out),
            ProcFile::Unveil => write_unveil(process, &mut out),
            ProcFile::Fds => write_fds(process, &mut out),
            ProcFile::Stacks => write_stacks(process, &mut out),
            ProcFile::Status => write_status(process, &mut out),
        };
        out
    }
}

/// Unrestricted sets are shown as `-`.
pub fn write_pledge(process: &Process, w: &mut impl Write) -> fmt::Result {
    let pledge = process.pledge_state();
    match pledge.promises() {
        Some(promises) => writeln!(w, "promises: {promises}")?,
        None => writeln!(w, "promises: -")?,
    }
    match pledge.exec_promises() {
        Some(promises) => writeln!(w, "execpromises: {promises}"),
        None => writeln!(w, "execpromises: -"),
    }
}

pub fn write_unveil(process: &Process, w: &mut impl Write) -> fmt::Result {
    for (label, target) in [
        ("current", UnveilTarget::Current),
        ("after exec", UnveilTarget::AfterExec),
    ] {
        let (state, entries) = {
            let veil = process.veil(target);
            (veil.state(), veil.entries())
        };
        writeln!(w, "{label}: {state}")?;
        for (path, access) in entries {
            writeln!(w, "  {path} {access}")?;
        }
    }
    Ok(())
}

pub fn write_fds(process: &Process, w: &mut impl Write) -> fmt::Result {
    let fdtable = process.fdtable();
    writeln!(w, "count: {}", fdtable.open_count())?;
    for (num, fd, flags) in fdtable.entries() {
        let cloexec = if flags.is_empty() { "" } else { " cloexec" };
        writeln!(w, "{num:>4} {}{cloexec}", fd.name())?;
    }
    Ok(())
}

pub fn write_stacks(process: &Process, w: &mut impl Write) -> fmt::Result {
    for thread in process.threads() {
        let stack = thread.stack();
        let lifecycle = match thread.lifecycle() {
            ThreadLifecycle::Runnable => "runnable",
            ThreadLifecycle::Blocked(_) => "blocked",
            ThreadLifecycle::Dying => "dying",
            ThreadLifecycle::Dead => "dead",
        };
        writeln!(
            w,
            "{} {:#x}-{:#x} {lifecycle}",
            thread.tid(),
            stack.start.as_u64(),
            stack.end.as_u64(),
        )?;
    }
    Ok(())
}

pub fn write_status(process: &Process, w: &mut impl Write) -> fmt::Result {
    let credentials = process.credentials();
    let (umask, jailed, dumpable) = process.with_protected_data(|values| {
        (values.umask.get(), values.jailed.get(), values.dumpable.get())
    });

    writeln!(w, "Name:\t{}", process.name().escape_ascii())?;
    writeln!(w, "State:\t{}", process.state())?;
    writeln!(w, "Pid:\t{}", process.pid())?;
    writeln!(w, "PPid:\t{}", process.ppid())?;
    writeln!(w, "Pgid:\t{}", process.pgid())?;
    writeln!(w, "Sid:\t{}", process.sid())?;
    writeln!(
        w,
        "Uid:\t{}\t{}\t{}",
        credentials.real_user_id.get(),
        credentials.effective_user_id.get(),
        credentials.saved_set_user_id.get(),
    )?;
    writeln!(
        w,
        "Gid:\t{}\t{}\t{}",
        credentials.real_group_id.get(),
        credentials.effective_group_id.get(),
        credentials.saved_set_group_id.get(),
    )?;
    writeln!(w, "Umask:\t{:04o}", umask.bits())?;
    writeln!(w, "Threads:\t{}", process.thread_count())?;
    writeln!(w, "FDSize:\t{}", process.fdtable().open_count())?;
    writeln!(w, "Jailed:\t{}", u8::from(jailed))?;
    writeln!(w, "Dumpable:\t{}", u8::from(dumpable))
}
