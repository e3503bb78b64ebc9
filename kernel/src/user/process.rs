use core::{
    fmt::{self, Display},
    ops::Range,
};

use alloc::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    vec::Vec,
};
use arrayvec::ArrayVec;
use crossbeam_utils::atomic::AtomicCell;
use log::{debug, warn};
use x86_64::VirtAddr;

use crate::{
    error::{Result, bail, ensure, err},
    fs::{
        Custody, FileAccessContext, VfsRootContext,
        fd::FileDescriptorTable,
        path::Path,
        unveil::{UnveilAccess, UnveilData, UnveilTarget},
    },
    limited_index::LimitedIndex,
    memory::protected::{PageProtection, ProtectedCell, ProtectedData, WriteWindow},
    rt::notify::Notify,
    spin::mutex::{Mutex, MutexGuard},
    user::{
        memory::VirtualMemory,
        registry::ProcessRegistry,
        syscall::args::{DefaultAction, FileMode, Signal},
        thread::{SigHandler, Sigaction, Thread},
    },
};

use self::{
    credentials::Credentials,
    limits::{Limits, RLimit, Resource},
    pledge::{PledgeState, Promises},
};

pub mod credentials;
pub mod exec;
pub mod limits;
pub mod pledge;
pub mod wait;

/// The capacity of a process name, including room for a terminator.
pub const TASK_COMM_CAPACITY: usize = 16;

const STACK_SIZE: u64 = 0x10000;

const HOSTNAME_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// The process was told to exit and its threads are stopping.
    Dying,
    /// All threads stopped and the process's resources were released. The
    /// process lingers until its parent collects it.
    Dead,
}

impl Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Running => "running",
            ProcessState::Dying => "dying",
            ProcessState::Dead => "dead",
        };
        f.pad(name)
    }
}

/// A hostname shared by all processes in the same namespace.
pub struct HostnameContext {
    hostname: Mutex<ArrayVec<u8, HOSTNAME_CAPACITY>>,
}

impl HostnameContext {
    pub fn new(hostname: &[u8]) -> Result<Self> {
        let hostname = ArrayVec::try_from(hostname).map_err(|_| err!(Inval))?;
        Ok(Self {
            hostname: Mutex::new(hostname),
        })
    }

    pub fn get(&self) -> ArrayVec<u8, HOSTNAME_CAPACITY> {
        self.hostname.lock().clone()
    }

    pub fn set(&self, hostname: &[u8]) -> Result<()> {
        *self.hostname.lock() = ArrayVec::try_from(hostname).map_err(|_| err!(Inval))?;
        Ok(())
    }
}

/// The security-critical state of a process.
///
/// The block is only reachable through [`Process::with_protected_data`] and
/// the crate-internal mutable accessor.
pub struct ProtectedValues {
    pub credentials: ProtectedCell<Arc<Credentials>>,
    pub ppid: ProtectedCell<u32>,
    pub pgid: ProtectedCell<u32>,
    pub sid: ProtectedCell<u32>,
    pub dumpable: ProtectedCell<bool>,
    pub should_generate_coredump: ProtectedCell<bool>,
    pub termination_status: ProtectedCell<Option<u8>>,
    pub termination_signal: ProtectedCell<Option<Signal>>,
    pub thread_count: ProtectedCell<u32>,
    pub umask: ProtectedCell<FileMode>,
    pub jailed: ProtectedCell<bool>,
    pub pledge: ProtectedCell<PledgeState>,
    signal_actions: [ProtectedCell<Sigaction>; 64],
}

impl ProtectedValues {
    fn new(credentials: Arc<Credentials>, ppid: u32, pgid: u32, sid: u32) -> Self {
        Self {
            credentials: ProtectedCell::new(credentials),
            ppid: ProtectedCell::new(ppid),
            pgid: ProtectedCell::new(pgid),
            sid: ProtectedCell::new(sid),
            dumpable: ProtectedCell::new(true),
            should_generate_coredump: ProtectedCell::new(false),
            termination_status: ProtectedCell::new(None),
            termination_signal: ProtectedCell::new(None),
            thread_count: ProtectedCell::new(0),
            umask: ProtectedCell::new(FileMode::GROUP_WRITE | FileMode::OTHER_WRITE),
            jailed: ProtectedCell::new(false),
            pledge: ProtectedCell::new(PledgeState::unrestricted()),
            signal_actions: core::array::from_fn(|_| ProtectedCell::new(Sigaction::DEFAULT)),
        }
    }

    /// The values of a forked child.
    fn fork(&self, ppid: u32) -> Self {
        Self {
            credentials: ProtectedCell::new(self.credentials.cloned()),
            ppid: ProtectedCell::new(ppid),
            pgid: ProtectedCell::new(self.pgid.get()),
            sid: ProtectedCell::new(self.sid.get()),
            dumpable: ProtectedCell::new(self.dumpable.get()),
            should_generate_coredump: ProtectedCell::new(false),
            termination_status: ProtectedCell::new(None),
            termination_signal: ProtectedCell::new(None),
            thread_count: ProtectedCell::new(0),
            umask: ProtectedCell::new(self.umask.get()),
            jailed: ProtectedCell::new(self.jailed.get()),
            pledge: ProtectedCell::new(self.pledge.get()),
            signal_actions: core::array::from_fn(|i| {
                ProtectedCell::new(self.signal_actions[i].get())
            }),
        }
    }

    pub fn signal_action(&self, signal: Signal) -> &ProtectedCell<Sigaction> {
        &self.signal_actions[LimitedIndex::<64>::new(signal.get() - 1)]
    }
}

/// Everything needed to create a process from scratch.
pub struct ProcessParams<'a> {
    pub name: &'a [u8],
    pub credentials: Arc<Credentials>,
    pub vfs_root: Arc<VfsRootContext>,
    pub hostname: Arc<HostnameContext>,
    pub cwd: Custody,
    pub executable: Option<Custody>,
    pub entry: u64,
    pub parent: Option<&'a Arc<Process>>,
}

pub struct Process {
    pid: u32,
    state: AtomicCell<ProcessState>,
    protected: ProtectedData<ProtectedValues, alloc::boxed::Box<dyn PageProtection>>,
    unveil: Mutex<UnveilData>,
    exec_unveil: Mutex<UnveilData>,
    fdtable: FileDescriptorTable,
    threads: Mutex<BTreeMap<u32, Weak<Thread>>>,
    children: Mutex<BTreeMap<u32, Arc<Process>>>,
    parent: Mutex<Weak<Process>>,
    child_notify: Notify,
    memory: Mutex<Option<Arc<VirtualMemory>>>,
    cwd: Mutex<Custody>,
    executable: Mutex<Option<Custody>>,
    vfs_root: Arc<VfsRootContext>,
    hostname: Arc<HostnameContext>,
    name: Mutex<ArrayVec<u8, TASK_COMM_CAPACITY>>,
    arguments: Mutex<Vec<Vec<u8>>>,
    environment: Mutex<Vec<Vec<u8>>>,
    limits: Mutex<Limits>,
}

#[cfg(test)]
impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Process {
    /// Create a new process and its first thread.
    ///
    /// A process without a parent starts a new session and process group.
    /// Otherwise it joins its parent's group.
    pub fn create(registry: &ProcessRegistry, params: ProcessParams<'_>) -> Result<Arc<Thread>> {
        let pid = registry.allocate_id();
        let (ppid, pgid, sid) = match params.parent {
            Some(parent) => {
                let (pgid, sid) = parent.with_protected_data(|values| (values.pgid.get(), values.sid.get()));
                (parent.pid, pgid, sid)
            }
            None => (0, pid, pid),
        };

        let memory = VirtualMemory::new();
        let stack = memory.allocate_stack(STACK_SIZE)?;

        let process = Arc::new(Self {
            pid,
            state: AtomicCell::new(ProcessState::Running),
            protected: ProtectedData::new(
                ProtectedValues::new(params.credentials, ppid, pgid, sid),
                registry.new_protection(),
            ),
            unveil: Mutex::new(UnveilData::new()),
            exec_unveil: Mutex::new(UnveilData::new()),
            fdtable: FileDescriptorTable::empty(),
            threads: Mutex::new(BTreeMap::new()),
            children: Mutex::new(BTreeMap::new()),
            parent: Mutex::new(params.parent.map(Arc::downgrade).unwrap_or_default()),
            child_notify: Notify::new(),
            memory: Mutex::new(Some(Arc::new(memory))),
            cwd: Mutex::new(params.cwd),
            executable: Mutex::new(params.executable),
            vfs_root: params.vfs_root,
            hostname: params.hostname,
            name: Mutex::new(truncate_name(params.name)),
            arguments: Mutex::new(Vec::new()),
            environment: Mutex::new(Vec::new()),
            limits: Mutex::new(Limits::new()),
        });

        registry.join_group(pid, pgid, sid)?;
        registry.register_process(process.clone());
        if let Some(parent) = params.parent {
            parent.children.lock().insert(pid, process.clone());
        }
        debug!("created process {pid}");

        let thread = Thread::new(pid, process, params.entry, stack);
        registry.register_thread(thread.clone());
        Ok(thread)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state.load()
    }

    pub fn with_protected_data<R>(&self, f: impl FnOnce(&ProtectedValues) -> R) -> R {
        self.protected.with_protected_data(f)
    }

    pub(crate) fn with_mutable_protected_data<R>(
        &self,
        f: impl FnOnce(&ProtectedValues, &WriteWindow<'_>) -> R,
    ) -> R {
        self.protected.with_mutable_protected_data(f)
    }

    pub fn credentials(&self) -> Arc<Credentials> {
        self.with_protected_data(|values| values.credentials.cloned())
    }

    pub fn ppid(&self) -> u32 {
        self.with_protected_data(|values| values.ppid.get())
    }

    pub fn pgid(&self) -> u32 {
        self.with_protected_data(|values| values.pgid.get())
    }

    pub fn sid(&self) -> u32 {
        self.with_protected_data(|values| values.sid.get())
    }

    pub fn thread_count(&self) -> u32 {
        self.with_protected_data(|values| values.thread_count.get())
    }

    pub fn is_jailed(&self) -> bool {
        self.with_protected_data(|values| values.jailed.get())
    }

    pub fn pledge_state(&self) -> PledgeState {
        self.with_protected_data(|values| values.pledge.get())
    }

    pub fn termination_status(&self) -> Option<u8> {
        self.with_protected_data(|values| values.termination_status.get())
    }

    pub fn name(&self) -> ArrayVec<u8, TASK_COMM_CAPACITY> {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &[u8]) {
        *self.name.lock() = truncate_name(name);
    }

    pub fn arguments(&self) -> Vec<Vec<u8>> {
        self.arguments.lock().clone()
    }

    pub fn environment(&self) -> Vec<Vec<u8>> {
        self.environment.lock().clone()
    }

    pub fn fdtable(&self) -> &FileDescriptorTable {
        &self.fdtable
    }

    pub fn vfs_root(&self) -> &Arc<VfsRootContext> {
        &self.vfs_root
    }

    pub fn hostname(&self) -> &Arc<HostnameContext> {
        &self.hostname
    }

    pub fn cwd(&self) -> Custody {
        self.cwd.lock().clone()
    }

    pub fn executable(&self) -> Option<Custody> {
        self.executable.lock().clone()
    }

    pub fn limits(&self) -> Limits {
        *self.limits.lock()
    }

    /// Change a resource limit. Only the super user may raise hard limits.
    pub fn set_limit(&self, resource: Resource, limit: RLimit) -> Result<()> {
        self.require_promise(Promises::PROC)?;
        let privileged = self.credentials().is_super_user();
        self.limits.lock().set(resource, limit, privileged)
    }

    /// The soft limit for file descriptor numbers.
    pub fn fd_limit(&self) -> u64 {
        self.limits.lock().get(Resource::NoFile).soft
    }

    /// The address space. Released processes don't have one.
    pub fn memory(&self) -> Result<Arc<VirtualMemory>> {
        self.memory.lock().clone().ok_or(err!(Srch))
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.lock().upgrade()
    }

    pub fn children(&self) -> Vec<u32> {
        self.children.lock().keys().copied().collect()
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn file_access_context(&self) -> FileAccessContext {
        FileAccessContext {
            credentials: self.credentials(),
        }
    }

    /// Make `path` absolute relative to the working directory and
    /// canonicalize it.
    pub fn absolute_path(&self, path: &Path) -> Path {
        path.absolute(self.cwd.lock().path())
    }

    /// Resolve `path` relative to the working directory.
    pub fn resolve(&self, path: &Path) -> Result<Custody> {
        let path = self.absolute_path(path);
        self.vfs_root
            .vfs()
            .resolve(&path, &self.file_access_context())
    }

    pub fn veil(&self, target: UnveilTarget) -> MutexGuard<'_, UnveilData> {
        match target {
            UnveilTarget::Current => self.unveil.lock(),
            UnveilTarget::AfterExec => self.exec_unveil.lock(),
        }
    }

    /// Succeeds if the current veil grants `required` on `path`.
    pub fn check_unveil(&self, path: &Path, required: UnveilAccess) -> Result<()> {
        self.unveil.lock().check(path, required)
    }

    /// Narrow the promises of the running program and/or of the next one.
    pub fn pledge(&self, promises: Option<Promises>, exec_promises: Option<Promises>) -> Result<()> {
        self.with_mutable_protected_data(|values, window| {
            let state = values.pledge.get().pledge(promises, exec_promises)?;
            values.pledge.set(window, state);
            Ok(())
        })
    }

    /// Succeeds if the process never pledged or kept `promise`.
    ///
    /// Violations are reported and the caller gets `EPERM`. Processes that
    /// pledged `no_error` expect this and aren't warned about.
    #[track_caller]
    pub fn require_promise(&self, promise: Promises) -> Result<()> {
        let pledge = self.pledge_state();
        let result = pledge.check(promise);
        if result.is_err() {
            let quiet = pledge
                .promises()
                .is_some_and(|promises| promises.contains(Promises::NO_ERROR));
            if quiet {
                debug!("process {} is missing promise {promise}", self.pid);
            } else {
                warn!(
                    "process {} ({}) violated its pledge: missing {promise}",
                    self.pid,
                    self.name.lock().escape_ascii(),
                );
            }
        }
        result
    }

    /// Succeeds if the process never pledged.
    pub fn require_no_promises(&self) -> Result<()> {
        ensure!(!self.pledge_state().has_promises(), Perm);
        Ok(())
    }

    pub(crate) fn add_thread(&self, thread: &Arc<Thread>) {
        self.threads
            .lock()
            .insert(thread.tid(), Arc::downgrade(thread));
        self.with_mutable_protected_data(|values, window| {
            values.thread_count.update(window, |count| count + 1);
        });
    }

    /// Spawn another thread in this process.
    ///
    /// Without a stack, one is allocated. A given stack has to be mapped.
    pub fn create_thread(
        self: &Arc<Self>,
        registry: &ProcessRegistry,
        entry: u64,
        stack: Option<Range<VirtAddr>>,
    ) -> Result<Arc<Thread>> {
        self.require_promise(Promises::THREAD)?;
        ensure!(self.state() == ProcessState::Running, Srch);

        let memory = self.memory()?;
        let stack = match stack {
            Some(stack) => {
                ensure!(memory.is_mapped(stack.clone()), Fault);
                stack
            }
            None => memory.allocate_stack(STACK_SIZE)?,
        };

        let thread = Thread::new(registry.allocate_id(), self.clone(), entry, stack);
        registry.register_thread(thread.clone());
        Ok(thread)
    }

    /// Called by a thread that just exited.
    pub(crate) fn thread_exited(&self, registry: &ProcessRegistry, thread: &Thread) {
        self.threads.lock().remove(&thread.tid());
        let remaining = self.with_mutable_protected_data(|values, window| {
            values.thread_count.update(window, |count| count - 1)
        });
        if remaining != 0 {
            return;
        }

        if self.begin_dying() {
            self.with_mutable_protected_data(|values, window| {
                values.termination_status.set(window, Some(0));
            });
        }
        self.finalize(registry);
    }

    /// Returns whether the process was still running.
    fn begin_dying(&self) -> bool {
        self.state
            .compare_exchange(ProcessState::Running, ProcessState::Dying)
            .is_ok()
    }

    /// Stop all threads except `except`.
    fn kill_threads(&self, registry: &ProcessRegistry, except: Option<u32>) {
        let threads = self.threads();
        for thread in threads {
            if Some(thread.tid()) == except {
                continue;
            }
            thread.exit(registry, 0);
        }
    }

    /// Terminate the whole process with `status`.
    pub fn exit(&self, registry: &ProcessRegistry, status: u8) {
        if !self.begin_dying() {
            return;
        }
        debug!("process {} exiting with status {status}", self.pid);

        self.with_mutable_protected_data(|values, window| {
            values.termination_status.set(window, Some(status));
        });
        self.kill_threads(registry, None);
    }

    /// Terminate the whole process because of an unhandled signal.
    pub fn terminate_due_to_signal(&self, registry: &ProcessRegistry, signal: Signal) {
        if !self.begin_dying() {
            return;
        }
        debug!("process {} terminated by {signal}", self.pid);

        let dumps_core = signal.default_action() == DefaultAction::DumpCore;
        self.with_mutable_protected_data(|values, window| {
            values.termination_signal.set(window, Some(signal));
            if dumps_core && values.dumpable.get() {
                values.should_generate_coredump.set(window, true);
            }
        });
        self.kill_threads(registry, None);
    }

    /// Release the process's resources once all of its threads stopped.
    fn finalize(&self, registry: &ProcessRegistry) {
        assert_eq!(self.state(), ProcessState::Dying);

        drop(self.memory.lock().take());
        self.fdtable.close_all();
        registry.leave_group(self.pid, self.pgid());
        registry.remove_threads_of(self.pid);

        let children = core::mem::take(&mut *self.children.lock());
        for child in children.into_values() {
            child.orphan(registry);
        }

        self.state.store(ProcessState::Dead);
        debug!("process {} is dead", self.pid);

        let parent = self.parent.lock().upgrade();
        match parent {
            Some(parent) => parent.child_notify.notify(),
            None => {
                registry.remove_process(self.pid);
            }
        }
    }

    /// Detach the process from its parent. Dead orphans are forgotten.
    fn orphan(&self, registry: &ProcessRegistry) {
        *self.parent.lock() = Weak::new();
        self.with_mutable_protected_data(|values, window| {
            values.ppid.set(window, 0);
        });
        if self.state() == ProcessState::Dead {
            registry.remove_process(self.pid);
        }
    }

    /// Create a copy of the process. The child gets a single thread that
    /// continues where `caller` is.
    pub fn fork(self: &Arc<Self>, registry: &ProcessRegistry, caller: &Thread) -> Result<Arc<Thread>> {
        self.require_promise(Promises::PROC)?;
        ensure!(self.state() == ProcessState::Running, Srch);

        let memory = self.memory()?.fork();
        let pid = registry.allocate_id();
        let values = self.with_protected_data(|values| values.fork(self.pid));
        let (pgid, sid) = (values.pgid.get(), values.sid.get());

        let child = Arc::new(Self {
            pid,
            state: AtomicCell::new(ProcessState::Running),
            protected: ProtectedData::new(values, registry.new_protection()),
            unveil: Mutex::new(self.unveil.lock().clone()),
            exec_unveil: Mutex::new(self.exec_unveil.lock().clone()),
            fdtable: self.fdtable.fork_copy(),
            threads: Mutex::new(BTreeMap::new()),
            children: Mutex::new(BTreeMap::new()),
            parent: Mutex::new(Arc::downgrade(self)),
            child_notify: Notify::new(),
            memory: Mutex::new(Some(Arc::new(memory))),
            cwd: Mutex::new(self.cwd()),
            executable: Mutex::new(self.executable()),
            vfs_root: self.vfs_root.clone(),
            hostname: self.hostname.clone(),
            name: Mutex::new(self.name()),
            arguments: Mutex::new(self.arguments()),
            environment: Mutex::new(self.environment()),
            limits: Mutex::new(self.limits()),
        });

        registry.join_group(pid, pgid, sid)?;
        registry.register_process(child.clone());
        self.children.lock().insert(pid, child.clone());
        debug!("process {} forked {pid}", self.pid);

        let thread = Thread::new(pid, child, caller.entry(), caller.stack());
        registry.register_thread(thread.clone());
        Ok(thread)
    }

    pub fn getpgid(&self, registry: &ProcessRegistry, pid: u32) -> Result<u32> {
        if pid == 0 || pid == self.pid {
            return Ok(self.pgid());
        }
        Ok(registry.process(pid)?.pgid())
    }

    /// Move `pid` (this process or one of its children) into the group
    /// `pgid`. Zero stands for the target's own pid in both arguments.
    pub fn setpgid(self: &Arc<Self>, registry: &ProcessRegistry, pid: u32, pgid: u32) -> Result<()> {
        self.require_promise(Promises::PROC)?;

        let target = if pid == 0 || pid == self.pid {
            self.clone()
        } else {
            self.children.lock().get(&pid).cloned().ok_or(err!(Srch))?
        };
        let pgid = if pgid == 0 { target.pid } else { pgid };

        let sid = self.sid();
        let (target_pgid, target_sid) =
            target.with_protected_data(|values| (values.pgid.get(), values.sid.get()));
        ensure!(target_sid != target.pid, Perm);
        ensure!(target_sid == sid, Perm);
        if pgid != target.pid {
            ensure!(registry.group_session(pgid) == Some(sid), Perm);
        }
        if target_pgid == pgid {
            return Ok(());
        }

        registry.join_group(target.pid, pgid, sid)?;
        registry.leave_group(target.pid, target_pgid);
        target.with_mutable_protected_data(|values, window| {
            values.pgid.set(window, pgid);
        });
        Ok(())
    }

    /// Start a new session with the process as the leader of its only group.
    pub fn setsid(&self, registry: &ProcessRegistry) -> Result<u32> {
        self.require_promise(Promises::PROC)?;
        ensure!(registry.group_session(self.pid).is_none(), Perm);

        let old_pgid = self.pgid();
        registry.join_group(self.pid, self.pid, self.pid)?;
        registry.leave_group(self.pid, old_pgid);
        self.with_mutable_protected_data(|values, window| {
            values.pgid.set(window, self.pid);
            values.sid.set(window, self.pid);
        });
        Ok(self.pid)
    }

    /// Set the file mode creation mask and return the previous one.
    pub fn umask(&self, mask: FileMode) -> FileMode {
        let mask = mask & FileMode::ALL;
        self.with_mutable_protected_data(|values, window| values.umask.replace(window, mask))
    }

    /// Returns the action for `signal` and replaces it if `new` is given.
    pub fn sigaction(&self, signal: Signal, new: Option<Sigaction>) -> Result<Sigaction> {
        if new.is_some() {
            ensure!(signal != Signal::KILL && signal != Signal::STOP, Inval);
        }
        Ok(self.with_mutable_protected_data(|values, window| {
            let cell = values.signal_action(signal);
            match new {
                Some(new) => cell.replace(window, new),
                None => cell.get(),
            }
        }))
    }

    /// Returns whether `signal` would be ignored by the process.
    pub fn ignores(&self, signal: Signal) -> bool {
        let action = self.with_protected_data(|values| values.signal_action(signal).get());
        match action.handler {
            SigHandler::Ignore => true,
            SigHandler::Default => signal.default_action() == DefaultAction::Ignore,
            SigHandler::Handler(_) => false,
        }
    }

    pub fn set_dumpable(&self, dumpable: bool) {
        self.with_mutable_protected_data(|values, window| {
            values.dumpable.set(window, dumpable);
        });
    }

    /// Confine the process. Jails can't be left.
    pub fn enter_jail(&self) -> Result<()> {
        self.require_promise(Promises::JAIL)?;
        self.with_mutable_protected_data(|values, window| {
            if values.jailed.get() {
                bail!(Perm);
            }
            values.jailed.set(window, true);
            Ok(())
        })
    }
}

fn truncate_name(name: &[u8]) -> ArrayVec<u8, TASK_COMM_CAPACITY> {
    name.iter()
        .copied()
        .take(TASK_COMM_CAPACITY - 1)
        .collect()
}

/// The internals that the scheduler, the memory manager and coredump
/// generation need.
pub trait ProcessInternals {
    fn thread_ids(&self) -> Vec<u32>;

    fn address_space(&self) -> Option<Arc<VirtualMemory>>;

    fn should_generate_coredump(&self) -> bool;

    fn termination_signal(&self) -> Option<Signal>;

    fn is_dumpable(&self) -> bool;
}

impl ProcessInternals for Process {
    fn thread_ids(&self) -> Vec<u32> {
        self.threads.lock().keys().copied().collect()
    }

    fn address_space(&self) -> Option<Arc<VirtualMemory>> {
        self.memory.lock().clone()
    }

    fn should_generate_coredump(&self) -> bool {
        self.with_protected_data(|values| values.should_generate_coredump.get())
    }

    fn termination_signal(&self) -> Option<Signal> {
        self.with_protected_data(|values| values.termination_signal.get())
    }

    fn is_dumpable(&self) -> bool {
        self.with_protected_data(|values| values.dumpable.get())
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::{
        ProcessInternals, ProcessState,
        limits::{RLimit, Resource},
        pledge::Promises,
    };
    use crate::{
        error::ErrorKind,
        fs::{
            path::Path,
            unveil::{UnveilAccess, UnveilTarget},
        },
        testing::{CountingProtection, Fixture, NullFile, fixture, fixture_with_protection},
        user::{
            process::wait::{ExitStatus, WaitFilter},
            syscall::args::{FdFlags, FileMode, Signal, WaitOptions},
            thread::{SigHandler, Sigaction},
        },
    };

    #[test]
    fn pledge_violations_are_rejected_without_killing() {
        let Fixture { registry, thread, .. } = fixture();
        let process = thread.process();
        process
            .pledge(Some(Promises::STDIO | Promises::RPATH), None)
            .unwrap();

        assert_eq!(
            process.require_promise(Promises::WPATH).unwrap_err(),
            ErrorKind::Perm
        );
        assert_eq!(process.state(), ProcessState::Running);
        assert!(process.require_promise(Promises::RPATH).is_ok());
        assert_eq!(process.require_no_promises().unwrap_err(), ErrorKind::Perm);
        assert_eq!(
            process.fork(&registry, &thread).unwrap_err(),
            ErrorKind::Perm
        );
    }

    #[test]
    fn nested_protected_writes_toggle_once() {
        let protection = CountingProtection::default();
        let Fixture { thread, .. } = fixture_with_protection(protection.clone());
        let process = thread.process();
        let (unprotects, protects) = (protection.unprotects(), protection.protects());

        process.with_mutable_protected_data(|values, outer| {
            values.dumpable.set(outer, false);
            process.with_mutable_protected_data(|values, inner| {
                values.umask.set(inner, FileMode::empty());
            });
            process.set_dumpable(true);
        });

        assert_eq!(protection.unprotects(), unprotects + 1);
        assert_eq!(protection.protects(), protects + 1);
        assert!(process.is_dumpable());
    }

    #[test]
    fn exit_reaps_through_waitid() {
        let Fixture { registry, thread, .. } = fixture();
        let parent = thread.process();
        let child_thread = parent.fork(&registry, &thread).unwrap();
        let child = child_thread.process().clone();
        let fd = child
            .fdtable()
            .insert(NullFile::new(), FdFlags::empty(), child.fd_limit())
            .unwrap();

        child.exit(&registry, 3);
        assert_eq!(child.state(), ProcessState::Dead);
        assert!(child.address_space().is_none());
        assert_eq!(child.fdtable().get(fd).unwrap_err(), ErrorKind::BadF);
        assert!(registry.process(child.pid()).is_ok());

        let result = block_on(parent.waitid(
            &registry,
            WaitFilter::Pid(child.pid()),
            WaitOptions::EXITED,
        ))
        .unwrap()
        .unwrap();
        assert_eq!(result.pid, child.pid());
        assert_eq!(result.status, ExitStatus::Exited(3));
        assert_eq!(registry.process(child.pid()).unwrap_err(), ErrorKind::Srch);
    }

    #[test]
    fn fatal_signals_request_coredumps_only_if_dumpable() {
        let Fixture { registry, thread, .. } = fixture();
        let parent = thread.process();

        let dumping = parent.fork(&registry, &thread).unwrap().process().clone();
        dumping.terminate_due_to_signal(&registry, Signal::SEGV);
        assert!(dumping.should_generate_coredump());
        assert_eq!(dumping.termination_signal(), Some(Signal::SEGV));

        let private = parent.fork(&registry, &thread).unwrap().process().clone();
        private.set_dumpable(false);
        private.terminate_due_to_signal(&registry, Signal::SEGV);
        assert!(!private.should_generate_coredump());

        let terminated = parent.fork(&registry, &thread).unwrap().process().clone();
        terminated.terminate_due_to_signal(&registry, Signal::TERM);
        assert!(!terminated.should_generate_coredump());
    }

    #[test]
    fn fork_copies_the_sandbox() {
        let Fixture { registry, thread, .. } = fixture();
        let parent = thread.process();
        parent
            .pledge(
                Some(Promises::STDIO | Promises::PROC | Promises::RPATH),
                Some(Promises::STDIO),
            )
            .unwrap();
        let etc = Path::new(b"/etc").unwrap();
        parent
            .veil(UnveilTarget::Current)
            .unveil(&etc, UnveilAccess::READ)
            .unwrap();
        parent
            .veil(UnveilTarget::AfterExec)
            .unveil(&etc, UnveilAccess::BROWSE)
            .unwrap();
        parent
            .fdtable()
            .insert(NullFile::new(), FdFlags::empty(), parent.fd_limit())
            .unwrap();

        let child_thread = parent.fork(&registry, &thread).unwrap();
        let child = child_thread.process();
        assert_eq!(child.pledge_state(), parent.pledge_state());
        assert_eq!(*child.veil(UnveilTarget::Current), *parent.veil(UnveilTarget::Current));
        assert_eq!(
            *child.veil(UnveilTarget::AfterExec),
            *parent.veil(UnveilTarget::AfterExec)
        );
        assert_eq!(child.fdtable().open_count(), 1);
        assert_eq!(child.ppid(), parent.pid());
        assert_eq!(child.pgid(), parent.pgid());
        assert_eq!(child_thread.stack(), thread.stack());
        assert_eq!(parent.children(), [child.pid()]);
    }

    #[test]
    fn orphans_are_disowned_on_exit() {
        let Fixture { registry, thread, .. } = fixture();
        let parent = thread.process().clone();
        let child = parent.fork(&registry, &thread).unwrap().process().clone();

        parent.exit(&registry, 0);
        assert_eq!(child.ppid(), 0);
        assert!(child.parent().is_none());
        assert_eq!(parent.state(), ProcessState::Dead);
        assert_eq!(registry.process(parent.pid()).unwrap_err(), ErrorKind::Srch);

        child.exit(&registry, 0);
        assert_eq!(registry.process(child.pid()).unwrap_err(), ErrorKind::Srch);
    }

    #[test]
    fn last_thread_exit_finalizes() {
        let Fixture { registry, thread, .. } = fixture();
        let process = thread.process().clone();
        let worker = process.create_thread(&registry, 0x2000, None).unwrap();
        assert_eq!(process.thread_count(), 2);

        worker.exit(&registry, 0);
        assert_eq!(process.state(), ProcessState::Running);
        thread.exit(&registry, 0);
        assert_eq!(process.state(), ProcessState::Dead);
        assert_eq!(process.termination_status(), Some(0));
        assert!(registry.thread(thread.tid()).is_none());
    }

    #[test]
    fn process_groups_and_sessions() {
        let Fixture { registry, thread, .. } = fixture();
        let parent = thread.process();
        assert_eq!(parent.setsid(&registry).unwrap_err(), ErrorKind::Perm);

        let child = parent.fork(&registry, &thread).unwrap().process().clone();
        parent.setpgid(&registry, child.pid(), 0).unwrap();
        assert_eq!(child.pgid(), child.pid());
        assert_eq!(parent.getpgid(&registry, child.pid()).unwrap(), child.pid());
        assert_eq!(
            parent.setpgid(&registry, 0, 12345).unwrap_err(),
            ErrorKind::Perm
        );

        assert_eq!(child.setsid(&registry).unwrap_err(), ErrorKind::Perm);
        let grandchild_thread = child.fork(&registry, &child.threads()[0]).unwrap();
        let grandchild = grandchild_thread.process();
        assert_eq!(grandchild.setsid(&registry).unwrap(), grandchild.pid());
        assert_eq!(grandchild.sid(), grandchild.pid());
        assert_eq!(registry.group_members(child.pid()), [child.pid()]);
    }

    #[test]
    fn signal_actions() {
        let Fixture { thread, .. } = fixture();
        let process = thread.process();
        let handler = Sigaction {
            handler: SigHandler::Handler(0x1234),
            ..Sigaction::DEFAULT
        };

        assert_eq!(
            process.sigaction(Signal::KILL, Some(handler)).unwrap_err(),
            ErrorKind::Inval
        );
        assert_eq!(
            process.sigaction(Signal::USR1, Some(handler)).unwrap(),
            Sigaction::DEFAULT
        );
        assert_eq!(process.sigaction(Signal::USR1, None).unwrap(), handler);
        assert!(process.ignores(Signal::CHLD));
        assert!(!process.ignores(Signal::USR1));
    }

    #[test]
    fn umask_returns_the_previous_mask() {
        let Fixture { thread, .. } = fixture();
        let process = thread.process();
        let old = process.umask(FileMode::OTHER_WRITE);
        assert_eq!(old, FileMode::GROUP_WRITE | FileMode::OTHER_WRITE);
        assert_eq!(process.umask(old), FileMode::OTHER_WRITE);
    }

    #[test]
    fn jails_are_one_way() {
        let Fixture { thread, .. } = fixture();
        let process = thread.process();
        process.enter_jail().unwrap();
        assert!(process.is_jailed());
        assert_eq!(process.enter_jail().unwrap_err(), ErrorKind::Perm);
    }

    #[test]
    fn descriptor_limit_bounds_the_table() {
        let Fixture { thread, .. } = fixture();
        let process = thread.process();
        let limit = RLimit { soft: 2, hard: 2 };
        process.set_limit(Resource::NoFile, limit).unwrap();
        assert_eq!(process.fd_limit(), 2);

        let fdtable = process.fdtable();
        for _ in 0..2 {
            fdtable
                .insert(NullFile::new(), FdFlags::empty(), process.fd_limit())
                .unwrap();
        }
        assert_eq!(
            fdtable
                .insert(NullFile::new(), FdFlags::empty(), process.fd_limit())
                .unwrap_err(),
            ErrorKind::Mfile
        );

        let raised = RLimit { soft: 2, hard: 4 };
        assert_eq!(
            process.set_limit(Resource::NoFile, raised).unwrap_err(),
            ErrorKind::Perm
        );
    }
}
