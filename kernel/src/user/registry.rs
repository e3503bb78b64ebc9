//! All live processes and threads.
//!
//! The registry is created once at boot and handed to every subsystem that
//! needs to look up processes or threads. There is no global instance.

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::{
    boxed::Box,
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    vec::Vec,
};
use log::trace;

use crate::{
    error::{Result, ensure, err},
    memory::protected::{PageProtection, SoftwareProtection},
    spin::mutex::Mutex,
    user::{futex::Futexes, process::Process, thread::Thread},
};

type ProtectionFactory = Box<dyn Fn() -> Box<dyn PageProtection> + Send + Sync>;

pub struct ProcessRegistry {
    /// Pids and tids are allocated from the same counter. The first thread
    /// of a process shares its id.
    next_id: AtomicU32,
    processes: Mutex<BTreeMap<u32, Arc<Process>>>,
    threads: Mutex<BTreeMap<u32, Arc<Thread>>>,
    groups: Mutex<BTreeMap<u32, ProcessGroup>>,
    futexes: Futexes,
    protection: ProtectionFactory,
}

struct ProcessGroup {
    sid: u32,
    members: BTreeSet<u32>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::with_protection(|| Box::new(SoftwareProtection::new()) as Box<dyn PageProtection>)
    }

    /// Use `protection` to guard the protected block of every new process.
    pub fn with_protection(
        protection: impl Fn() -> Box<dyn PageProtection> + Send + Sync + 'static,
    ) -> Self {
        Self {
            next_id: AtomicU32::new(1),
            processes: Mutex::new(BTreeMap::new()),
            threads: Mutex::new(BTreeMap::new()),
            groups: Mutex::new(BTreeMap::new()),
            futexes: Futexes::new(),
            protection: Box::new(protection),
        }
    }

    pub fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn new_protection(&self) -> Box<dyn PageProtection> {
        (self.protection)()
    }

    pub fn futexes(&self) -> &Futexes {
        &self.futexes
    }

    pub(crate) fn register_process(&self, process: Arc<Process>) {
        let pid = process.pid();
        let prev = self.processes.lock().insert(pid, process);
        assert!(prev.is_none(), "pid {pid} registered twice");
        trace!("registered process {pid}");
    }

    pub(crate) fn remove_process(&self, pid: u32) -> Option<Arc<Process>> {
        let process = self.processes.lock().remove(&pid);
        if process.is_some() {
            trace!("removed process {pid}");
        }
        process
    }

    pub fn process(&self, pid: u32) -> Result<Arc<Process>> {
        self.processes.lock().get(&pid).cloned().ok_or(err!(Srch))
    }

    /// A snapshot of all processes ordered by pid.
    pub fn processes(&self) -> Vec<Arc<Process>> {
        self.processes.lock().values().cloned().collect()
    }

    pub(crate) fn register_thread(&self, thread: Arc<Thread>) {
        let tid = thread.tid();
        let prev = self.threads.lock().insert(tid, thread);
        assert!(prev.is_none(), "tid {tid} registered twice");
    }

    pub(crate) fn remove_thread(&self, tid: u32) -> Option<Arc<Thread>> {
        self.threads.lock().remove(&tid)
    }

    pub fn thread(&self, tid: u32) -> Option<Arc<Thread>> {
        self.threads.lock().get(&tid).cloned()
    }

    /// Forget all threads belonging to `pid`.
    pub(crate) fn remove_threads_of(&self, pid: u32) {
        self.threads
            .lock()
            .retain(|_, thread| thread.process().pid() != pid);
    }

    /// Add `pid` to the group `pgid`, creating the group in session `sid`
    /// if it doesn't exist yet.
    ///
    /// Groups can't span sessions.
    pub(crate) fn join_group(&self, pid: u32, pgid: u32, sid: u32) -> Result<()> {
        let mut guard = self.groups.lock();
        let group = guard.entry(pgid).or_insert_with(|| ProcessGroup {
            sid,
            members: BTreeSet::new(),
        });
        ensure!(group.sid == sid, Perm);
        group.members.insert(pid);
        Ok(())
    }

    /// Remove `pid` from the group `pgid`. Empty groups are dropped.
    pub(crate) fn leave_group(&self, pid: u32, pgid: u32) {
        let mut guard = self.groups.lock();
        let Some(group) = guard.get_mut(&pgid) else {
            return;
        };
        group.members.remove(&pid);
        if group.members.is_empty() {
            guard.remove(&pgid);
        }
    }

    /// Returns the session of the group `pgid` if the group exists.
    pub fn group_session(&self, pgid: u32) -> Option<u32> {
        self.groups.lock().get(&pgid).map(|group| group.sid)
    }

    pub fn group_members(&self, pgid: u32) -> Vec<u32> {
        self.groups
            .lock()
            .get(&pgid)
            .map(|group| group.members.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}
