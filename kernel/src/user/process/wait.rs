use alloc::sync::{Arc, Weak};
use log::debug;

use crate::{
    error::{Result, ensure, err},
    user::{registry::ProcessRegistry, syscall::args::{Signal, WaitOptions}},
};

use super::{Process, ProcessInternals, ProcessState};

/// The children a wait applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFilter {
    Any,
    Pid(u32),
    Pgid(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(u8),
    Killed(Signal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitResult {
    pub pid: u32,
    pub status: ExitStatus,
    pub core_dumped: bool,
}

impl Process {
    /// Wait for a child matching `filter` to die and collect it.
    ///
    /// With `NOHANG`, `None` is returned instead of waiting.
    pub async fn waitid(
        &self,
        registry: &ProcessRegistry,
        filter: WaitFilter,
        options: WaitOptions,
    ) -> Result<Option<WaitResult>> {
        loop {
            let wait = self.child_notify.wait();

            if let Some(result) = self.try_reap(registry, filter)? {
                return Ok(Some(result));
            }
            if options.contains(WaitOptions::NOHANG) {
                return Ok(None);
            }

            wait.await;
        }
    }

    fn try_reap(&self, registry: &ProcessRegistry, filter: WaitFilter) -> Result<Option<WaitResult>> {
        let mut guard = self.children.lock();
        match filter {
            WaitFilter::Any => ensure!(!guard.is_empty(), Child),
            WaitFilter::Pid(pid) => ensure!(guard.contains_key(&pid), Srch),
            WaitFilter::Pgid(pgid) => {
                ensure!(guard.values().any(|child| child.pgid() == pgid), Child)
            }
        }

        let dead = guard
            .values()
            .filter(|child| match filter {
                WaitFilter::Any => true,
                WaitFilter::Pid(pid) => child.pid == pid,
                WaitFilter::Pgid(pgid) => child.pgid() == pgid,
            })
            .find(|child| child.state() == ProcessState::Dead)
            .map(|child| child.pid);
        let Some(pid) = dead else {
            return Ok(None);
        };
        let child = guard.remove(&pid).ok_or(err!(Srch))?;
        drop(guard);

        registry.remove_process(pid);
        let result = child.wait_result();
        debug!("process {} reaped {pid}: {:?}", self.pid, result.status);
        Ok(Some(result))
    }

    fn wait_result(&self) -> WaitResult {
        let status = match self.termination_signal() {
            Some(signal) => ExitStatus::Killed(signal),
            None => ExitStatus::Exited(self.termination_status().unwrap_or(0)),
        };
        WaitResult {
            pid: self.pid,
            status,
            core_dumped: self.should_generate_coredump(),
        }
    }

    /// Give up the right to collect the child `pid`.
    pub fn disown(&self, registry: &ProcessRegistry, pid: u32) -> Result<()> {
        let child: Arc<Process> = self.children.lock().remove(&pid).ok_or(err!(Child))?;
        *child.parent.lock() = Weak::new();
        child.with_mutable_protected_data(|values, window| {
            values.ppid.set(window, 0);
        });
        if child.state() == ProcessState::Dead {
            registry.remove_process(pid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::{FutureExt, executor::block_on};

    use super::{ExitStatus, WaitFilter};
    use crate::{
        error::ErrorKind,
        testing::{Fixture, fixture},
        user::syscall::args::{Signal, WaitOptions},
    };

    #[test]
    fn nohang_returns_nothing_for_live_children() {
        let Fixture { registry, thread, .. } = fixture();
        let parent = thread.process();
        assert_eq!(
            block_on(parent.waitid(&registry, WaitFilter::Any, WaitOptions::NOHANG)).unwrap_err(),
            ErrorKind::Child
        );

        parent.fork(&registry, &thread).unwrap();
        assert_eq!(
            block_on(parent.waitid(&registry, WaitFilter::Any, WaitOptions::NOHANG)).unwrap(),
            None
        );
    }

    #[test]
    fn blocked_waiters_are_woken_by_exits() {
        let Fixture { registry, thread, .. } = fixture();
        let parent = thread.process();
        let child = parent.fork(&registry, &thread).unwrap().process().clone();

        let mut wait = parent
            .waitid(&registry, WaitFilter::Any, WaitOptions::EXITED)
            .boxed_local();
        assert!(wait.as_mut().now_or_never().is_none());

        child.terminate_due_to_signal(&registry, Signal::KILL);
        let result = wait.now_or_never().unwrap().unwrap().unwrap();
        assert_eq!(result.pid, child.pid());
        assert_eq!(result.status, ExitStatus::Killed(Signal::KILL));
        assert!(!result.core_dumped);
    }

    #[test]
    fn reaped_children_are_gone() {
        let Fixture { registry, thread, .. } = fixture();
        let parent = thread.process();
        let child = parent.fork(&registry, &thread).unwrap().process().clone();
        child.exit(&registry, 0);

        block_on(parent.waitid(&registry, WaitFilter::Pid(child.pid()), WaitOptions::EXITED))
            .unwrap()
            .unwrap();
        assert_eq!(
            block_on(parent.waitid(&registry, WaitFilter::Pid(child.pid()), WaitOptions::EXITED))
                .unwrap_err(),
            ErrorKind::Srch
        );
        assert_eq!(registry.process(child.pid()).unwrap_err(), ErrorKind::Srch);
    }

    #[test]
    fn groups_can_be_waited_for() {
        let Fixture { registry, thread, .. } = fixture();
        let parent = thread.process();
        let child = parent.fork(&registry, &thread).unwrap().process().clone();
        parent.setpgid(&registry, child.pid(), 0).unwrap();
        child.exit(&registry, 7);

        assert_eq!(
            block_on(parent.waitid(&registry, WaitFilter::Pgid(parent.pgid()), WaitOptions::NOHANG))
                .unwrap_err(),
            ErrorKind::Child
        );
        let result = block_on(parent.waitid(
            &registry,
            WaitFilter::Pgid(child.pid()),
            WaitOptions::NOHANG,
        ))
        .unwrap()
        .unwrap();
        assert_eq!(result.status, ExitStatus::Exited(7));
    }

    #[test]
    fn disowned_children_clean_up_after_themselves() {
        let Fixture { registry, thread, .. } = fixture();
        let parent = thread.process();
        let child = parent.fork(&registry, &thread).unwrap().process().clone();

        parent.disown(&registry, child.pid()).unwrap();
        assert_eq!(parent.disown(&registry, child.pid()).unwrap_err(), ErrorKind::Child);
        assert_eq!(child.ppid(), 0);

        child.exit(&registry, 0);
        assert_eq!(registry.process(child.pid()).unwrap_err(), ErrorKind::Srch);
    }
}
