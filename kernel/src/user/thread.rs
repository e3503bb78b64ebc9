use core::{
    fmt::{self, Debug},
    ops::{BitAnd, BitOrAssign, Not, Range},
};

use alloc::sync::Arc;
use bit_field::BitField;
use bitflags::bitflags;
use log::debug;
use x86_64::VirtAddr;

use crate::{
    error::{Result, bail, ensure, err},
    rt::notify::{Notify, Wait},
    spin::mutex::Mutex,
    user::{process::Process, registry::ProcessRegistry, syscall::args::Signal},
};

pub struct Thread {
    // Immutable state.
    tid: u32,
    process: Arc<Process>,
    exit_notify: Notify,
    signal_notify: Notify,

    // Mutable state.
    state: Mutex<ThreadState>,
}

#[cfg(test)]
impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .finish_non_exhaustive()
    }
}

struct ThreadState {
    entry: u64,
    stack: Range<VirtAddr>,
    lifecycle: ThreadLifecycle,
    pending_signals: Sigset,
    detached: bool,
    exit_value: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadLifecycle {
    Runnable,
    Blocked(BlockReason),
    /// The thread was told to exit and will do so at its next safe point.
    Dying,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Futex,
    Join,
    Wait,
}

impl Thread {
    pub(crate) fn new(
        tid: u32,
        process: Arc<Process>,
        entry: u64,
        stack: Range<VirtAddr>,
    ) -> Arc<Self> {
        let thread = Arc::new(Self {
            tid,
            process: process.clone(),
            exit_notify: Notify::new(),
            signal_notify: Notify::new(),
            state: Mutex::new(ThreadState {
                entry,
                stack,
                lifecycle: ThreadLifecycle::Runnable,
                pending_signals: Sigset::empty(),
                detached: false,
                exit_value: None,
            }),
        });
        process.add_thread(&thread);
        thread
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    pub fn entry(&self) -> u64 {
        self.state.lock().entry
    }

    pub fn stack(&self) -> Range<VirtAddr> {
        self.state.lock().stack.clone()
    }

    /// Start over in a freshly loaded program image.
    pub(crate) fn reset_image(&self, entry: u64, stack: Range<VirtAddr>) {
        let mut guard = self.state.lock();
        guard.entry = entry;
        guard.stack = stack;
        guard.pending_signals = Sigset::empty();
    }

    pub fn lifecycle(&self) -> ThreadLifecycle {
        self.state.lock().lifecycle
    }

    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    pub fn exit_value(&self) -> Option<u64> {
        self.state.lock().exit_value
    }

    pub fn pending_signals(&self) -> Sigset {
        self.state.lock().pending_signals
    }

    /// Resolves once a signal is queued for the thread.
    pub fn wait_for_signal(&self) -> Wait<'_> {
        self.signal_notify.wait()
    }

    /// Queue a signal. `SIGKILL` additionally tells the thread to exit.
    pub fn queue_signal(&self, signal: Signal) {
        let mut guard = self.state.lock();
        if guard.lifecycle == ThreadLifecycle::Dead {
            return;
        }
        guard.pending_signals.add(signal);
        if signal == Signal::KILL {
            guard.lifecycle = ThreadLifecycle::Dying;
        }
        drop(guard);

        self.signal_notify.notify();
    }

    /// Run `future` while the thread is marked as blocked.
    pub async fn block_on<F>(&self, reason: BlockReason, future: F) -> F::Output
    where
        F: Future,
    {
        {
            let mut guard = self.state.lock();
            if guard.lifecycle == ThreadLifecycle::Runnable {
                guard.lifecycle = ThreadLifecycle::Blocked(reason);
            }
        }

        let output = future.await;

        let mut guard = self.state.lock();
        if guard.lifecycle == ThreadLifecycle::Blocked(reason) {
            guard.lifecycle = ThreadLifecycle::Runnable;
        }
        output
    }

    /// Returns `false` if the thread was already dead.
    fn mark_dead(&self, value: u64) -> bool {
        let mut guard = self.state.lock();
        if guard.lifecycle == ThreadLifecycle::Dead {
            return false;
        }
        guard.lifecycle = ThreadLifecycle::Dead;
        guard.exit_value = Some(value);
        true
    }

    /// Stop the thread.
    ///
    /// Joiners are woken up. Detached threads are forgotten right away,
    /// others stay registered until they're joined. The last thread of a
    /// process finalizes it.
    pub fn exit(self: &Arc<Self>, registry: &ProcessRegistry, value: u64) {
        if !self.mark_dead(value) {
            return;
        }
        debug!("thread {} exited with {value:#x}", self.tid);

        self.exit_notify.notify();
        if self.is_detached() {
            registry.remove_thread(self.tid);
        }
        self.process.thread_exited(registry, self);
    }

    fn sibling(&self, registry: &ProcessRegistry, tid: u32) -> Result<Arc<Thread>> {
        registry
            .thread(tid)
            .filter(|thread| Arc::ptr_eq(&thread.process, &self.process))
            .ok_or(err!(Srch))
    }

    /// Wait for another thread of the same process to exit and return its
    /// exit value.
    pub async fn join(&self, registry: &ProcessRegistry, tid: u32) -> Result<u64> {
        ensure!(tid != self.tid, Deadlk);
        let target = self.sibling(registry, tid)?;
        ensure!(!target.is_detached(), Inval);

        let value = self
            .block_on(BlockReason::Join, async {
                loop {
                    let wait = target.exit_notify.wait();
                    if let Some(value) = target.exit_value() {
                        break value;
                    }
                    wait.await;
                }
            })
            .await;

        // Only one joiner gets to collect the value.
        registry.remove_thread(tid).ok_or(err!(Srch))?;
        Ok(value)
    }

    /// Let another thread of the same process be forgotten as soon as it
    /// exits.
    pub fn detach(&self, registry: &ProcessRegistry, tid: u32) -> Result<()> {
        let target = self.sibling(registry, tid)?;
        let mut guard = target.state.lock();
        ensure!(!guard.detached, Inval);
        guard.detached = true;
        let dead = guard.lifecycle == ThreadLifecycle::Dead;
        drop(guard);

        if dead {
            registry.remove_thread(tid);
        }
        Ok(())
    }

    /// Send a signal to another thread of the same process. Without a signal
    /// this only checks that the thread exists.
    pub fn kill_thread(
        &self,
        registry: &ProcessRegistry,
        tid: u32,
        signal: Option<Signal>,
    ) -> Result<()> {
        let target = self.sibling(registry, tid)?;
        if target.lifecycle() == ThreadLifecycle::Dead {
            bail!(Srch);
        }
        if let Some(signal) = signal {
            target.queue_signal(signal);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Sigset(u64);

impl Sigset {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(!0)
    }

    pub fn add(&mut self, signal: Signal) {
        self.0.set_bit(signal.get() - 1, true);
    }

    pub fn remove(&mut self, signal: Signal) {
        self.0.set_bit(signal.get() - 1, false);
    }

    pub fn contains(&self, signal: Signal) -> bool {
        self.0.get_bit(signal.get() - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

impl BitOrAssign for Sigset {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Sigset {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl Not for Sigset {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

impl Debug for Sigset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug_set = f.debug_set();
        for i in 0..64 {
            if self.0.get_bit(i) {
                let signal = Signal::new(i as u8 + 1).map_err(|_| fmt::Error)?;
                debug_set.entry(&signal);
            }
        }
        debug_set.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigHandler {
    Default,
    Ignore,
    Handler(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sigaction {
    pub handler: SigHandler,
    pub flags: SigactionFlags,
    pub mask: Sigset,
}

impl Sigaction {
    pub const DEFAULT: Self = Self {
        handler: SigHandler::Default,
        flags: SigactionFlags::empty(),
        mask: Sigset::empty(),
    };

    /// The action after executing a new program. Handlers live in the old
    /// program's memory, so they're reset. Ignored signals stay ignored.
    pub fn after_exec(self) -> Self {
        match self.handler {
            SigHandler::Handler(_) => Self::DEFAULT,
            SigHandler::Default | SigHandler::Ignore => Self {
                handler: self.handler,
                ..Self::DEFAULT
            },
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SigactionFlags: u32 {
        const SIGINFO = 0x00000004;
        const ONSTACK = 0x08000000;
        const RESTART = 0x10000000;
        const NODEFER = 0x40000000;
        const RESETHAND = 0x80000000;
    }
}
