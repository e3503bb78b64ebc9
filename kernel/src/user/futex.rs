use core::{fmt, num::NonZeroU32};

use alloc::{collections::BTreeMap, vec::Vec};

use crate::{
    error::{Result, ensure},
    rt::oneshot,
    spin::mutex::Mutex,
    user::memory::FutexWord,
};

/// The identity of a futex word.
///
/// Shared keys name a word by the object backing it, private keys by the
/// address space and the address. A shared key never equals a private one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GlobalFutexKey {
    Shared { object: u64, offset: u64 },
    Private { address_space: u64, address: u64 },
}

impl GlobalFutexKey {
    /// The two-word representation used in log messages.
    pub fn raw(&self) -> [u64; 2] {
        match *self {
            GlobalFutexKey::Shared { object, offset } => [object, offset],
            GlobalFutexKey::Private {
                address_space,
                address,
            } => [address_space, address],
        }
    }
}

impl fmt::Display for GlobalFutexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b] = self.raw();
        let kind = match self {
            GlobalFutexKey::Shared { .. } => "shared",
            GlobalFutexKey::Private { .. } => "private",
        };
        write!(f, "{kind}:{a:#x}:{b:#x}")
    }
}

/// The waiters of all futexes, keyed by [`GlobalFutexKey`].
pub struct Futexes {
    futexes: Mutex<BTreeMap<GlobalFutexKey, Vec<FutexWaiter>>>,
}

impl Futexes {
    pub fn new() -> Self {
        Self {
            futexes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Start waiting on `key` if `word` still contains `val`.
    ///
    /// The returned future resolves once a matching wake happens. Dropping it
    /// cancels the wait.
    pub fn wait(
        &self,
        key: GlobalFutexKey,
        word: &FutexWord,
        val: u32,
        bitset: Option<NonZeroU32>,
    ) -> Result<impl Future<Output = ()> + 'static> {
        // Check if the value already changed. This can help avoid taking the lock.
        ensure!(word.load()? == val, Again);

        let mut guard = self.futexes.lock();

        // Now that we've taken the lock, we need to check again.
        ensure!(word.load()? == val, Again);

        let (sender, receiver) = oneshot::new();
        guard
            .entry(key)
            .or_default()
            .push(FutexWaiter { sender, bitset });
        drop(guard);

        Ok(async move {
            // The sender is only dropped after sending.
            let _ = receiver.recv().await;
        })
    }

    /// Wake up to `num_waiters` waiters of `key` and return how many were
    /// woken.
    pub fn wake(&self, key: GlobalFutexKey, num_waiters: u32, bitset: Option<NonZeroU32>) -> u32 {
        if num_waiters == 0 {
            return 0;
        }

        let mut woken = 0;

        let mut guard = self.futexes.lock();
        if let Some(waiters) = guard.get_mut(&key) {
            // Forget about waiters that canceled.
            waiters.retain(|waiter| waiter.sender.can_send());

            for waiter in waiters.extract_if(.., |waiter| waiter.matches(bitset)) {
                // Wake up the thread.
                if waiter.sender.send(()).is_err() {
                    // The thread has already canceled the operation.
                    continue;
                }
                // Record that the thread was woken up.
                woken += 1;
                if woken >= num_waiters {
                    break;
                }
            }

            if waiters.is_empty() {
                guard.remove(&key);
            }
        }

        woken
    }

    /// The number of threads waiting on `key`.
    pub fn num_waiters(&self, key: GlobalFutexKey) -> usize {
        self.futexes.lock().get(&key).map_or(0, |waiters| {
            waiters
                .iter()
                .filter(|waiter| waiter.sender.can_send())
                .count()
        })
    }
}

impl Default for Futexes {
    fn default() -> Self {
        Self::new()
    }
}

struct FutexWaiter {
    sender: oneshot::Sender<()>,
    bitset: Option<NonZeroU32>,
}

impl FutexWaiter {
    fn matches(&self, bitset: Option<NonZeroU32>) -> bool {
        self.bitset
            .zip(bitset)
            .is_none_or(|(lhs, rhs)| lhs.get() & rhs.get() != 0)
    }
}
