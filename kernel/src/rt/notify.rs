//! A primitive to send and subscribe to notifications.

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

use alloc::vec::Vec;

use crate::spin::mutex::Mutex;

pub struct Notify {
    state: Mutex<State>,
}

struct State {
    generation: u64,
    wakers: Vec<Waker>,
}

impl Notify {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(State {
                generation: 0,
                wakers: Vec::new(),
            }),
        }
    }

    /// Returns a `Future` that resolves after a subsequent call to
    /// [`Notify::notify`].
    ///
    /// The generation is recorded when this function is called, not when the
    /// future is first polled. Callers can therefore check a condition after
    /// calling `wait` and won't miss a notification sent in between.
    pub fn wait(&self) -> Wait<'_> {
        let start_generation = self.state.lock().generation;
        Wait {
            notify: self,
            start_generation,
        }
    }

    pub fn notify(&self) {
        let mut guard = self.state.lock();
        guard.generation += 1;
        let wakers = core::mem::take(&mut guard.wakers);
        drop(guard);

        for waker in wakers {
            waker.wake();
        }
    }
}

pub struct Wait<'a> {
    notify: &'a Notify,
    start_generation: u64,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.notify.state.lock();
        if guard.generation != self.start_generation {
            return Poll::Ready(());
        }

        if !guard.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            guard.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
