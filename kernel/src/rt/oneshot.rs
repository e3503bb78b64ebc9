//! A channel that transfers at most one value.

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

use alloc::sync::Arc;

use crate::spin::mutex::Mutex;

pub fn new<T>() -> (Sender<T>, Receiver<T>) {
    let state = Arc::new(Mutex::new(State::Empty));
    (Sender(state.clone()), Receiver(state))
}

enum State<T> {
    Empty,
    Waiting(Waker),
    Sent(T),
    Closed,
}

pub struct Sender<T>(Arc<Mutex<State<T>>>);

#[derive(Debug)]
pub struct SendError<T>(pub T);

impl<T> Sender<T> {
    /// Returns whether the receiving half is still around.
    pub fn can_send(&self) -> bool {
        !matches!(&*self.0.lock(), State::Closed)
    }

    pub fn send(self, value: T) -> Result<(), SendError<T>> {
        let mut guard = self.0.lock();
        let waker = match core::mem::replace(&mut *guard, State::Closed) {
            State::Closed => return Err(SendError(value)),
            State::Waiting(waker) => Some(waker),
            State::Empty => None,
            State::Sent(_) => unreachable!("a sender is consumed by sending"),
        };
        *guard = State::Sent(value);
        drop(guard);

        if let Some(waker) = waker {
            waker.wake();
        }

        Ok(())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut guard = self.0.lock();
        if matches!(&*guard, State::Sent(_)) {
            return;
        }

        let old_state = core::mem::replace(&mut *guard, State::Closed);
        drop(guard);
        if let State::Waiting(waker) = old_state {
            waker.wake();
        }
    }
}

pub struct Receiver<T>(Arc<Mutex<State<T>>>);

#[derive(Debug, PartialEq, Eq)]
pub struct RecvError;

impl<T> Receiver<T> {
    pub fn recv(self) -> Recv<T> {
        Recv(self)
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        *self.0.lock() = State::Closed;
    }
}

pub struct Recv<T>(Receiver<T>);

impl<T> Future for Recv<T> {
    type Output = Result<T, RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.0.0.lock();
        match core::mem::replace(&mut *guard, State::Closed) {
            State::Sent(value) => Poll::Ready(Ok(value)),
            State::Closed => Poll::Ready(Err(RecvError)),
            State::Empty | State::Waiting(_) => {
                *guard = State::Waiting(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}
