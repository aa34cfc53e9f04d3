// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-slot wait cell: at most one task can be waiting on it at a
//! time. The building block for [`oneshot`](super::oneshot)'s receiver half.

use crate::error::Closed;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

enum Slot {
    Empty,
    Waiting(Waker),
    Woken,
    Closed,
}

/// A single-slot waker cell supporting one waiter at a time.
///
/// A [`wake`](Self::wake) that arrives before anyone has started waiting is
/// not lost: the cell remembers it and the next [`poll_wait`](Self::poll_wait)
/// resolves immediately.
pub struct WaitCell {
    slot: Mutex<Slot>,
}

impl WaitCell {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Empty),
        }
    }

    /// Polls for a wake or close, registering `cx`'s waker if neither has
    /// happened yet.
    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<Result<(), Closed>> {
        let mut slot = self.lock();
        match &mut *slot {
            Slot::Woken => {
                *slot = Slot::Empty;
                Poll::Ready(Ok(()))
            }
            Slot::Closed => Poll::Ready(Err(Closed(()))),
            Slot::Empty => {
                *slot = Slot::Waiting(cx.waker().clone());
                Poll::Pending
            }
            Slot::Waiting(waker) => {
                if !waker.will_wake(cx.waker()) {
                    *waker = cx.waker().clone();
                }
                Poll::Pending
            }
        }
    }

    /// Wakes the current waiter, or remembers the wake for the next
    /// [`poll_wait`](Self::poll_wait) if nobody is waiting yet.
    pub fn wake(&self) {
        let mut slot = self.lock();
        match std::mem::replace(&mut *slot, Slot::Woken) {
            Slot::Waiting(waker) => waker.wake(),
            Slot::Closed => *slot = Slot::Closed,
            Slot::Empty | Slot::Woken => {}
        }
    }

    /// Closes the cell: the current waiter (if any) is woken to observe the
    /// close, and every future [`poll_wait`](Self::poll_wait) returns
    /// `Err(Closed)`.
    pub fn close(&self) {
        let mut slot = self.lock();
        if let Slot::Waiting(waker) = std::mem::replace(&mut *slot, Slot::Closed) {
            waker.wake();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for WaitCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    #[test]
    fn wake_before_poll_is_not_lost() {
        let cell = WaitCell::new();
        cell.wake();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(Ok(())));
    }

    #[test]
    fn poll_then_wake_resolves() {
        let cell = WaitCell::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(cell.poll_wait(&mut cx), Poll::Pending);
        cell.wake();
        assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(Ok(())));
    }

    #[test]
    fn close_is_sticky() {
        let cell = WaitCell::new();
        cell.close();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(Err(Closed(()))));
        assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(Err(Closed(()))));
    }
}
