// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-value, single-producer single-consumer channel.

use crate::error::Closed;
use crate::sync::WaitCell;
use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

struct Inner<T> {
    value: UnsafeCell<Option<T>>,
    rx_waker: WaitCell,
}

// Safety: `value` is only written by `Sender::send` (at most once, before
// `rx_waker.wake()` is observable) and only read by `Receiver::poll_recv`
// after that wake has been observed — the `WaitCell`'s internal lock is the
// synchronization edge.
unsafe impl<T: Send> Sync for Inner<T> {}

/// The sending half of a [`channel`].
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

/// The receiving half of a [`channel`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

/// Creates a one-shot channel: a single value may be sent, and the receiver
/// resolves once it arrives (or the sender is dropped without sending).
#[must_use]
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        value: UnsafeCell::new(None),
        rx_waker: WaitCell::new(),
    });
    (
        Sender { inner: inner.clone() },
        Receiver { inner },
    )
}

impl<T> Sender<T> {
    /// Sends `value`, waking the receiver.
    ///
    /// `Sender` has no way to observe that the receiver was already dropped
    /// before calling this (there's nothing useful to do differently), so
    /// this never fails.
    pub fn send(self, value: T) {
        // Safety: the receiver cannot observe this write until `rx_waker`
        // reports a wake, which happens-after this store.
        unsafe { *self.inner.value.get() = Some(value) };
        self.inner.rx_waker.wake();
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.inner.rx_waker.close();
    }
}

impl<T> Future for Receiver<T> {
    type Output = Result<T, Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.inner.rx_waker.poll_wait(cx) {
            Poll::Ready(Ok(())) => {
                // Safety: a wake (not a close) only ever follows `send`'s write.
                let value = unsafe { (*this.inner.value.get()).take() };
                Poll::Ready(value.ok_or(Closed(())))
            }
            Poll::Ready(Err(Closed(()))) => {
                // The sender may have sent a value and then been dropped;
                // a close doesn't discard an already-delivered value.
                let value = unsafe { (*this.inner.value.get()).take() };
                match value {
                    Some(v) => Poll::Ready(Ok(v)),
                    None => Poll::Ready(Err(Closed(()))),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn send_then_recv() {
        let (tx, rx) = channel();
        tx.send(42);
        assert_eq!(block_on(rx), Ok(42));
    }

    #[test]
    fn dropped_sender_closes_receiver() {
        let (tx, rx) = channel::<i32>();
        drop(tx);
        assert_eq!(block_on(rx), Err(Closed(())));
    }
}
