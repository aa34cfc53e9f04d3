// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A queue of parked tasks, for building `Notify`/condvar-style signals.
//!
//! Waiting is deliberately *not* lock-free: a waiting future can be dropped
//! (cancelled) at any point, and removing it from wherever it's parked has
//! to happen without racing a concurrent [`wake_one`](WaitQueue::wake_one)
//! that might be looking at the exact same slot. A `Mutex` around the list
//! makes that removal trivially correct; the only thing kept lock-free is
//! the fast path for "is anyone waiting at all".

use crate::error::Closed;
use crate::sync::WakeBatch;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

struct Waiter {
    waker: Mutex<Option<Waker>>,
    woken: AtomicBool,
}

/// A queue of tasks parked on [`WaitQueue::wait`].
pub struct WaitQueue {
    closed: AtomicBool,
    waiters: Mutex<VecDeque<Arc<Waiter>>>,
}

impl WaitQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns a future that resolves once this queue wakes it (via
    /// [`wake_one`](Self::wake_one) or [`wake_all`](Self::wake_all)), or
    /// immediately with `Err(Closed)` if the queue is already closed.
    pub fn wait(&self) -> Wait<'_> {
        Wait { queue: self, waiter: None }
    }

    /// Wakes the longest-waiting task, if any.
    pub fn wake_one(&self) {
        let mut waiters = self.lock();
        while let Some(waiter) = waiters.pop_front() {
            if waiter.woken.swap(true, Ordering::AcqRel) {
                continue;
            }
            if let Some(waker) = waiter.waker.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
                drop(waiters);
                waker.wake();
                return;
            }
        }
    }

    /// Wakes every currently-waiting task.
    pub fn wake_all(&self) {
        let mut batch = WakeBatch::new();
        let mut waiters = self.lock();
        for waiter in waiters.drain(..) {
            if waiter.woken.swap(true, Ordering::AcqRel) {
                continue;
            }
            if let Some(waker) = waiter.waker.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
                if !batch.add_waker(waker) {
                    break;
                }
            }
        }
        drop(waiters);
        batch.wake_all();
    }

    /// Closes the queue: every currently-waiting task is woken to observe
    /// the close, and every future [`wait`](Self::wait) resolves immediately
    /// with `Err(Closed)`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<Waiter>>> {
        self.waiters.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A future returned by [`WaitQueue::wait`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<'a> {
    queue: &'a WaitQueue,
    waiter: Option<Arc<Waiter>>,
}

impl Future for Wait<'_> {
    type Output = Result<(), Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.queue.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(Closed(())));
        }

        match &this.waiter {
            None => {
                let waiter = Arc::new(Waiter {
                    waker: Mutex::new(Some(cx.waker().clone())),
                    woken: AtomicBool::new(false),
                });
                this.queue.lock().push_back(waiter.clone());
                this.waiter = Some(waiter);
                Poll::Pending
            }
            Some(waiter) => {
                if waiter.woken.load(Ordering::Acquire) {
                    return Poll::Ready(Ok(()));
                }
                let mut slot = waiter.waker.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                match slot.as_mut() {
                    Some(w) if !w.will_wake(cx.waker()) => *w = cx.waker().clone(),
                    Some(_) => {}
                    None => *slot = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        let Some(waiter) = self.waiter.take() else {
            return;
        };
        if waiter.woken.load(Ordering::Acquire) {
            // Already consumed by a wake; nothing left to remove.
            return;
        }
        let mut waiters = self.queue.lock();
        waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn wake_one_wakes_a_single_waiter() {
        let queue = Arc::new(WaitQueue::new());
        let woken = Arc::new(AtomicUsize::new(0));

        let q1 = queue.clone();
        let w1 = woken.clone();
        let t1 = std::thread::spawn(move || {
            block_on(q1.wait()).unwrap();
            w1.fetch_add(1, Ordering::SeqCst);
        });

        // give the waiter a chance to register
        std::thread::sleep(std::time::Duration::from_millis(20));
        queue.wake_one();
        t1.join().unwrap();
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_wakes_everyone_with_an_error() {
        let queue = Arc::new(WaitQueue::new());
        let q1 = queue.clone();
        let t1 = std::thread::spawn(move || block_on(q1.wait()));
        std::thread::sleep(std::time::Duration::from_millis(20));
        queue.close();
        assert_eq!(t1.join().unwrap(), Err(Closed(())));
        assert_eq!(block_on(queue.wait()), Err(Closed(())));
    }

    #[test]
    fn dropping_a_waiter_removes_it() {
        let queue = WaitQueue::new();
        {
            let fut = queue.wait();
            futures::pin_mut!(fut);
            let waker = futures::task::noop_waker();
            let mut cx = Context::from_waker(&waker);
            assert_eq!(fut.as_mut().poll(&mut cx), Poll::Pending);
        }
        assert!(queue.lock().is_empty());
    }
}
