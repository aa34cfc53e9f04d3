// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The handoff between a raw, externally-driven I/O completion (a readiness
//! callback, a completion-port result, a cancellation request) and the task
//! awaiting it.
//!
//! Goes through four states: `Idle` (constructed, nothing submitted yet),
//! `Submitted` (an operation is in flight), then exactly one of `Ready` or
//! `Cancelled`, and finally `Consumed` once the awaiting task has taken the
//! result. [`complete`](CompletionBridge::complete) and
//! [`cancel`](CompletionBridge::cancel) race over a single CAS out of
//! `Submitted`, so at most one of them ever wins — whichever result reaches
//! the task is the only one that ever will.

use crate::sync::WaitCell;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

const IDLE: u8 = 0;
const SUBMITTED: u8 = 1;
const READY: u8 = 2;
const CANCELLED: u8 = 3;
const CONSUMED: u8 = 4;

/// Why a [`CompletionBridge`] did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionError {
    /// [`cancel`](CompletionBridge::cancel) won the race over
    /// [`complete`](CompletionBridge::complete).
    Cancelled,
}

impl fmt::Display for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation was cancelled")
    }
}

impl std::error::Error for CompletionError {}

struct Inner<T> {
    state: AtomicU8,
    value: UnsafeCell<Option<T>>,
    waker: WaitCell,
}

// Safety: `value` is only written under a winning `Submitted -> Ready` CAS
// and only read under a winning `Ready -> Consumed` CAS; the two can never
// both succeed for the same transition, so there is never a concurrent
// reader and writer.
unsafe impl<T: Send> Sync for Inner<T> {}

/// A one-shot, at-most-once bridge between an external completion source
/// and the task polling it.
#[derive(Clone)]
pub struct CompletionBridge<T> {
    inner: Arc<Inner<T>>,
}

impl<T> CompletionBridge<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(IDLE),
                value: UnsafeCell::new(None),
                waker: WaitCell::new(),
            }),
        }
    }

    /// Marks an operation as in flight. Must be called exactly once before
    /// [`complete`](Self::complete) or [`cancel`](Self::cancel).
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn submit(&self) {
        self.inner
            .state
            .compare_exchange(IDLE, SUBMITTED, Ordering::AcqRel, Ordering::Acquire)
            .expect("CompletionBridge::submit called more than once");
    }

    /// Completes the bridge with `value`. Returns `false` if
    /// [`cancel`](Self::cancel) already won the race.
    pub fn complete(&self, value: T) -> bool {
        if self
            .inner
            .state
            .compare_exchange(SUBMITTED, READY, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Safety: this thread just won the only CAS that allows writing here.
        unsafe { *self.inner.value.get() = Some(value) };
        self.inner.waker.wake();
        true
    }

    /// Cancels the in-flight operation. Returns `false` if
    /// [`complete`](Self::complete) already won the race.
    pub fn cancel(&self) -> bool {
        if self
            .inner
            .state
            .compare_exchange(SUBMITTED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.inner.waker.wake();
        true
    }

    /// Polls for the bridge's result.
    ///
    /// # Panics
    ///
    /// Panics if polled again after already returning `Ready`.
    pub fn poll(&self, cx: &mut Context<'_>) -> Poll<Result<T, CompletionError>> {
        loop {
            match self.inner.state.load(Ordering::Acquire) {
                READY => {
                    if self
                        .inner
                        .state
                        .compare_exchange(READY, CONSUMED, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        continue;
                    }
                    // Safety: this thread just won the `Ready -> Consumed` CAS.
                    let value = unsafe { (*self.inner.value.get()).take() };
                    return Poll::Ready(Ok(value.expect("Ready state without a stored value")));
                }
                CANCELLED => {
                    if self
                        .inner
                        .state
                        .compare_exchange(CANCELLED, CONSUMED, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        continue;
                    }
                    return Poll::Ready(Err(CompletionError::Cancelled));
                }
                CONSUMED => panic!("CompletionBridge polled after completion"),
                _ /* IDLE | SUBMITTED */ => match self.inner.waker.poll_wait(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(_) => continue,
                },
            }
        }
    }
}

impl<T> Default for CompletionBridge<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    #[test]
    fn complete_wins_uncontested() {
        let bridge = CompletionBridge::new();
        bridge.submit();
        assert!(bridge.complete(7));
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(bridge.poll(&mut cx), Poll::Ready(Ok(7)));
    }

    #[test]
    fn cancel_after_complete_loses() {
        let bridge = CompletionBridge::new();
        bridge.submit();
        assert!(bridge.complete(1));
        assert!(!bridge.cancel());
    }

    #[test]
    fn cancel_wins_uncontested() {
        let bridge: CompletionBridge<()> = CompletionBridge::new();
        bridge.submit();
        assert!(bridge.cancel());
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(bridge.poll(&mut cx), Poll::Ready(Err(CompletionError::Cancelled)));
    }

    #[test]
    #[should_panic(expected = "more than once")]
    fn double_submit_panics() {
        let bridge: CompletionBridge<()> = CompletionBridge::new();
        bridge.submit();
        bridge.submit();
    }
}
