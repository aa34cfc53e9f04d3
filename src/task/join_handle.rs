// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::task::{Id, TaskRef};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A handle to a spawned task, yielding its output once the task completes.
///
/// Dropping a `JoinHandle` detaches the task: it continues running to
/// completion in the background, and its output is discarded.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct JoinHandle<T> {
    raw: TaskRef,
    _t: PhantomData<fn() -> T>,
}

/// The reason a [`JoinHandle`] failed to produce the task's output.
#[derive(Debug)]
pub enum JoinError<T> {
    /// The task was cancelled via [`JoinHandle::abort`] or [`TaskRef::cancel`](crate::task::TaskRef::cancel).
    ///
    /// If the task had already produced an output before the cancellation was
    /// observed, that output is returned here rather than discarded.
    Cancelled { id: Id, output: Option<T> },
    /// The task's future panicked while being polled.
    Panic { id: Id, payload: Box<dyn Any + Send + 'static> },
}

impl JoinError<()> {
    /// Constructed with an erased `()` output at the point inside
    /// `Task::poll_join` where the real `F::Output` type isn't available yet;
    /// `TaskRef::poll_join` later threads the real output through via
    /// `with_output`.
    pub(crate) fn cancelled(completed: bool, id: Id) -> JoinError<()> {
        JoinError::Cancelled {
            id,
            output: if completed { Some(()) } else { None },
        }
    }
}

impl<T> JoinError<T> {
    pub(crate) fn panic(id: Id, payload: Box<dyn Any + Send + 'static>) -> Self {
        JoinError::Panic { id, payload }
    }

    pub(crate) fn is_completed(&self) -> bool {
        matches!(self, JoinError::Cancelled { output: Some(_), .. })
    }

    /// The ID of the task this error came from.
    #[must_use]
    pub fn id(&self) -> Id {
        match self {
            JoinError::Cancelled { id, .. } | JoinError::Panic { id, .. } => *id,
        }
    }

    /// Returns `true` if the task was cancelled rather than panicking.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JoinError::Cancelled { .. })
    }

    pub(crate) fn with_output(self, output: Option<T>) -> JoinError<T> {
        match self {
            JoinError::Cancelled { id, .. } => JoinError::Cancelled { id, output },
            JoinError::Panic { id, payload } => JoinError::Panic { id, payload },
        }
    }
}

impl<T> fmt::Display for JoinError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Cancelled { id, .. } => write!(f, "task {id} was cancelled"),
            JoinError::Panic { id, .. } => write!(f, "task {id} panicked"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for JoinError<T> {}

// === impl JoinHandle ===

impl<T> JoinHandle<T> {
    pub(crate) fn new(raw: TaskRef) -> Self {
        Self { raw, _t: PhantomData }
    }

    /// This task's unique ID.
    #[must_use]
    pub fn id(&self) -> Id {
        self.raw.id()
    }

    /// Marks the task as cancelled.
    ///
    /// Cancellation is cooperative: the task observes the flag on its next
    /// poll and terminates, it is not unwound or killed immediately. This
    /// method itself never blocks.
    pub fn abort(&self) {
        self.raw.cancel();
    }

    /// Returns `true` if the task has finished running.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.raw.is_complete()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: this `TaskRef` was created from a `Task<F, S>` whose
        // `F::Output` is `T` — the only way to construct a `JoinHandle<T>`
        // is through `TaskRef::new_allocated` in `spawn`, which ties the two
        // types together.
        unsafe { self.raw.poll_join::<T>(cx) }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").field("id", &self.id()).finish()
    }
}
