// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler::Schedule;
use crate::task::{Id, JoinHandle, Task, TaskRef};
use std::future::Future;

/// Builds and spawns a [`Task`] bound to a particular [`Schedule`]r.
///
/// This exists mostly to give tasks an optional name for diagnostics
/// (surfaced in `tracing` spans), in the same spirit as
/// `tokio::task::Builder`.
#[derive(Debug)]
pub struct TaskBuilder<S> {
    scheduler: S,
    name: Option<&'static str>,
}

impl<S: Schedule + Clone> TaskBuilder<S> {
    pub fn new(scheduler: S) -> Self {
        Self { scheduler, name: None }
    }

    #[must_use]
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    /// Allocates a task for `future`, returning the scheduler-owned
    /// [`TaskRef`] and the caller-owned [`JoinHandle`].
    ///
    /// The returned `TaskRef` has not been enqueued; the caller (normally
    /// [`Schedule::spawn`]) is responsible for pushing it onto a run queue.
    pub fn build<F>(self, future: F) -> (TaskRef, JoinHandle<F::Output>)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let id = Id::next();
        let span = match self.name {
            Some(name) => tracing::trace_span!("task", %id, name),
            None => tracing::trace_span!("task", %id),
        };
        let task = Box::new(Task::new(future, id, span, self.scheduler));
        TaskRef::new_allocated(task)
    }
}
