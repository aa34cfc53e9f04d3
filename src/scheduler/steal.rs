// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cross-worker work stealing on top of [`crossbeam_deque`].
//!
//! Each worker owns a bounded power-of-two local deque
//! (`crossbeam_deque::Worker`): the owner pushes and pops from the same end
//! (LIFO, cheap cache reuse for a task that keeps yielding back to itself),
//! while every other worker can only steal from the opposite end (FIFO,
//! taking the oldest runnable task first so stolen work doesn't starve).

use crate::executor::Shared;
use crate::task::TaskRef;
use crossbeam_deque::Steal;
use std::marker::PhantomData;
use std::sync::Arc;

/// Why a steal attempt did not hand back a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryStealError {
    /// Every queue (the injector and every sibling local deque) was empty.
    NoTasks,
    /// A steal raced with a concurrent push/pop and should be retried; after
    /// exhausting retries against every queue, the caller should park.
    Busy,
}

/// A capability to steal tasks into a particular worker's local queue.
///
/// Borrowed from the scheduler's shared state; cheap to acquire and safe to
/// hold across several steal attempts within one scheduling tick.
pub struct Stealer<S> {
    shared: Arc<Shared>,
    /// Index of the worker this capability steals *for*; used to skip
    /// self-stealing from its own stealer handle.
    owner: usize,
    _scheduler: PhantomData<fn() -> S>,
}

impl<S> Stealer<S> {
    pub(crate) fn new(shared: Arc<Shared>, owner: usize) -> Self {
        Self {
            shared,
            owner,
            _scheduler: PhantomData,
        }
    }

    /// Attempts to steal one batch of work into `local`, returning the first
    /// task from that batch to run immediately.
    ///
    /// Tries the global injector first (so overflow work spreads out before
    /// workers start stealing from each other), then every sibling worker's
    /// local deque in turn.
    pub fn steal_into(&self, local: &crossbeam_deque::Worker<TaskRef>) -> Result<TaskRef, TryStealError> {
        let mut contended = false;

        loop {
            match self.shared.injector.steal_batch_and_pop(local) {
                Steal::Success(task) => return Ok(task),
                Steal::Retry => {
                    contended = true;
                    continue;
                }
                Steal::Empty => break,
            }
        }

        for (i, stealer) in self.shared.stealers.iter().enumerate() {
            if i == self.owner {
                continue;
            }
            match stealer.steal_batch_and_pop(local) {
                Steal::Success(task) => return Ok(task),
                Steal::Retry => contended = true,
                Steal::Empty => {}
            }
        }

        if contended {
            Err(TryStealError::Busy)
        } else {
            Err(TryStealError::NoTasks)
        }
    }
}
