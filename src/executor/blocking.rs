// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A bounded, grow-on-demand thread pool for synchronous work that would
//! otherwise stall a worker's cooperative loop.
//!
//! Unlike the worker pool, threads here are not permanently pinned to a run
//! queue: each one blocks on a shared job queue, runs one closure, and goes
//! back to waiting. Idle threads are kept alive briefly in case more work
//! arrives before exiting, so a bursty caller doesn't pay thread-spawn cost
//! on every call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// How long an idle blocking-pool thread waits for new work before exiting.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    condvar: Condvar,
    shutdown: std::sync::atomic::AtomicBool,
    spawned: AtomicUsize,
    max_threads: usize,
    thread_name_prefix: String,
}

/// Handle to the blocking pool; cheap to clone, shared by every worker and
/// by the [`Runtime`](super::Runtime) itself.
#[derive(Clone)]
pub(crate) struct BlockingPool {
    shared: Arc<Shared>,
}

impl BlockingPool {
    pub(crate) fn new(max_threads: usize, thread_name_prefix: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                condvar: Condvar::new(),
                shutdown: std::sync::atomic::AtomicBool::new(false),
                spawned: AtomicUsize::new(0),
                max_threads,
                thread_name_prefix: format!("{thread_name_prefix}-blocking"),
            }),
        }
    }

    /// Queues `job`, spawning a fresh thread to service it if every existing
    /// thread is busy and the pool is under its cap.
    ///
    /// If the pool is already at `max_threads` and all of them are busy, the
    /// job waits in the queue until one frees up — this is a deliberate
    /// backpressure point, not an error (there is no bound on how long a
    /// caller may wait, only on the number of OS threads in flight).
    pub(crate) fn spawn(&self, job: Job) {
        let mut queue = self.shared.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        queue.push_back(job);

        if self.shared.spawned.load(Ordering::Acquire) < self.shared.max_threads {
            self.shared.spawned.fetch_add(1, Ordering::AcqRel);
            drop(queue);
            self.spawn_worker();
        } else {
            drop(queue);
            self.shared.condvar.notify_one();
        }
    }

    fn spawn_worker(&self) {
        let shared = self.shared.clone();
        let name = format!("{}-{}", shared.thread_name_prefix, shared.spawned.load(Ordering::Relaxed));
        let built = thread::Builder::new().name(name).spawn(move || Self::run_worker(&shared));
        if built.is_err() {
            // Couldn't get an OS thread; give the slot back so a later call
            // can retry instead of permanently under-counting capacity.
            shared.spawned.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn run_worker(shared: &Arc<Shared>) {
        loop {
            let job = {
                let mut queue = shared.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                loop {
                    if let Some(job) = queue.pop_front() {
                        break Some(job);
                    }
                    if shared.shutdown.load(Ordering::Acquire) {
                        break None;
                    }
                    let (guard, result) = shared
                        .condvar
                        .wait_timeout(queue, IDLE_TIMEOUT)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    queue = guard;
                    if result.timed_out() && queue.is_empty() {
                        break None;
                    }
                }
            };

            match job {
                Some(job) => {
                    // A panicking job must not tear down the whole pool;
                    // the caller observes it through the oneshot channel
                    // never being fulfilled, which closes their JoinHandle.
                    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
                }
                None => {
                    shared.spawned.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
            }
        }
    }

    pub(crate) fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_a_queued_job() {
        let pool = BlockingPool::new(4, "test");
        let (tx, rx) = mpsc::channel();
        pool.spawn(Box::new(move || tx.send(42).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
        pool.shutdown();
    }

    #[test]
    fn caps_concurrent_threads() {
        let pool = BlockingPool::new(2, "test");
        for _ in 0..10 {
            pool.spawn(Box::new(|| {}));
        }
        std::thread::sleep(Duration::from_millis(50));
        assert!(pool.shared.spawned.load(Ordering::Acquire) <= 2);
        pool.shutdown();
    }
}
