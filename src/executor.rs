// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The work-stealing runtime: a fixed pool of worker threads, each with its
//! own local run queue, backed by a shared global injector for overflow and
//! newly-spawned-from-outside tasks.
//!
//! Each worker's main loop, every tick:
//!
//! 1. Every [`Config::global_queue_interval`] ticks, check the global
//!    injector first, so work parked there doesn't starve behind a worker
//!    that never empties its own queue.
//! 2. Otherwise check the single-task LIFO slot, bounded to
//!    [`MAX_LIFO_POLLS`] consecutive hits so a self-waking chain of tasks
//!    can't starve the local deque.
//! 3. Otherwise pop from the local deque (LIFO end).
//! 4. If all of the above come up empty, try to steal a batch from the
//!    injector or a sibling worker's deque.
//! 5. Poll whatever task was found; a task that rescheduled itself mid-poll
//!    (it observed its own wake while running) goes into the LIFO slot,
//!    bumping anything already there into the local deque.
//! 6. If nothing was found anywhere, park until unparked by a wake.

mod blocking;

use crate::scheduler::steal::{Stealer, TryStealError};
use crate::scheduler::{Schedule, Tick};
use crate::task::{self, JoinHandle, PollResult, TaskRef};
use blocking::BlockingPool;
use crossbeam_deque::{Injector, Steal, Worker as LocalQueue};
use std::cell::Cell;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// A self-waking task is allowed to occupy the LIFO slot this many
/// consecutive times before the local deque gets priority, bounding how long
/// a "hot" chain of tasks can delay everything else.
const MAX_LIFO_POLLS: u8 = 3;

/// How long an idle worker waits on the park condvar before re-checking for
/// work on its own; a safety net against a missed wakeup, not the primary
/// signaling path.
const PARK_TIMEOUT: Duration = Duration::from_millis(50);

/// Runtime configuration. See [`Runtime::build`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker threads. Defaults to the available parallelism, or
    /// `1` if that can't be determined.
    pub worker_threads: usize,
    /// How often (in scheduler ticks) a worker checks the global injector
    /// ahead of its own local deque.
    pub global_queue_interval: u32,
    /// Prefix used for worker thread names (`"{prefix}-{index}"`).
    pub thread_name_prefix: String,
    /// Stack size for worker threads, in bytes. `None` uses the platform
    /// default.
    pub thread_stack_size: Option<usize>,
    /// Maximum number of OS threads the blocking pool ([`Runtime::spawn_blocking`])
    /// will grow to.
    pub blocking_pool_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            global_queue_interval: 61,
            thread_name_prefix: "kestrel-worker".to_owned(),
            thread_stack_size: None,
            blocking_pool_max: 512,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) injector: Injector<TaskRef>,
    pub(crate) stealers: Vec<crossbeam_deque::Stealer<TaskRef>>,
    park_lock: Mutex<()>,
    park_condvar: Condvar,
    idle: AtomicUsize,
    shutdown: AtomicBool,
    outstanding: AtomicUsize,
    global_queue_interval: u32,
}

impl Shared {
    fn notify(&self) {
        if self.idle.load(Ordering::Acquire) > 0 {
            self.park_condvar.notify_all();
        }
    }

    fn park(&self) {
        self.idle.fetch_add(1, Ordering::AcqRel);
        let guard = self.park_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let _ = self.park_condvar.wait_timeout(guard, PARK_TIMEOUT);
        self.idle.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The per-worker handle stored inside every [`Task`](crate::task) spawned
/// through it; implements [`Schedule`].
///
/// Cheap to clone (an `Arc` bump and a `usize`); every worker holds one
/// bound to its own queue, so waking a task from inside the worker that
/// originally spawned it can push straight onto that worker's local deque
/// instead of round-tripping through the global injector.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
    worker_id: usize,
}

impl Handle {
    fn push(&self, task: TaskRef) {
        if let Some(ctx) = current_context() {
            if ctx.id == self.worker_id {
                ctx.local.push(task);
                self.shared.notify();
                return;
            }
        }
        self.shared.injector.push(task);
        self.shared.notify();
    }
}

impl Schedule for Handle {
    fn current_task(&self) -> Option<TaskRef> {
        let ctx = current_context()?;
        let task = ctx.current.take()?;
        let clone = task.clone();
        ctx.current.set(Some(task));
        Some(clone)
    }

    fn wake(&self, task: TaskRef) {
        self.push(task);
    }

    fn spawn(&self, task: TaskRef) {
        self.shared.outstanding.fetch_add(1, Ordering::Relaxed);
        self.push(task);
    }

    fn tick_n(&self, n: usize) -> Tick {
        let ctx = current_context().expect("Schedule::tick_n called off a worker thread");
        let mut tick = Tick::default();
        for _ in 0..n {
            let Some(task) = ctx.next_task(&self.shared) else {
                break;
            };
            let completed = ctx.run_task(task, &self.shared);
            tick.record(completed);
        }
        tick
    }

    fn try_steal(&self) -> Result<Stealer<Self>, TryStealError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(TryStealError::Busy);
        }
        Ok(Stealer::new(self.shared.clone(), self.worker_id))
    }
}

struct WorkerContext {
    id: usize,
    local: LocalQueue<TaskRef>,
    current: Cell<Option<TaskRef>>,
    lifo_slot: Cell<Option<TaskRef>>,
    lifo_polls: Cell<u8>,
    tick: Cell<u64>,
}

impl WorkerContext {
    fn next_task(&self, shared: &Shared) -> Option<TaskRef> {
        let tick = self.tick.get().wrapping_add(1);
        self.tick.set(tick);

        if tick % u64::from(shared.global_queue_interval) == 0 {
            if let Steal::Success(task) = shared.injector.steal_batch_and_pop(&self.local) {
                return Some(task);
            }
        }

        if self.lifo_polls.get() < MAX_LIFO_POLLS {
            if let Some(task) = self.lifo_slot.take() {
                self.lifo_polls.set(self.lifo_polls.get() + 1);
                return Some(task);
            }
        } else {
            self.lifo_polls.set(0);
        }

        self.local.pop()
    }

    /// Polls `task` to completion of this poll, placing it back wherever its
    /// [`PollResult`] indicates. Returns whether the task finished running.
    fn run_task(&self, task: TaskRef, shared: &Shared) -> bool {
        self.current.set(Some(task.clone()));
        let result = task.poll();
        self.current.set(None);

        match result {
            PollResult::Ready | PollResult::ReadyJoined => {
                shared.outstanding.fetch_sub(1, Ordering::Relaxed);
                true
            }
            PollResult::Pending => false,
            PollResult::PendingSchedule => {
                if let Some(bumped) = self.lifo_slot.replace(Some(task)) {
                    self.local.push(bumped);
                }
                false
            }
        }
    }
}

thread_local! {
    static CONTEXT: Cell<*const WorkerContext> = const { Cell::new(std::ptr::null()) };
}

fn current_context() -> Option<&'static WorkerContext> {
    let ptr = CONTEXT.with(Cell::get);
    if ptr.is_null() {
        return None;
    }
    // Safety: only ever set non-null by `enter_context` for the duration it
    // holds a live borrow of a `WorkerContext` owned by this same thread's
    // stack; the guard clears it again before that borrow ends.
    Some(unsafe { &*ptr })
}

/// Whether the calling thread is currently running a worker's main loop.
pub(crate) fn is_worker_thread() -> bool {
    current_context().is_some()
}

fn enter_context<R>(ctx: &WorkerContext, f: impl FnOnce() -> R) -> R {
    struct ClearOnDrop;
    impl Drop for ClearOnDrop {
        fn drop(&mut self) {
            CONTEXT.with(|c| c.set(std::ptr::null()));
        }
    }

    CONTEXT.with(|c| c.set(ctx as *const _));
    let _guard = ClearOnDrop;
    f()
}

/// A running pool of worker threads plus the shared state they steal work
/// through.
pub struct Runtime {
    shared: Arc<Shared>,
    handles: Vec<Handle>,
    threads: Vec<thread::JoinHandle<()>>,
    blocking: BlockingPool,
}

thread_local! {
    static CURRENT_RUNTIME_HANDLE: Cell<Option<Handle>> = const { Cell::new(None) };
}

impl Runtime {
    /// Builds and starts a runtime with the default [`Config`].
    #[must_use]
    pub fn new() -> Self {
        Self::build(Config::default())
    }

    /// Builds and starts a runtime with a custom [`Config`].
    ///
    /// # Panics
    ///
    /// Panics if `config.worker_threads` is `0`.
    #[must_use]
    pub fn build(config: Config) -> Self {
        assert!(config.worker_threads > 0, "worker_threads must be at least 1");

        let locals: Vec<LocalQueue<TaskRef>> = (0..config.worker_threads).map(|_| LocalQueue::new_lifo()).collect();
        let stealers = locals.iter().map(LocalQueue::stealer).collect();

        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers,
            park_lock: Mutex::new(()),
            park_condvar: Condvar::new(),
            idle: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            global_queue_interval: config.global_queue_interval,
        });

        let mut threads = Vec::with_capacity(config.worker_threads);
        let mut handles = Vec::with_capacity(config.worker_threads);

        for (id, local) in locals.into_iter().enumerate() {
            let worker_shared = shared.clone();
            let mut builder = thread::Builder::new().name(format!("{}-{id}", config.thread_name_prefix));
            if let Some(size) = config.thread_stack_size {
                builder = builder.stack_size(size);
            }
            let thread = builder
                .spawn(move || worker_main(id, local, worker_shared))
                .expect("failed to spawn worker thread");
            threads.push(thread);
            handles.push(Handle {
                shared: shared.clone(),
                worker_id: id,
            });
        }

        let blocking = BlockingPool::new(config.blocking_pool_max, &config.thread_name_prefix);

        Self {
            shared,
            handles,
            threads,
            blocking,
        }
    }

    /// Spawns a future onto this runtime, returning a [`JoinHandle`] for its
    /// eventual output.
    ///
    /// # Panics
    ///
    /// Panics if the runtime has already been shut down; use
    /// [`try_spawn`](Self::try_spawn) to handle that case instead.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.try_spawn(future).expect("runtime is shutting down")
    }

    /// Spawns a future onto this runtime, returning
    /// [`SpawnError::Closed`] instead of panicking if the runtime has
    /// already been shut down.
    pub fn try_spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, crate::error::SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(crate::error::SpawnError::Closed);
        }
        let handle = self.pick_handle();
        let (task, join) = task::spawn(handle.clone(), future);
        handle.spawn(task);
        Ok(join)
    }

    /// Runs `f` on the blocking thread pool, returning a [`JoinHandle`] for
    /// its result.
    ///
    /// Use this for synchronous work (file I/O, CPU-bound hashing, a
    /// blocking library call) that would otherwise stall a worker's
    /// cooperative loop for longer than its budget allows. The pool grows
    /// up to [`Config::blocking_pool_max`] threads on demand and shrinks
    /// back down when idle.
    ///
    /// A panic inside `f` is caught on the blocking thread; the returned
    /// `JoinHandle` observes it the same way it would observe a panic in an
    /// ordinary task, since the bridge back to the scheduler is itself a
    /// regular spawned task awaiting the blocking thread's result.
    pub fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = crate::sync::oneshot::channel::<R>();
        self.blocking.spawn(Box::new(move || {
            tx.send(f());
        }));
        self.spawn(async move { rx.await.expect("blocking task's sender was dropped without sending") })
    }

    /// A [`Handle`] to one of this runtime's workers, suitable for storing
    /// inside tasks spawned through other means.
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.pick_handle()
    }

    fn pick_handle(&self) -> Handle {
        if let Some(current) = CURRENT_RUNTIME_HANDLE.with(Cell::take) {
            CURRENT_RUNTIME_HANDLE.with(|c| c.set(Some(current.clone())));
            return current;
        }
        let idx = fastrand::usize(..self.handles.len());
        self.handles[idx].clone()
    }

    /// Signals every worker to stop after its current task, without waiting
    /// for them to exit. See [`Runtime::join`] to wait.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.park_condvar.notify_all();
        self.blocking.shutdown();
    }

    /// Shuts the runtime down and blocks until every worker thread exits.
    pub fn join(mut self) {
        self.shutdown();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }

    /// Number of tasks spawned but not yet completed.
    #[must_use]
    pub fn outstanding_tasks(&self) -> usize {
        self.shared.outstanding.load(Ordering::Relaxed)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

fn worker_main(id: usize, local: LocalQueue<TaskRef>, shared: Arc<Shared>) {
    let handle = Handle {
        shared: shared.clone(),
        worker_id: id,
    };
    CURRENT_RUNTIME_HANDLE.with(|c| c.set(Some(handle)));

    let ctx = WorkerContext {
        id,
        local,
        current: Cell::new(None),
        lifo_slot: Cell::new(None),
        lifo_polls: Cell::new(0),
        tick: Cell::new(0),
    };

    enter_context(&ctx, || loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        if let Some(task) = ctx.next_task(&shared) {
            ctx.run_task(task, &shared);
            continue;
        }

        let stealer: Stealer<Handle> = Stealer::new(shared.clone(), id);
        match stealer.steal_into(&ctx.local) {
            Ok(task) => {
                ctx.run_task(task, &shared);
            }
            Err(TryStealError::Busy) => std::hint::spin_loop(),
            Err(TryStealError::NoTasks) => shared.park(),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awaitfn::block_on;
    use crate::task::yield_now;
    use std::time::Duration;

    fn small_runtime() -> Runtime {
        Runtime::build(Config {
            worker_threads: 4,
            ..Config::default()
        })
    }

    #[test]
    fn spawn_and_join_identity() {
        crate::test_util::init_tracing();
        let rt = small_runtime();
        let handle = rt.spawn(async { 42 });
        assert_eq!(block_on(handle).unwrap(), 42);
    }

    #[test]
    fn cooperative_yield_does_not_starve_siblings() {
        crate::test_util::init_tracing();
        let rt = small_runtime();

        let hot = rt.spawn(async {
            for _ in 0..1000 {
                yield_now().await;
            }
            "done"
        });
        let trivial = rt.spawn(async { 1 + 1 });

        assert_eq!(block_on(trivial).unwrap(), 2);
        assert_eq!(block_on(hot).unwrap(), "done");
    }

    #[test]
    fn work_stealing_completes_every_task() {
        crate::test_util::init_tracing();
        let rt = small_runtime();
        let completed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..500)
            .map(|_| {
                let completed = completed.clone();
                rt.spawn(async move {
                    completed.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        for h in handles {
            block_on(h).unwrap();
        }
        assert_eq!(completed.load(Ordering::Relaxed), 500);
        assert_eq!(rt.outstanding_tasks(), 0);
    }

    #[test]
    fn timeout_wins_the_race() {
        crate::test_util::init_tracing();
        let rt = small_runtime();
        let handle = rt.spawn(async {
            let timer = crate::time::Timer::new(crate::time::Clock::system());
            crate::time::timeout(&timer, Duration::from_millis(10), crate::time::sleep(&timer, Duration::from_millis(100))).await
        });
        let start = std::time::Instant::now();
        let result = block_on(handle).unwrap();
        assert!(result.is_err(), "expected the short timeout to win the race");
        assert!(start.elapsed() < Duration::from_millis(80));
    }

    #[test]
    fn abort_before_first_poll_is_observed_as_cancelled() {
        crate::test_util::init_tracing();
        let rt = small_runtime();
        // Awaits a future that never resolves on its own, so the only way
        // this task can finish is via cancellation: a run that slips in a
        // poll before `abort()` lands still can't complete the task.
        let handle = rt.spawn(std::future::pending::<()>());
        handle.abort();
        let result = block_on(handle);
        assert!(result.is_err());
    }

    #[test]
    fn shutdown_returns_without_waiting_out_sleeping_tasks() {
        crate::test_util::init_tracing();
        let rt = small_runtime();
        for _ in 0..20 {
            let timer = crate::time::Timer::new(crate::time::Clock::system());
            rt.spawn(async move {
                crate::time::sleep(&timer, Duration::from_secs(1)).await;
            });
        }
        std::thread::sleep(Duration::from_millis(50));
        let start = std::time::Instant::now();
        rt.shutdown();
        drop(rt);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn spawn_blocking_runs_off_the_worker_pool() {
        crate::test_util::init_tracing();
        let rt = small_runtime();
        let handle = rt.spawn_blocking(|| {
            std::thread::sleep(Duration::from_millis(10));
            7
        });
        assert_eq!(block_on(handle).unwrap(), 7);
    }
}
