// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The unit of scheduled work: a pinned, type-erased [`Future`] plus the
//! bookkeeping the scheduler needs to poll, wake, join, and eventually free
//! it.

mod builder;
pub mod coop;
mod id;
mod join_handle;
mod state;
mod yield_now;

use crate::scheduler::Schedule;
use crate::task::state::{JoinAction, Snapshot, StartPollAction, State, WakeByRefAction, WakeByValAction};
use std::any::type_name;
#[cfg(debug_assertions)]
use std::any::TypeId;
use std::future::Future;
use std::mem::{self, MaybeUninit};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::{fmt, panic};

pub use builder::TaskBuilder;
pub use id::Id;
pub use join_handle::{JoinError, JoinHandle};
pub use yield_now::yield_now;

/// Outcome of calling [`TaskRef::poll`], telling the scheduler what to do
/// with the `TaskRef` it is holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollResult {
    /// The task completed, no `JoinHandle` waker needed waking.
    Ready,
    /// The task completed and a `JoinHandle` waker was woken.
    ReadyJoined,
    /// The task is pending; whoever wakes it later holds a `Waker` clone.
    Pending,
    /// The task woke itself during the poll; the scheduler must re-enqueue it.
    PendingSchedule,
}

/// A type-erased, reference-counted handle to a spawned task.
///
/// Tasks are always heap-allocated and pinned; `TaskRef` is just a pointer
/// to the allocation's `Header`, dispatched through a static per-`(F, S)`
/// [`VTable`] so the scheduler and run queues never need to know the
/// concrete `Future` type of the tasks they're pushing around. Without this,
/// every distinct `async fn`/`async {}` block spawned would instantiate its
/// own copy of the scheduler's generic code.
pub struct TaskRef(NonNull<Header>);

#[repr(C)]
struct Task<F: Future, S: Schedule> {
    schedulable: Schedulable<S>,
    /// If `COMPLETE` is set, the executor has exclusive access to this field
    /// until a `JoinHandle` takes the output (see `Stage`). Otherwise the
    /// `RUNNING` bit in `Header::state` is the lock: only the worker thread
    /// that set `RUNNING` may touch it.
    stage: std::cell::UnsafeCell<Stage<F>>,
    /// The `JoinHandle`'s waker, if one has been registered. Guarded by the
    /// `JOIN_WAKER` field (a [`state::JoinWakerState`]) on [`state::Snapshot`]:
    ///
    /// 1. `JOIN_WAKER` starts `Empty`.
    /// 2. `try_join` CASes it from `Empty`/`Registered` to `Registering`,
    ///    claiming exclusive write access to this slot before the caller
    ///    writes anything into it.
    /// 3. Having written, the caller calls `join_waker_registered`, which
    ///    CASes `Registering` to `Registered` — granting the executor
    ///    read-only access once the task also completes.
    /// 4. If the task completes while the slot is `Registering`,
    ///    `join_waker_registered`'s CAS instead resets it to `Empty` and
    ///    reports the write as discarded: the executor never reads it, and
    ///    the `JoinHandle` must re-examine the task's state itself rather
    ///    than wait for a wake that will never come.
    /// 5. The executor may only read this slot (to take and wake the waker)
    ///    when it observes `JOIN_WAKER == Registered` at the moment it sets
    ///    `COMPLETE`; `Empty` or `Registering` means there is nothing safe to
    ///    read yet.
    join_waker: std::cell::UnsafeCell<Option<Waker>>,
}

#[repr(C)]
struct Schedulable<S: Schedule> {
    header: Header,
    scheduler: S,
}

enum Stage<F: Future> {
    Pending(F),
    Ready(Result<F::Output, JoinError<F::Output>>),
    Consumed,
}

pub(crate) struct Header {
    state: State,
    vtable: &'static VTable,
    id: Id,
    span: tracing::Span,
    #[cfg(debug_assertions)]
    scheduler_type: TypeId,
}

struct VTable {
    poll: unsafe fn(NonNull<Header>) -> PollResult,
    poll_join: unsafe fn(NonNull<Header>, NonNull<()>, &mut Context<'_>) -> Poll<Result<(), JoinError<()>>>,
    deallocate: unsafe fn(NonNull<Header>),
    wake_by_ref: unsafe fn(*const ()),
}

// === impl TaskRef ===

impl TaskRef {
    fn new_allocated<F, S>(task: Box<Task<F, S>>) -> (Self, JoinHandle<F::Output>)
    where
        F: Future + Send + 'static,
        S: Schedule,
        F::Output: Send + 'static,
    {
        debug_assert_eq!(task.schedulable.header.state.ref_count(), 1);
        let ptr = Box::into_raw(task);
        // Safety: just allocated, never null.
        let this = Self(unsafe { NonNull::new_unchecked(ptr).cast() });
        let join = JoinHandle::new(this.clone());
        (this, join)
    }

    #[must_use]
    pub fn id(&self) -> Id {
        self.header().id
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state().load(Ordering::Acquire).get(Snapshot::COMPLETE)
    }

    /// Marks the task cancelled; the next poll observes it and unwinds.
    pub fn cancel(&self) -> bool {
        let cancelled = self.state().cancel();
        if cancelled {
            self.wake_by_ref();
        }
        cancelled
    }

    fn header(&self) -> &Header {
        // Safety: constructor guarantees validity for the TaskRef's lifetime.
        unsafe { self.0.as_ref() }
    }

    fn state(&self) -> &State {
        &self.header().state
    }

    pub(crate) fn wake_by_ref(&self) {
        let f = self.header().vtable.wake_by_ref;
        // Safety: dispatched through the task's own vtable.
        unsafe { f(self.0.as_ptr().cast::<()>()) }
    }

    pub(crate) fn poll(&self) -> PollResult {
        let f = self.header().vtable.poll;
        // Safety: dispatched through the task's own vtable.
        unsafe { f(self.0) }
    }

    /// # Safety
    ///
    /// `T` must be the same type this `TaskRef`'s task was spawned with.
    pub(crate) unsafe fn poll_join<T>(&self, cx: &mut Context<'_>) -> Poll<Result<T, JoinError<T>>> {
        let poll_join = self.header().vtable.poll_join;
        let mut slot: MaybeUninit<Result<T, JoinError<T>>> = MaybeUninit::uninit();

        // Safety: ensured by caller; `poll_join` writes a valid `Result<T, _>`
        // into `slot` whenever it returns `Poll::Ready(Ok(()))`.
        let result = unsafe { poll_join(self.0, NonNull::from(&mut slot).cast::<()>(), cx) };

        result.map(|r| match r {
            Ok(()) => unsafe { slot.assume_init() },
            Err(e) => {
                let output = if e.is_completed() {
                    match unsafe { slot.assume_init() } {
                        Ok(v) => Some(v),
                        Err(_) => None,
                    }
                } else {
                    None
                };
                Err(e.with_output(output))
            }
        })
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef").field("id", &self.id()).finish()
    }
}

impl Clone for TaskRef {
    fn clone(&self) -> Self {
        self.state().clone_ref();
        Self(self.0)
    }
}

impl Drop for TaskRef {
    fn drop(&mut self) {
        if !self.state().drop_ref() {
            return;
        }
        let dealloc = self.header().vtable.deallocate;
        // Safety: last reference just dropped; no other handle can observe
        // the deallocation racing with this one.
        unsafe { dealloc(self.0) };
    }
}

// Safety: all access to the erased `Header`/`Task` is mediated by the
// `State` CAS protocol.
unsafe impl Send for TaskRef {}
// Safety: see above.
unsafe impl Sync for TaskRef {}

static_assertions::assert_impl_all!(TaskRef: Send, Sync, Clone);

// === impl Task ===

impl<F, S> Task<F, S>
where
    F: Future + Send + 'static,
    S: Schedule,
    F::Output: Send + 'static,
{
    const VTABLE: VTable = VTable {
        poll: Self::poll,
        poll_join: Self::poll_join,
        deallocate: Self::deallocate,
        wake_by_ref: Schedulable::<S>::wake_by_ref,
    };

    fn new(future: F, id: Id, span: tracing::Span, scheduler: S) -> Self {
        Self {
            schedulable: Schedulable {
                header: Header {
                    state: State::new(),
                    vtable: &Self::VTABLE,
                    id,
                    span,
                    #[cfg(debug_assertions)]
                    scheduler_type: TypeId::of::<S>(),
                },
                scheduler,
            },
            stage: std::cell::UnsafeCell::new(Stage::Pending(future)),
            join_waker: std::cell::UnsafeCell::new(None),
        }
    }

    /// # Safety
    /// `ptr` must point to the `Header` of a `Task<F, S>`.
    unsafe fn poll(ptr: NonNull<Header>) -> PollResult {
        // Safety: ensured by caller.
        let this = unsafe { ptr.cast::<Self>().as_ref() };
        tracing::trace!(task.id = %this.id(), task.output = type_name::<F::Output>(), "Task::poll");

        match this.state().start_poll() {
            StartPollAction::Poll => {}
            StartPollAction::DontPoll => return PollResult::Ready,
            StartPollAction::Cancelled { wake_join_waker } => {
                if wake_join_waker {
                    // Safety: `Cancelled` is only returned once, exclusively.
                    unsafe { this.wake_join_waker() };
                    return PollResult::ReadyJoined;
                }
                return PollResult::Ready;
            }
        }

        // `ManuallyDrop` because this waker borrows the refcount the
        // scheduler's `TaskRef` already holds, rather than incrementing it.
        let waker = {
            let raw = Schedulable::<S>::raw_waker(ptr.as_ptr().cast());
            mem::ManuallyDrop::new(unsafe { Waker::from_raw(raw) })
        };

        coop::reset();
        let poll = {
            let mut cx = Context::from_waker(&waker);
            // Safety: `start_poll` returning `Poll` means this worker holds
            // the `RUNNING` lock over `stage`.
            unsafe { this.poll_inner(&mut cx) }
        };

        let result = this.state().end_poll(poll.is_ready());
        if result == PollResult::ReadyJoined {
            // Safety: `ReadyJoined` is only returned once, exclusively.
            unsafe { this.wake_join_waker() };
        }
        result
    }

    /// # Safety
    /// Same as [`Self::poll`]; `outptr` must point to a valid
    /// `MaybeUninit<Result<F::Output, JoinError<F::Output>>>`.
    unsafe fn poll_join(
        ptr: NonNull<Header>,
        outptr: NonNull<()>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), JoinError<()>>> {
        // Safety: ensured by caller.
        let this = unsafe { ptr.cast::<Self>().as_ref() };

        match this.state().try_join() {
            JoinAction::TakeOutput => {
                // Safety: `TakeOutput` means we have exclusive access.
                unsafe { this.take_output(outptr) };
                Poll::Ready(Ok(()))
            }
            JoinAction::Canceled { completed } => {
                if completed {
                    // Safety: see above.
                    unsafe { this.take_output(outptr) };
                }
                Poll::Ready(Err(JoinError::cancelled(completed, this.id())))
            }
            action @ (JoinAction::Register | JoinAction::Reregister) => {
                // Safety: `Register`/`Reregister` grant the `JoinHandle`
                // (mutable) access to `join_waker` until `join_waker_registered`
                // resolves the `Registering` state.
                unsafe {
                    let slot = &mut *this.join_waker.get();
                    match action {
                        JoinAction::Register => *slot = Some(cx.waker().clone()),
                        JoinAction::Reregister => {
                            let waker = slot.as_mut().expect("reregister without a waker");
                            if !waker.will_wake(cx.waker()) {
                                *waker = cx.waker().clone();
                            }
                        }
                        _ => unreachable!(),
                    }
                }

                if this.state().join_waker_registered() {
                    return Poll::Pending;
                }

                // The task completed while the waker was being written; that
                // write was discarded and no one will wake this `JoinHandle`,
                // so look again instead of hanging in `Pending` forever.
                match this.state().try_join() {
                    JoinAction::TakeOutput => {
                        // Safety: `TakeOutput` means we have exclusive access.
                        unsafe { this.take_output(outptr) };
                        Poll::Ready(Ok(()))
                    }
                    JoinAction::Canceled { completed } => {
                        if completed {
                            // Safety: see above.
                            unsafe { this.take_output(outptr) };
                        }
                        Poll::Ready(Err(JoinError::cancelled(completed, this.id())))
                    }
                    JoinAction::Register | JoinAction::Reregister => {
                        unreachable!("completion is monotonic; it can't have un-completed")
                    }
                }
            }
        }
    }

    /// # Safety
    /// Same as [`Self::poll`].
    unsafe fn deallocate(ptr: NonNull<Header>) {
        // Safety: ensured by caller.
        unsafe {
            let this = ptr.cast::<Self>();
            debug_assert_eq!(this.as_ref().state().ref_count(), 0);
            drop(Box::from_raw(this.as_ptr()));
        }
    }

    /// # Safety
    /// Caller must hold the `RUNNING` lock (i.e. be inside the matching
    /// `start_poll`/`end_poll` pair).
    unsafe fn poll_inner(&self, cx: &mut Context<'_>) -> Poll<()> {
        let _span = self.span().enter();
        // Safety: ensured by caller.
        let stage = unsafe { &mut *self.stage.get() };
        stage.poll(cx, self.id())
    }

    /// # Safety
    /// Caller must have exclusive access to `join_waker` (see the field doc).
    unsafe fn wake_join_waker(&self) {
        // Safety: ensured by caller.
        let slot = unsafe { &mut *self.join_waker.get() };
        if let Some(waker) = slot.take() {
            waker.wake();
        }
    }

    /// # Safety
    /// Caller must have exclusive access to `stage` and `dst` must point to
    /// a valid `MaybeUninit<Result<F::Output, JoinError<F::Output>>>`.
    unsafe fn take_output(&self, dst: NonNull<()>) {
        // Safety: ensured by caller.
        let stage = unsafe { &mut *self.stage.get() };
        match mem::replace(stage, Stage::Consumed) {
            Stage::Ready(output) => {
                // Safety: ensured by caller.
                unsafe {
                    dst.cast::<MaybeUninit<Result<F::Output, JoinError<F::Output>>>>()
                        .as_ptr()
                        .write(MaybeUninit::new(output));
                }
            }
            _ => panic!("JoinHandle polled after completion"),
        }
    }

    fn id(&self) -> Id {
        self.schedulable.header.id
    }

    fn state(&self) -> &State {
        &self.schedulable.header.state
    }

    fn span(&self) -> &tracing::Span {
        &self.schedulable.header.span
    }
}

// === impl Stage ===

impl<F: Future> Stage<F> {
    fn poll(&mut self, cx: &mut Context<'_>, id: Id) -> Poll<()> {
        struct Guard<'a, T: Future>(&'a mut Stage<T>);
        impl<T: Future> Drop for Guard<'_, T> {
            fn drop(&mut self) {
                // If the future panics inside `poll`, leave the stage in a
                // terminal state rather than re-polling a half-unwound future.
                *self.0 = Stage::Consumed;
            }
        }

        let poll_fut = AssertUnwindSafe(|| -> Poll<F::Output> {
            let guard = Guard(self);
            let Stage::Pending(future) = &mut *guard.0 else {
                unreachable!("Stage::poll called outside Pending");
            };
            // Safety: the task is heap-allocated and never moved once spawned.
            let future = unsafe { Pin::new_unchecked(future) };
            let res = future.poll(cx);
            mem::forget(guard);
            res
        });

        match panic::catch_unwind(poll_fut) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(output)) => {
                *self = Stage::Ready(Ok(output));
                Poll::Ready(())
            }
            Err(payload) => {
                *self = Stage::Ready(Err(JoinError::panic(id, payload)));
                Poll::Ready(())
            }
        }
    }
}

// === impl Schedulable ===

impl<S: Schedule> Schedulable<S> {
    const WAKER_VTABLE: RawWakerVTable =
        RawWakerVTable::new(Self::clone_waker, Self::wake_by_val, Self::wake_by_ref, Self::drop_waker);

    // `Waker::will_wake` compares vtable addresses; keeping this out-of-line
    // (never inlined) keeps that address stable across calls.
    #[inline(never)]
    fn raw_waker(this: *const Self) -> RawWaker {
        RawWaker::new(this.cast::<()>(), &Self::WAKER_VTABLE)
    }

    fn state(&self) -> &State {
        &self.header.state
    }

    unsafe fn schedule(this: TaskRef) {
        // Safety: ensured by caller.
        let scheduler = unsafe { &this.0.cast::<Self>().as_ref().scheduler };
        scheduler.wake(this);
    }

    unsafe fn drop_ref(this: NonNull<Self>) {
        // Safety: ensured by caller.
        unsafe {
            if !this.as_ref().state().drop_ref() {
                return;
            }
            let dealloc = this.as_ref().header.vtable.deallocate;
            dealloc(this.cast::<Header>());
        }
    }

    unsafe fn wake_by_val(ptr: *const ()) {
        // Safety: called through the `RawWakerVTable`.
        unsafe {
            let this = NonNull::new_unchecked(ptr.cast::<Self>().cast_mut());
            match this.as_ref().state().wake_by_val() {
                WakeByValAction::Enqueue => {
                    // Enqueuing transfers ownership of this waker's
                    // reference count into the run queue; drop the waker's
                    // own handle afterward.
                    Self::schedule(TaskRef(this.cast::<Header>()));
                    Self::drop_ref(this);
                }
                WakeByValAction::Drop => Self::drop_ref(this),
                WakeByValAction::None => {}
            }
        }
    }

    unsafe fn wake_by_ref(ptr: *const ()) {
        // Safety: called through the `RawWakerVTable`.
        unsafe {
            let this = NonNull::new_unchecked(ptr.cast::<Self>().cast_mut());
            if this.as_ref().state().wake_by_ref() == WakeByRefAction::Enqueue {
                Self::schedule(TaskRef::clone_from_raw(this.cast::<Header>()));
            }
        }
    }

    unsafe fn clone_waker(ptr: *const ()) -> RawWaker {
        // Safety: called through the `RawWakerVTable`.
        unsafe {
            let ptr = ptr.cast::<Self>();
            (*ptr).header.state.clone_ref();
            Self::raw_waker(ptr)
        }
    }

    unsafe fn drop_waker(ptr: *const ()) {
        // Safety: called through the `RawWakerVTable`.
        unsafe { Self::drop_ref(NonNull::new_unchecked(ptr.cast::<Self>().cast_mut())) }
    }
}

impl TaskRef {
    fn clone_from_raw(ptr: NonNull<Header>) -> TaskRef {
        let this = TaskRef(ptr);
        this.state().clone_ref();
        this
    }
}

/// Spawns `future` onto `scheduler`, returning the scheduler-owned
/// [`TaskRef`] (to be pushed onto a run queue) and the caller-owned
/// [`JoinHandle`].
pub(crate) fn spawn<F, S>(scheduler: S, future: F) -> (TaskRef, JoinHandle<F::Output>)
where
    F: Future + Send + 'static,
    S: Schedule,
    F::Output: Send + 'static,
{
    TaskBuilder::new(scheduler).build(future)
}
