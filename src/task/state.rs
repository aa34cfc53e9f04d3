// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task's atomic lifecycle word.
//!
//! All state transitions happen via CAS loops over a single [`AtomicUsize`],
//! packed with [`mycelium_bitfield`]. See the `join_waker` field doc comment
//! on [`super::Task`] for the rules governing the `JOIN_WAKER` field — this
//! is the trickiest part of the protocol, since the waker field it guards is
//! read by one thread and written by another without a lock.

use crate::task::PollResult;
use crossbeam_utils::CachePadded;
use mycelium_bitfield::{bitfield, FromBits};
use std::sync::atomic::{AtomicUsize, Ordering};

/// The state of the `join_waker` slot's handoff between the executor (which
/// may read it once the task completes) and the `JoinHandle` (which writes
/// it while the task is still running).
///
/// `Registering` is the intermediate, exclusive-write state: the
/// `JoinHandle` holds it for exactly as long as it takes to write the slot,
/// and nobody else may read the slot while it's set. This is what lets
/// `try_join` and `join_waker_registered` bracket a write so the executor
/// never observes a half-written waker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum JoinWakerState {
    /// No waker stored; the slot is uninitialized.
    Empty = 0b00,
    /// A `JoinHandle` is currently writing the slot.
    Registering = 0b01,
    /// A waker is stored and safe to read once the task completes.
    Registered = 0b10,
}

impl FromBits<usize> for JoinWakerState {
    type Error = core::convert::Infallible;

    const BITS: u32 = 2;

    fn try_from_bits(bits: usize) -> Result<Self, Self::Error> {
        match bits {
            b if b == Self::Empty as usize => Ok(Self::Empty),
            b if b == Self::Registering as usize => Ok(Self::Registering),
            b if b == Self::Registered as usize => Ok(Self::Registered),
            _ => unreachable!("invalid join waker state {bits:#b}"),
        }
    }

    fn into_bits(self) -> usize {
        self as usize
    }
}

bitfield! {
    /// A snapshot of a task's state word.
    #[derive(PartialEq, Eq)]
    pub(crate) struct Snapshot<usize> {
        /// Set while a worker is inside the task's `poll`.
        pub(crate) const RUNNING: bool;
        /// Set once the future has produced an output (or panicked).
        pub(crate) const COMPLETE: bool;
        /// Set if the task woke itself (or was woken) while `RUNNING`; on
        /// `end_poll` this means the task must be rescheduled instead of
        /// going to sleep, since the wake that would otherwise re-enqueue it
        /// already happened.
        pub(crate) const NOTIFIED: bool;
        /// Set by `TaskRef::cancel` / `JoinHandle::abort`.
        pub(crate) const CANCELLED: bool;
        /// See the `join_waker` protocol doc comment in `task.rs`.
        pub(crate) const JOIN_WAKER: JoinWakerState;
        /// Number of live `TaskRef`s (the scheduler's run-queue entry, the
        /// `JoinHandle`, and any `Waker`s handed out during a pending poll).
        pub(crate) const REF_COUNT = ..;
    }
}

// Padded to its own cache line: every poll, wake, and ref-count change goes
// through this word, and it sits next to other fields a different CPU might
// be touching (e.g. the `Header`'s `vtable` pointer, read-only but adjacent).
#[derive(Debug)]
pub(crate) struct State(CachePadded<AtomicUsize>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartPollAction {
    Poll,
    DontPoll,
    Cancelled { wake_join_waker: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinAction {
    TakeOutput,
    Canceled { completed: bool },
    Register,
    Reregister,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeByRefAction {
    Enqueue,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeByValAction {
    Enqueue,
    Drop,
    None,
}

impl State {
    pub(crate) const fn new() -> Self {
        // `JOIN_WAKER` starts `Empty` (bit pattern `0b00`), already the
        // zero default; nothing to set explicitly.
        let snap = Snapshot::new().with(Snapshot::REF_COUNT, 1);
        Self(CachePadded::new(AtomicUsize::new(snap.0)))
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> Snapshot {
        Snapshot::from_bits(self.0.load(order))
    }

    fn cas(&self, cur: Snapshot, new: Snapshot) -> Result<Snapshot, Snapshot> {
        self.0
            .compare_exchange_weak(cur.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(Snapshot::from_bits)
            .map_err(Snapshot::from_bits)
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.load(Ordering::Acquire).get(Snapshot::REF_COUNT)
    }

    /// Increments the reference count. Panics on overflow, matching the
    /// standard library's `Arc` behavior.
    pub(crate) fn clone_ref(&self) {
        let prev = self.0.fetch_add(Snapshot::REF_COUNT.first_bit(), Ordering::Relaxed);
        let prev = Snapshot::from_bits(prev);
        assert!(
            prev.get(Snapshot::REF_COUNT) < usize::MAX / 2,
            "task ref count overflowed"
        );
    }

    /// Decrements the reference count, returning `true` if this was the last
    /// reference and the task should now be deallocated.
    pub(crate) fn drop_ref(&self) -> bool {
        let prev = self.0.fetch_sub(Snapshot::REF_COUNT.first_bit(), Ordering::AcqRel);
        Snapshot::from_bits(prev).get(Snapshot::REF_COUNT) == 1
    }

    /// Attempts to transition the task from `Runnable`/initial to `Running`.
    pub(crate) fn start_poll(&self) -> StartPollAction {
        let mut cur = self.load(Ordering::Acquire);
        loop {
            if cur.get(Snapshot::COMPLETE) {
                return StartPollAction::DontPoll;
            }

            if cur.get(Snapshot::CANCELLED) && !cur.get(Snapshot::RUNNING) {
                // observed the abort flag before ever starting this poll: skip
                // straight to completion. Only safe to read the join waker if
                // it's fully `Registered`; `Registering` means a `JoinHandle`
                // is mid-write and will notice `COMPLETE` itself and discard
                // that write instead (see `join_waker_registered`).
                let wake_join_waker = cur.get(Snapshot::JOIN_WAKER) == JoinWakerState::Registered;
                let next = cur
                    .with(Snapshot::COMPLETE, true)
                    .with(Snapshot::RUNNING, false)
                    .with(Snapshot::NOTIFIED, false);
                match self.cas(cur, next) {
                    Ok(_) => return StartPollAction::Cancelled { wake_join_waker },
                    Err(actual) => {
                        cur = actual;
                        continue;
                    }
                }
            }

            let next = cur.with(Snapshot::RUNNING, true).with(Snapshot::NOTIFIED, false);
            match self.cas(cur, next) {
                Ok(_) => return StartPollAction::Poll,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Transitions out of `Running` once `poll` returns. `is_ready` reflects
    /// whether the future produced an output on this poll.
    pub(crate) fn end_poll(&self, is_ready: bool) -> PollResult {
        let mut cur = self.load(Ordering::Acquire);
        loop {
            debug_assert!(cur.get(Snapshot::RUNNING));

            let notified = cur.get(Snapshot::NOTIFIED);
            let next = cur
                .with(Snapshot::RUNNING, false)
                .with(Snapshot::COMPLETE, is_ready)
                .with(Snapshot::NOTIFIED, false);

            match self.cas(cur, next) {
                Ok(_) => {
                    return if is_ready {
                        // Same handoff rule as `start_poll`'s cancelled path:
                        // only a fully `Registered` waker is safe to read here.
                        if cur.get(Snapshot::JOIN_WAKER) == JoinWakerState::Registered {
                            PollResult::ReadyJoined
                        } else {
                            PollResult::Ready
                        }
                    } else if notified {
                        PollResult::PendingSchedule
                    } else {
                        PollResult::Pending
                    };
                }
                Err(actual) => cur = actual,
            }
        }
    }

    pub(crate) fn cancel(&self) -> bool {
        let mut cur = self.load(Ordering::Acquire);
        loop {
            if cur.get(Snapshot::CANCELLED) || cur.get(Snapshot::COMPLETE) {
                return false;
            }
            let next = cur.with(Snapshot::CANCELLED, true);
            match self.cas(cur, next) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Called from the waker's `wake_by_ref`.
    pub(crate) fn wake_by_ref(&self) -> WakeByRefAction {
        let mut cur = self.load(Ordering::Acquire);
        loop {
            if cur.get(Snapshot::COMPLETE) || cur.get(Snapshot::NOTIFIED) {
                return WakeByRefAction::None;
            }

            if cur.get(Snapshot::RUNNING) {
                // self-wake: the task is mid-poll; record the notification so
                // `end_poll` reschedules it instead of going to sleep.
                let next = cur.with(Snapshot::NOTIFIED, true);
                match self.cas(cur, next) {
                    Ok(_) => return WakeByRefAction::None,
                    Err(actual) => {
                        cur = actual;
                        continue;
                    }
                }
            }

            let next = cur.with(Snapshot::NOTIFIED, true);
            match self.cas(cur, next) {
                Ok(_) => return WakeByRefAction::Enqueue,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Called from the waker's `wake_by_val`, which additionally owns one
    /// reference count that it must drop once done.
    pub(crate) fn wake_by_val(&self) -> WakeByValAction {
        match self.wake_by_ref() {
            WakeByRefAction::Enqueue => WakeByValAction::Enqueue,
            WakeByRefAction::None => {
                if self.load(Ordering::Acquire).get(Snapshot::COMPLETE) {
                    WakeByValAction::Drop
                } else {
                    WakeByValAction::None
                }
            }
        }
    }

    /// Called from `JoinHandle::poll` / `poll_join`.
    ///
    /// When this returns `Register`/`Reregister`, `JOIN_WAKER` has already
    /// been CAS'd to `Registering` — the caller now has exclusive write
    /// access to the waker slot until it calls [`Self::join_waker_registered`].
    pub(crate) fn try_join(&self) -> JoinAction {
        let mut cur = self.load(Ordering::Acquire);
        loop {
            if cur.get(Snapshot::CANCELLED) && !cur.get(Snapshot::COMPLETE) {
                return JoinAction::Canceled { completed: false };
            }

            if cur.get(Snapshot::COMPLETE) {
                if cur.get(Snapshot::CANCELLED) {
                    return JoinAction::Canceled { completed: true };
                }
                return JoinAction::TakeOutput;
            }

            let action = match cur.get(Snapshot::JOIN_WAKER) {
                JoinWakerState::Registered => JoinAction::Reregister,
                JoinWakerState::Empty => JoinAction::Register,
                // Only a `JoinHandle` transitions into `Registering`, and it
                // doesn't call `try_join` again until the write is resolved.
                JoinWakerState::Registering => unreachable!("concurrent join registration"),
            };
            let next = cur.with(Snapshot::JOIN_WAKER, JoinWakerState::Registering);
            match self.cas(cur, next) {
                Ok(_) => return action,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Resolves the `Registering` write started by `try_join`.
    ///
    /// Returns `true` if the registration stands: `JOIN_WAKER` is now
    /// `Registered` and the executor may read the slot once the task
    /// completes. Returns `false` if the task completed while the slot was
    /// being written — `JOIN_WAKER` is reset to `Empty` and the just-written
    /// waker is never read by anyone; the caller must re-examine the task
    /// instead of returning `Pending`, since no one will wake it.
    pub(crate) fn join_waker_registered(&self) -> bool {
        let mut cur = self.load(Ordering::Acquire);
        loop {
            debug_assert_eq!(cur.get(Snapshot::JOIN_WAKER), JoinWakerState::Registering);
            if cur.get(Snapshot::COMPLETE) {
                let next = cur.with(Snapshot::JOIN_WAKER, JoinWakerState::Empty);
                match self.cas(cur, next) {
                    Ok(_) => return false,
                    Err(actual) => {
                        cur = actual;
                        continue;
                    }
                }
            }

            let next = cur.with(Snapshot::JOIN_WAKER, JoinWakerState::Registered);
            match self.cas(cur, next) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }
}
