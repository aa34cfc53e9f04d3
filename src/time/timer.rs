// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A hierarchical timing wheel: `LEVELS` levels of `SLOTS_PER_LEVEL` slots
//! each, the classic "cascading" design (the same family as the kernel's
//! timer wheel) that gets O(1) amortized insertion and firing without
//! needing a sorted structure.
//!
//! Level 0 covers the next `SLOTS_PER_LEVEL` ticks one slot per tick; level
//! `L` covers `SLOTS_PER_LEVEL^(L+1)` ticks, one slot per `SLOTS_PER_LEVEL^L`
//! ticks. An entry is inserted into the coarsest level whose granularity
//! still distinguishes its deadline from `now`; every time the wheel turns
//! past a level's slot boundary, that slot is drained and every entry in it
//! either fires (if now due) or cascades one level finer.

use crate::time::{Clock, Instant};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::Waker;
use std::thread;
use std::time::Duration;

/// Upper bound on how long the driver thread ever sleeps between checking
/// for new work, even with no entries registered; a safety net against a
/// missed wakeup, not the primary signaling path.
const DRIVER_IDLE_POLL: Duration = Duration::from_secs(1);

const LEVELS: usize = 6;
const SLOTS_PER_LEVEL: usize = 64;
const SLOT_BITS: u32 = 6;

/// Ticks since a [`Clock`]'s epoch, in milliseconds; the wheel's native unit.
pub type Ticks = u64;

pub(crate) struct EntryState {
    deadline: AtomicU64,
    waker: Mutex<Option<Waker>>,
    fired: AtomicBool,
    cancelled: AtomicBool,
}

impl EntryState {
    fn new(deadline: Ticks) -> Arc<Self> {
        Arc::new(Self {
            deadline: AtomicU64::new(deadline),
            waker: Mutex::new(None),
            fired: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        })
    }

    fn deadline(&self) -> Ticks {
        self.deadline.load(Ordering::Relaxed)
    }

    fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        if let Some(waker) = self.waker.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
            waker.wake();
        }
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub(crate) fn register_waker(&self, waker: &Waker) {
        let mut slot = self.waker.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match slot.as_mut() {
            Some(existing) if existing.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }
}

#[derive(Default)]
struct Wheel {
    slots: Vec<Vec<Arc<EntryState>>>,
}

impl Wheel {
    fn new() -> Self {
        Self {
            slots: (0..SLOTS_PER_LEVEL).map(|_| Vec::new()).collect(),
        }
    }
}

struct Core {
    now: Ticks,
    wheels: [Wheel; LEVELS],
}

impl Core {
    fn new(now: Ticks) -> Self {
        Self {
            now,
            wheels: std::array::from_fn(|_| Wheel::new()),
        }
    }

    fn level_for(now: Ticks, deadline: Ticks) -> usize {
        let differing = now ^ deadline;
        if differing == 0 {
            return 0;
        }
        let level = (63 - differing.leading_zeros()) / SLOT_BITS;
        (level as usize).min(LEVELS - 1)
    }

    fn slot_index(level: usize, ticks: Ticks) -> usize {
        ((ticks >> (level as u32 * SLOT_BITS)) & (SLOTS_PER_LEVEL as u64 - 1)) as usize
    }

    fn insert(&mut self, entry: Arc<EntryState>) {
        let deadline = entry.deadline();
        if deadline <= self.now {
            entry.fire();
            return;
        }
        let level = Self::level_for(self.now, deadline);
        let idx = Self::slot_index(level, deadline);
        self.wheels[level].slots[idx].push(entry);
    }

    fn drain_slot(&mut self, level: usize, ticks: Ticks) -> Vec<Arc<EntryState>> {
        let idx = Self::slot_index(level, ticks);
        std::mem::take(&mut self.wheels[level].slots[idx])
    }

    fn fire_due(&mut self, entries: Vec<Arc<EntryState>>) {
        for entry in entries {
            if !entry.cancelled.load(Ordering::Relaxed) {
                entry.fire();
            }
        }
    }

    fn cascade(&mut self, level: usize) {
        let entries = self.drain_slot(level, self.now);
        for entry in entries {
            if entry.cancelled.load(Ordering::Relaxed) {
                continue;
            }
            if entry.deadline() <= self.now {
                entry.fire();
            } else {
                self.insert(entry);
            }
        }
    }

    /// The earliest deadline still pending across every level, if any.
    ///
    /// A linear scan rather than the teacher's occupied-slot bitmap: this
    /// wheel stores entries in plain `Vec`s instead of an intrusive list, so
    /// there's no O(1) "next set bit" to consult. Fine at the scale a
    /// general-purpose runtime's driver thread polls at.
    fn next_deadline(&self) -> Option<Ticks> {
        self.wheels
            .iter()
            .flat_map(|wheel| wheel.slots.iter())
            .flat_map(|slot| slot.iter())
            .filter(|entry| !entry.cancelled.load(Ordering::Relaxed))
            .map(|entry| entry.deadline())
            .min()
    }

    /// Advances `now` to `target`, firing and cascading every slot crossed.
    fn turn_to(&mut self, target: Ticks) {
        while self.now < target {
            self.now += 1;
            let now = self.now;
            let due = self.drain_slot(0, now);
            self.fire_due(due);

            let mut span = SLOTS_PER_LEVEL as u64;
            for level in 1..LEVELS {
                if now % span != 0 {
                    break;
                }
                self.cascade(level);
                span *= SLOTS_PER_LEVEL as u64;
            }
        }
    }
}

struct Shared {
    clock: Clock,
    core: Mutex<Core>,
    /// Wakes the driver thread when a nearer deadline is registered, and
    /// signals it to exit on drop; not otherwise used to guard any data.
    driver_wake: Condvar,
    driver_lock: Mutex<()>,
    shutdown: AtomicBool,
}

impl Shared {
    fn turn(&self) -> Option<Ticks> {
        let target = self.clock.now().as_millis();
        let mut core = self.core.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        core.turn_to(target);
        core.next_deadline()
    }
}

/// A shared timer wheel driven by a [`Clock`]; the scheduling backend for
/// [`Sleep`](super::Sleep) and [`Timeout`](super::Timeout).
///
/// Every `Timer` runs its own background driver thread that parks until the
/// next registered deadline and turns the wheel, so a sleeping task makes
/// progress even though nothing else ever polls it again on its own. The
/// driver exits when the `Timer` is dropped.
pub struct Timer {
    shared: Arc<Shared>,
    driver: Option<thread::JoinHandle<()>>,
}

impl Timer {
    #[must_use]
    pub fn new(clock: Clock) -> Self {
        let now = clock.now().as_millis();
        let shared = Arc::new(Shared {
            clock,
            core: Mutex::new(Core::new(now)),
            driver_wake: Condvar::new(),
            driver_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
        });

        let driver_shared = shared.clone();
        let driver = thread::Builder::new()
            .name("kestrel-timer-driver".to_owned())
            .spawn(move || Self::drive(&driver_shared))
            .expect("failed to spawn timer driver thread");

        Self {
            shared,
            driver: Some(driver),
        }
    }

    fn drive(shared: &Arc<Shared>) {
        loop {
            let next_deadline = shared.turn();
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }

            let wait = match next_deadline {
                Some(deadline) => {
                    let now = shared.clock.now().as_millis();
                    Duration::from_millis(deadline.saturating_sub(now)).min(DRIVER_IDLE_POLL)
                }
                None => DRIVER_IDLE_POLL,
            };

            let guard = shared.driver_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let _ = shared.driver_wake.wait_timeout(guard, wait);

            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
        }
    }

    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.shared.clock
    }

    #[must_use]
    pub fn now(&self) -> Instant {
        self.shared.clock.now()
    }

    /// Advances the wheel to the clock's current time, firing any entries
    /// that have come due.
    ///
    /// Cheap to call speculatively; [`Sleep`](super::Sleep) calls this on
    /// every poll as a fast path, but forward progress no longer depends on
    /// it — the driver thread calls it too, even if nothing ever polls the
    /// sleeping future again.
    pub fn turn(&self) {
        self.shared.turn();
    }

    pub(crate) fn register(&self, deadline: Instant) -> Arc<EntryState> {
        let entry = EntryState::new(deadline.as_millis());
        let target = self.now().as_millis();
        {
            let mut core = self.shared.core.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            core.turn_to(target);
            core.insert(entry.clone());
        }
        // The new entry may be due sooner than whatever the driver is
        // currently parked on; prod it to recompute.
        self.shared.driver_wake.notify_one();
        entry
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new(Clock::system())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.driver_wake.notify_all();
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
    }
}

/// The longest duration expressible by this wheel's depth: `SLOTS_PER_LEVEL^LEVELS`
/// milliseconds.
#[must_use]
pub fn max_duration() -> Duration {
    let ticks = (SLOTS_PER_LEVEL as u64).saturating_pow(LEVELS as u32);
    Duration::from_millis(ticks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_for_picks_coarsest_distinguishing_level() {
        assert_eq!(Core::level_for(0, 5), 0);
        assert_eq!(Core::level_for(0, 64), 1);
        assert_eq!(Core::level_for(0, 64 * 64), 2);
    }

    #[test]
    fn insert_and_fire_in_order() {
        let mut core = Core::new(0);
        let a = EntryState::new(5);
        let b = EntryState::new(10);
        core.insert(a.clone());
        core.insert(b.clone());
        core.turn_to(5);
        assert!(a.is_fired());
        assert!(!b.is_fired());
        core.turn_to(10);
        assert!(b.is_fired());
    }

    #[test]
    fn cascades_across_levels() {
        let mut core = Core::new(0);
        let far = EntryState::new(200);
        core.insert(far.clone());
        core.turn_to(200);
        assert!(far.is_fired());
    }

    #[test]
    fn cancelled_entry_does_not_wake() {
        let mut core = Core::new(0);
        let entry = EntryState::new(5);
        entry.cancel();
        core.insert(entry.clone());
        core.turn_to(5);
        // `fire` is still called by `insert`'s immediate-due path only when
        // deadline <= now at insertion; here it went through the wheel, so
        // cascading/slot drain is what must honor `cancelled`.
        assert!(entry.cancelled.load(Ordering::Relaxed));
    }
}
