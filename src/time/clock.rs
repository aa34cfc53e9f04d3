// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A pluggable source of monotonic time, so timer wheel tests can advance
//! time deterministically instead of sleeping for real.

use crate::time::instant::Instant;
use std::sync::Arc;
use std::time::Instant as StdInstant;

/// A monotonic clock. Cheap to clone; every [`Timer`](super::Timer) is built
/// on one.
#[derive(Clone)]
pub struct Clock {
    source: Arc<dyn ClockSource>,
    epoch: StdInstant,
}

/// The pluggable half of [`Clock`]. Implement this to drive a [`Timer`](super::Timer)
/// from something other than real wall-clock time (tests, simulations).
pub trait ClockSource: Send + Sync + 'static {
    /// Elapsed time since this source was created.
    fn elapsed(&self) -> std::time::Duration;
}

struct SystemClockSource(StdInstant);

impl ClockSource for SystemClockSource {
    fn elapsed(&self) -> std::time::Duration {
        self.0.elapsed()
    }
}

impl Clock {
    /// A clock backed by `std::time::Instant`.
    #[must_use]
    pub fn system() -> Self {
        let now = StdInstant::now();
        Self {
            source: Arc::new(SystemClockSource(now)),
            epoch: now,
        }
    }

    /// A clock backed by a custom [`ClockSource`], e.g. a test-controlled
    /// virtual clock.
    #[must_use]
    pub fn new(source: Arc<dyn ClockSource>) -> Self {
        Self {
            source,
            epoch: StdInstant::now(),
        }
    }

    #[must_use]
    pub fn now(&self) -> Instant {
        Instant::from_duration(self.source.elapsed())
    }

    /// The `std::time::Instant` this clock was created at, for translating
    /// between this clock's [`Instant`]s and absolute wall-clock time.
    #[must_use]
    pub fn epoch(&self) -> StdInstant {
        self.epoch
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").field("now", &self.now()).finish()
    }
}
