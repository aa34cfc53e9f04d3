// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Timers: a hierarchical wheel shared by every worker, plus the
//! [`Sleep`] and [`Timeout`] futures built on top of it.

mod clock;
mod instant;
mod sleep;
mod timeout;
mod timer;

pub use clock::Clock;
pub use instant::Instant;
pub use sleep::{sleep, sleep_until, Sleep};
pub use timeout::{timeout, timeout_at, Elapsed, Timeout};
pub use timer::{Ticks, Timer};

use std::time::Duration;

/// Errors arising from constructing or driving a timer-backed future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimeError {
    /// No [`Timer`] was supplied and no global default has been set.
    #[error("no timer is running; call `Timer::set_global` or pass a timer explicitly")]
    NoGlobalTimer,
    /// The requested duration exceeds what the wheel can represent.
    #[error("duration {requested:?} exceeds the maximum representable duration {max:?}")]
    DurationTooLong { requested: Duration, max: Duration },
}

/// The longest duration a [`Timer`] of this wheel depth can schedule.
#[must_use]
pub fn max_duration() -> Duration {
    timer::max_duration()
}
