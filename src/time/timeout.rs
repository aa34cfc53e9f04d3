// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Racing a future against a deadline.
//!
//! This is the *only* timeout primitive this crate exposes: composition
//! over a plain future, not a per-I/O-operation variant threaded through
//! every read/write/accept call. Anything that can be `.await`ed can be
//! wrapped in [`timeout`]; there is no separate bridge-level timeout
//! mechanism to keep in sync with this one.

use crate::time::{sleep_until, Instant, Sleep, Timer};
use pin_project::pin_project;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// The deadline passed before `future` completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed(());

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deadline elapsed")
    }
}

impl std::error::Error for Elapsed {}

/// Races `future` against `duration`; resolves to `Err(Elapsed)` if the
/// duration passes first.
pub fn timeout<'timer, F: Future>(timer: &'timer Timer, duration: Duration, future: F) -> Timeout<'timer, F> {
    timeout_at(timer, timer.now() + duration, future)
}

/// Races `future` against an absolute `deadline`.
pub fn timeout_at<'timer, F: Future>(timer: &'timer Timer, deadline: Instant, future: F) -> Timeout<'timer, F> {
    Timeout {
        sleep: sleep_until(timer, deadline),
        future,
    }
}

#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `polled`"]
pub struct Timeout<'timer, F> {
    #[pin]
    sleep: Sleep<'timer>,
    #[pin]
    future: F,
}

impl<F: Future> Future for Timeout<'_, F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        // Poll the inner future first: if both are ready on the same poll,
        // prefer the real result over a spurious timeout.
        if let Poll::Ready(output) = this.future.poll(cx) {
            return Poll::Ready(Ok(output));
        }

        match this.sleep.poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Elapsed(()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Clock;
    use futures::executor::block_on;
    use std::future::pending;

    #[test]
    fn elapses_when_future_never_completes() {
        let timer = Timer::new(Clock::system());
        let result = block_on(timeout(&timer, Duration::from_millis(5), pending::<()>()));
        assert_eq!(result, Err(Elapsed(())));
    }

    #[test]
    fn returns_output_when_future_wins() {
        let timer = Timer::new(Clock::system());
        let result = block_on(timeout(&timer, Duration::from_secs(60), async { 42 }));
        assert_eq!(result, Ok(42));
    }
}
