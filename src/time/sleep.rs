// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::time::timer::EntryState;
use crate::time::{Instant, Timer};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Completes once `timer`'s clock reaches `deadline`.
///
/// No field here is self-referential or needs structural pinning; `Sleep`
/// is `Unpin` and only implements `Future` by convention with the rest of
/// this crate's time futures.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep<'timer> {
    timer: &'timer Timer,
    entry: Option<Arc<EntryState>>,
}

/// Returns a future that completes after `duration` has elapsed, as
/// measured by `timer`.
pub fn sleep(timer: &Timer, duration: Duration) -> Sleep<'_> {
    sleep_until(timer, timer.now() + duration)
}

/// Returns a future that completes once `timer`'s clock reaches `deadline`.
pub fn sleep_until(timer: &Timer, deadline: Instant) -> Sleep<'_> {
    Sleep {
        timer,
        entry: Some(timer.register(deadline)),
    }
}

impl Future for Sleep<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let entry = this.entry.as_ref().expect("Sleep polled after completion");

        // Opportunistic fast path: if the deadline already passed between
        // registration and this poll, don't wait on the driver thread to
        // notice. The driver thread (owned by `Timer`) is what guarantees
        // forward progress even if this future is never polled again.
        this.timer.turn();

        if entry.is_fired() {
            this.entry = None;
            return Poll::Ready(());
        }

        entry.register_waker(cx.waker());

        if entry.is_fired() {
            this.entry = None;
            return Poll::Ready(());
        }

        Poll::Pending
    }
}

impl Drop for Sleep<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            entry.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Clock;
    use futures::executor::block_on;

    #[test]
    fn sleep_completes_after_deadline_passes() {
        let timer = Timer::new(Clock::system());
        block_on(sleep(&timer, Duration::from_millis(5)));
    }

    #[test]
    fn dropping_sleep_does_not_panic() {
        let timer = Timer::new(Clock::system());
        let fut = sleep(&timer, Duration::from_secs(60));
        drop(fut);
    }
}
