// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Driving a future to completion from a plain OS thread, outside the
//! worker pool.
//!
//! `await` itself is Rust's native suspension point; there is no separate
//! bytecode or callback form layered on top of it here. What this module
//! provides is the other end of that contract — something that can be
//! `.await`ed needs a driver loop somewhere, and for the thread that isn't
//! already a worker (`main`, a test, an FFI callback), [`block_on`] is it.
//!
//! The loop has three phases per future:
//!
//! 1. **Fast poll** — try once immediately. Most futures that are ready
//!    synchronously (an already-resolved `JoinHandle`, a non-blocking
//!    channel recv) finish here without ever touching a [`Waker`].
//! 2. **Event-driven wait** — on `Pending`, park the thread behind a waker
//!    built from a [`Parker`], and re-poll once that waker fires.
//! 3. **Fallback** — calling this from a thread that is itself a runtime
//!    worker still works (it parks that thread), but it stalls that
//!    worker's own run queue until the future resolves; a `tracing::warn!`
//!    flags that case so it shows up in logs rather than as a silent
//!    throughput cliff.

use crate::park::Parker;
use std::future::Future;
use std::pin::pin;
use std::task::{Context, Poll};

/// Blocks the current thread until `future` completes.
///
/// See the module docs for the three-phase strategy used to drive it.
pub fn block_on<F: Future>(future: F) -> F::Output {
    if crate::executor::is_worker_thread() {
        tracing::warn!("block_on called from a worker thread; this stalls its run queue until the future resolves");
    }

    let mut future = pin!(future);
    let parker = Parker::new(crate::park::ThreadPark::current());
    let waker = parker.clone().into_waker();
    let mut cx = Context::from_waker(&waker);

    // Phase 1: fast poll.
    if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
        return output;
    }

    // Phase 2/3: park and re-poll until ready.
    loop {
        parker.park();
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_an_already_ready_future() {
        assert_eq!(block_on(async { 5 }), 5);
    }

    #[test]
    fn resolves_after_a_real_wakeup() {
        use crate::task::yield_now;
        let result = block_on(async {
            yield_now().await;
            "done"
        });
        assert_eq!(result, "done");
    }
}
