// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Converting an OS-thread park/unpark pair into a [`Waker`](std::task::Waker).
//!
//! Used by [`crate::executor::block_on`] to drive a future on the calling
//! thread without a worker pool: the thread parks whenever the future
//! returns `Pending`, and the generated waker unparks it again.

mod parker;

pub use parker::{Parker, UnparkToken};

use std::time::Duration;

/// A type that can park and unpark the thread that created it.
pub trait Park: Send + Sync + 'static {
    /// Blocks the current thread until [`unpark`](Self::unpark) is called.
    ///
    /// May return spuriously; callers must re-check their condition.
    fn park(&self);

    /// Like [`park`](Self::park), but gives up after `timeout`.
    fn park_timeout(&self, timeout: Duration);

    /// Wakes a thread blocked in [`park`](Self::park)/[`park_timeout`](Self::park_timeout).
    ///
    /// Callable from any thread, including the parked one itself.
    fn unpark(&self);
}

/// A [`Park`] backed directly by `std::thread::park`/`Thread::unpark`.
#[derive(Debug, Clone)]
pub struct ThreadPark(std::thread::Thread);

impl ThreadPark {
    /// Captures a handle to the *current* thread.
    ///
    /// `park`/`park_timeout` on the returned value must only be called from
    /// that same thread; `unpark` may be called from anywhere.
    #[must_use]
    pub fn current() -> Self {
        Self(std::thread::current())
    }
}

impl Park for ThreadPark {
    fn park(&self) {
        std::thread::park();
    }

    fn park_timeout(&self, timeout: Duration) {
        std::thread::park_timeout(timeout);
    }

    fn unpark(&self) {
        self.0.unpark();
    }
}
