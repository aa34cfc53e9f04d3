// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use arrayvec::ArrayVec;
use std::task::Waker;

/// A small stack-allocated batch of wakers, collected while holding a lock
/// so `Waker::wake` (which may re-enter application code) happens after the
/// lock is released.
#[derive(Default)]
pub struct WakeBatch {
    inner: ArrayVec<Waker, 32>,
}

impl WakeBatch {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: ArrayVec::new() }
    }

    /// Adds `waker` to the batch. Returns `false` if the batch is full and
    /// the waker was not added.
    #[must_use]
    pub fn add_waker(&mut self, waker: Waker) -> bool {
        self.inner.try_push(waker).is_ok()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Wakes and drains every waker currently in the batch.
    pub fn wake_all(&mut self) {
        for waker in self.inner.drain(..) {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountWake(AtomicUsize);
    impl Wake for CountWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn wakes_everything_added() {
        let counter = Arc::new(CountWake(AtomicUsize::new(0)));
        let mut batch = WakeBatch::new();
        for _ in 0..4 {
            assert!(batch.add_waker(Arc::clone(&counter).into()));
        }
        batch.wake_all();
        assert_eq!(counter.0.load(Ordering::SeqCst), 4);
        assert!(batch.is_empty());
    }

    #[test]
    fn rejects_past_capacity() {
        let counter = Arc::new(CountWake(AtomicUsize::new(0)));
        let mut batch = WakeBatch::new();
        for _ in 0..32 {
            assert!(batch.add_waker(Arc::clone(&counter).into()));
        }
        assert!(!batch.add_waker(Arc::clone(&counter).into()));
    }
}
