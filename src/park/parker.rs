// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::Park;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::task::{RawWaker, RawWakerVTable, Waker};
use std::time::Duration;

/// Wraps a [`Park`] implementation so it can be parked on directly or
/// converted into a [`Waker`]/[`UnparkToken`] that other threads use to wake
/// it back up.
#[derive(Debug)]
pub struct Parker<P>(Arc<P>);

/// The unparking half of a [`Parker`]: cheap to clone, `Send + Sync`, and
/// usable from any thread to wake the thread that created the original
/// `Parker`.
#[derive(Debug)]
pub struct UnparkToken<P>(Arc<P>);

assert_impl_all!(UnparkToken<crate::park::ThreadPark>: Send, Sync);

impl<P: Park> Parker<P> {
    #[must_use]
    pub fn new(park: P) -> Self {
        Self(Arc::new(park))
    }

    pub fn park(&self) {
        self.0.park();
    }

    pub fn park_timeout(&self, timeout: Duration) {
        self.0.park_timeout(timeout);
    }

    #[must_use]
    pub fn unpark_token(&self) -> UnparkToken<P> {
        UnparkToken(self.0.clone())
    }

    /// Converts this parker into a [`Waker`] that unparks it when woken.
    #[must_use]
    pub fn into_waker(self) -> Waker {
        self.unpark_token().into_waker()
    }
}

impl<P> Clone for Parker<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<P: Park> UnparkToken<P> {
    pub fn unpark(&self) {
        self.0.unpark();
    }

    /// Converts this token into a [`Waker`] that calls [`Park::unpark`] when
    /// woken, via a hand-rolled [`RawWakerVTable`].
    #[must_use]
    pub fn into_waker(self) -> Waker {
        let raw = Self::raw_waker(Arc::into_raw(self.0));
        // Safety: `raw` was constructed by `Self::raw_waker`, whose vtable
        // upholds the `RawWaker`/`Waker` contract.
        unsafe { Waker::from_raw(raw) }
    }

    const VTABLE: RawWakerVTable =
        RawWakerVTable::new(Self::clone_waker, Self::wake, Self::wake_by_ref, Self::drop_waker);

    // `Waker::will_wake` compares vtable pointers across clones; keeping
    // this out-of-line keeps the address the inliner would otherwise be
    // free to duplicate stable.
    #[inline(never)]
    fn raw_waker(data: *const P) -> RawWaker {
        RawWaker::new(data.cast::<()>(), &Self::VTABLE)
    }

    unsafe fn clone_waker(data: *const ()) -> RawWaker {
        // Safety: `data` originated from `Arc::into_raw::<P>` in `into_waker`
        // or a previous call to this function, and is not yet dropped.
        unsafe {
            Arc::increment_strong_count(data.cast::<P>());
        }
        Self::raw_waker(data.cast::<P>())
    }

    unsafe fn wake(data: *const ()) {
        // Safety: see `clone_waker`; this consumes the reference count the
        // waker being woken-by-value owned.
        let park = unsafe { Arc::from_raw(data.cast::<P>()) };
        park.unpark();
    }

    unsafe fn wake_by_ref(data: *const ()) {
        // Safety: see `clone_waker`; borrowed only for the duration of the call.
        let park = unsafe { &*data.cast::<P>() };
        park.unpark();
    }

    unsafe fn drop_waker(data: *const ()) {
        // Safety: see `clone_waker`.
        drop(unsafe { Arc::from_raw(data.cast::<P>()) });
    }
}

impl<P> Clone for UnparkToken<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::park::ThreadPark;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn parking_basically_works() {
        let parker = Parker::new(ThreadPark::current());
        let token = parker.unpark_token();
        token.unpark();
        parker.park_timeout(Duration::from_millis(50));
    }

    #[test]
    fn waker_wakes_parked_thread() {
        let parker = Parker::new(ThreadPark::current());
        let waker = parker.clone().into_waker();
        let woke = Arc::new(AtomicBool::new(false));

        let woke2 = woke.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            woke2.store(true, Ordering::SeqCst);
            waker.wake();
        });

        parker.park_timeout(Duration::from_secs(5));
        handle.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
    }
}
