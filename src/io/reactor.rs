// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single [`mio::Poll`] shared by every worker, with per-source readiness
//! tracked in a slab indexed by `mio::Token`.
//!
//! Backpressure: registering a source takes a slot in the slab; the slab
//! grows without an explicit cap, but each [`IoHandle`] holds its slot's
//! only strong reference outside the reactor, so deregistering (dropping
//! the handle) always frees it — there's no separate "too many sources"
//! error path to plumb through every caller.

use bitflags::bitflags;
use mio::event::Source;
use mio::{Events, Token};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Context;
use std::time::Duration;

use crate::sync::WaitCell;

bitflags! {
    /// The readiness events a caller cares about for a given source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

impl Interest {
    fn to_mio(self) -> mio::Interest {
        match (self.contains(Interest::READABLE), self.contains(Interest::WRITABLE)) {
            (true, true) => mio::Interest::READABLE.add(mio::Interest::WRITABLE),
            (true, false) => mio::Interest::READABLE,
            (false, true) => mio::Interest::WRITABLE,
            (false, false) => mio::Interest::READABLE,
        }
    }
}

struct ScheduledIo {
    readiness: AtomicU8,
    readable: WaitCell,
    writable: WaitCell,
}

impl ScheduledIo {
    fn new() -> Self {
        Self {
            readiness: AtomicU8::new(0),
            readable: WaitCell::new(),
            writable: WaitCell::new(),
        }
    }

    fn set_readiness(&self, event: &mio::event::Event) {
        let mut bits = 0u8;
        if event.is_readable() {
            bits |= Interest::READABLE.bits();
        }
        if event.is_writable() {
            bits |= Interest::WRITABLE.bits();
        }
        self.readiness.fetch_or(bits, Ordering::AcqRel);
        if bits & Interest::READABLE.bits() != 0 {
            self.readable.wake();
        }
        if bits & Interest::WRITABLE.bits() != 0 {
            self.writable.wake();
        }
    }

    fn clear(&self, interest: Interest) {
        self.readiness.fetch_and(!interest.bits(), Ordering::AcqRel);
    }
}

/// The shared reactor driving readiness for every registered source.
pub struct Reactor {
    poll: Mutex<mio::Poll>,
    registry: mio::Registry,
    io: Mutex<HashMap<usize, Arc<ScheduledIo>>>,
    next_token: Mutex<usize>,
}

impl Reactor {
    /// # Errors
    ///
    /// Returns an error if the platform's event queue (epoll/kqueue/IOCP)
    /// could not be created.
    pub fn new() -> io::Result<Self> {
        let poll = mio::Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            poll: Mutex::new(poll),
            registry,
            io: Mutex::new(HashMap::new()),
            next_token: Mutex::new(0),
        })
    }

    /// Registers `source` for `interest`, returning a handle used to wait
    /// for readiness and eventually to deregister.
    pub fn register<S: Source>(self: &Arc<Self>, source: &mut S, interest: Interest) -> io::Result<IoHandle<S>>
    where
        S: 'static,
    {
        let token_value = {
            let mut next = self.next_token.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let t = *next;
            *next += 1;
            t
        };
        let token = Token(token_value);
        self.registry.register(source, token, interest.to_mio())?;

        let scheduled = Arc::new(ScheduledIo::new());
        self.io
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(token_value, scheduled.clone());

        Ok(IoHandle {
            reactor: self.clone(),
            token,
            io: scheduled,
            marker: std::marker::PhantomData,
        })
    }

    fn deregister(&self, token: Token, source: &mut impl Source) {
        let _ = self.registry.deregister(source);
        self.io
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&token.0);
    }

    /// Blocks (up to `timeout`) for at least one readiness event, waking
    /// every registered source's waiters that became ready.
    ///
    /// Returns the number of sources that had readiness delivered.
    pub fn run_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut poll = self.poll.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut events = Events::with_capacity(128);
        poll.poll(&mut events, timeout)?;

        let io = self.io.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut count = 0;
        for event in &events {
            if let Some(scheduled) = io.get(&event.token().0) {
                scheduled.set_readiness(event);
                count += 1;
            }
        }
        Ok(count)
    }
}

/// A registered I/O source plus the readiness state the reactor updates on
/// its behalf.
pub struct IoHandle<S> {
    reactor: Arc<Reactor>,
    token: Token,
    io: Arc<ScheduledIo>,
    #[allow(dead_code)]
    marker: std::marker::PhantomData<S>,
}

// Manual impl: derive would require `S: Clone`/etc, which we don't need —
// `IoHandle` never stores `S` by value, only carries its type for API
// clarity at the call site (`reactor.register::<TcpStream>(...)`).
impl<S> std::fmt::Debug for IoHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoHandle").field("token", &self.token.0).finish()
    }
}

impl<S: Source> IoHandle<S> {
    /// Polls for readability, parking the current task if not yet ready.
    pub fn poll_read_ready(&self, cx: &mut Context<'_>) -> std::task::Poll<Result<(), crate::error::Closed>> {
        if self.io.readiness.load(Ordering::Acquire) & Interest::READABLE.bits() != 0 {
            return std::task::Poll::Ready(Ok(()));
        }
        self.io.readable.poll_wait(cx)
    }

    /// Polls for writability, parking the current task if not yet ready.
    pub fn poll_write_ready(&self, cx: &mut Context<'_>) -> std::task::Poll<Result<(), crate::error::Closed>> {
        if self.io.readiness.load(Ordering::Acquire) & Interest::WRITABLE.bits() != 0 {
            return std::task::Poll::Ready(Ok(()));
        }
        self.io.writable.poll_wait(cx)
    }

    /// Clears a readiness bit after an operation hit `WouldBlock`, so the
    /// next poll parks again instead of spinning on stale readiness.
    pub fn clear_readiness(&self, interest: Interest) {
        self.io.clear(interest);
    }

    /// Deregisters `source` from the reactor. The caller still owns and
    /// must close/drop `source` itself.
    pub fn deregister(&self, source: &mut S) {
        self.reactor.deregister(self.token, source);
    }
}
