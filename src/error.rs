// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;

/// A resource was closed while an operation was in flight.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct Closed(pub(crate) ());

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the resource has been closed")
    }
}

impl std::error::Error for Closed {}

/// Errors returned by [`spawn`](crate::Runtime::spawn) and
/// [`spawn_blocking`](crate::Runtime::spawn_blocking).
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The runtime's spawn queue is at capacity.
    #[error("scheduler queue is at capacity")]
    Full,
    /// The runtime has been stopped and is no longer accepting new tasks.
    #[error("runtime is shutting down")]
    Closed,
}
