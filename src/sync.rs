// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wait primitives used to build higher-level async synchronization
//! (channels, notify-style signals) on top of a single [`Waker`](std::task::Waker)
//! slot or a list of them.

mod oneshot;
mod wait_cell;
mod wait_queue;
mod wake_batch;

pub use oneshot::{channel, Receiver, Sender};
pub use wait_cell::WaitCell;
pub use wait_queue::{Wait, WaitQueue};
pub use wake_batch::WakeBatch;

pub use crate::error::Closed;
