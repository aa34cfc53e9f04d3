// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shared helpers for this crate's own test modules. Not part of the public
//! API.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a `tracing` subscriber that prints to the test harness's
/// captured stdout, so `cargo test -- --nocapture` shows span/event output.
/// Idempotent; safe to call at the top of every test.
pub(crate) fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
