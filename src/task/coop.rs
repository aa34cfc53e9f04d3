// Copyright 2025 Kestrel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative scheduling budget.
//!
//! `std::task::Context` has a fixed, sealed shape, so there's nowhere to hang
//! a per-poll budget counter directly on it. Instead — the same trick Tokio
//! uses — the budget lives in a thread-local, reset each time a worker starts
//! polling a task and consulted by `should_yield` from inside combinators
//! that want to participate in cooperative yielding (channel recv loops,
//! I/O readiness loops, etc).

use std::cell::Cell;

/// Default budget: a task may call [`should_yield`] this many times per
/// scheduler-tick before being forced to yield.
pub const DEFAULT_BUDGET: usize = 128;

thread_local! {
    static BUDGET: Cell<usize> = const { Cell::new(DEFAULT_BUDGET) };
}

/// Resets the current worker thread's budget to `DEFAULT_BUDGET`.
///
/// Called by the scheduler when it dequeues a task for a fresh poll (not
/// when resuming a task that yielded cooperatively mid-chain — see
/// [`RunGuard`]).
pub(crate) fn reset() {
    BUDGET.with(|b| b.set(DEFAULT_BUDGET));
}

/// Returns `true` once the current task has exhausted its budget for this
/// scheduler tick. Each call before exhaustion consumes one unit of budget.
///
/// The `k`-th call (since the last [`reset`]) returns `true` iff
/// `k > DEFAULT_BUDGET`: the call that consumes the last unit still returns
/// `false` (budget is now zero, but this poll didn't exceed it), and only
/// the next call after that observes exhaustion.
#[must_use]
pub fn should_yield() -> bool {
    BUDGET.with(|b| {
        let remaining = b.get();
        if remaining == 0 {
            return true;
        }
        b.set(remaining - 1);
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kth_call_returns_true_iff_k_exceeds_budget() {
        reset();
        for k in 1..=DEFAULT_BUDGET {
            assert!(!should_yield(), "call {k} should not report exhaustion");
        }
        assert!(should_yield(), "call {} should report exhaustion", DEFAULT_BUDGET + 1);
        assert!(should_yield(), "budget stays exhausted until the next reset");
    }

    #[test]
    fn reset_restores_full_budget() {
        reset();
        for _ in 0..DEFAULT_BUDGET {
            should_yield();
        }
        assert!(should_yield());
        reset();
        assert_eq!(remaining(), DEFAULT_BUDGET);
        assert!(!should_yield());
    }

    #[test]
    fn remaining_counts_down_without_consuming() {
        reset();
        assert_eq!(remaining(), DEFAULT_BUDGET);
        should_yield();
        assert_eq!(remaining(), DEFAULT_BUDGET - 1);
        assert_eq!(remaining(), DEFAULT_BUDGET - 1);
    }
}

/// Returns the number of budget units remaining without consuming any.
#[must_use]
pub fn remaining() -> usize {
    BUDGET.with(Cell::get)
}
