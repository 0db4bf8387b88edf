//! Fuzz target for retry scheduling.
//!
//! Tests that backoff never panics or overflows on arbitrary inputs,
//! stays under its cap, and never schedules into the past.

#![no_main]

use libfuzzer_sys::fuzz_target;
use outbox_mirror::resilience::BackoffPolicy;
use std::time::Duration;

fuzz_target!(|data: (u64, u64, u32, i64)| {
    let (base_ms, max_ms, attempts, now_ms) = data;
    let max = Duration::from_millis(max_ms);
    let policy = BackoffPolicy::new(Duration::from_millis(base_ms), max);

    let delay = policy.delay_for_attempt(attempts);
    assert!(delay <= max);

    let next = policy.next_attempt_at(now_ms, attempts);
    assert!(next >= now_ms);
});
