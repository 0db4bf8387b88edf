//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Primary writes and the inline mirror outcome
//! - Outbox depth, enqueues and SQLite retries
//! - Drain ticks, applies, failures and dead letters
//! - Secondary liveness
//! - Circuit breaker calls
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `mirror_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! # Usage
//!
//! ```rust,no_run
//! use outbox_mirror::metrics;
//! use std::time::Duration;
//!
//! metrics::record_inline_outcome("Wallet", "enqueued_unavailable");
//! metrics::record_tick(12, 1, 0, 3, Duration::from_millis(40));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Write Path
// =============================================================================

/// Record a primary write.
pub fn record_primary_write(entity: &str, op: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "mirror_primary_writes_total",
        "entity" => entity.to_string(),
        "op" => op.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record how the inline secondary step ended.
///
/// Outcomes: `mirrored`, `enqueued_behind`, `enqueued_unavailable`,
/// `enqueued_failed`, `enqueued_rejected`, `enqueue_error`.
pub fn record_inline_outcome(entity: &str, outcome: &str) {
    counter!(
        "mirror_inline_outcomes_total",
        "entity" => entity.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record inline secondary write latency.
pub fn record_inline_latency(entity: &str, duration: Duration) {
    histogram!("mirror_inline_duration_seconds", "entity" => entity.to_string())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Outbox
// =============================================================================

/// Record an outbox append.
pub fn record_enqueue(entity: &str, op: &str) {
    counter!(
        "mirror_outbox_enqueued_total",
        "entity" => entity.to_string(),
        "op" => op.to_string()
    )
    .increment(1);
}

/// Record outbox SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_outbox_retry(operation: &str) {
    counter!("mirror_outbox_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a row moved to the dead-letter table.
pub fn record_dead_letter(reason: &str) {
    counter!("mirror_dead_letters_total", "reason" => reason.to_string()).increment(1);
}

/// Set outbox depth gauges.
pub fn set_backlog(pending: u64, dead: u64, oldest_age: Option<Duration>) {
    gauge!("mirror_outbox_pending").set(pending as f64);
    gauge!("mirror_outbox_dead").set(dead as f64);
    gauge!("mirror_outbox_oldest_age_seconds").set(oldest_age.map_or(0.0, |d| d.as_secs_f64()));
}

/// Record a backlog threshold breach.
pub fn record_backlog_alert(pending: u64, threshold: u64) {
    counter!("mirror_backlog_alerts_total").increment(1);
    gauge!("mirror_backlog_alert_threshold").set(threshold as f64);
    gauge!("mirror_backlog_over_threshold").set(pending.saturating_sub(threshold) as f64);
}

// =============================================================================
// Drain
// =============================================================================

/// Record a completed drain tick.
pub fn record_tick(applied: u64, failed: u64, dead_lettered: u64, deferred: u64, duration: Duration) {
    counter!("mirror_ticks_total").increment(1);
    counter!("mirror_applied_total").increment(applied);
    if failed > 0 {
        counter!("mirror_apply_failures_total").increment(failed);
    }
    if dead_lettered > 0 {
        counter!("mirror_tick_dead_lettered_total").increment(dead_lettered);
    }
    if deferred > 0 {
        counter!("mirror_deferred_total").increment(deferred);
    }
    histogram!("mirror_tick_duration_seconds").record(duration.as_secs_f64());
}

/// Record a skipped drain tick.
pub fn record_tick_skipped(reason: &str) {
    counter!("mirror_ticks_skipped_total", "reason" => reason.to_string()).increment(1);
}

/// Record a failed secondary apply by error kind.
pub fn record_apply_failure(entity: &str, kind: &str) {
    counter!(
        "mirror_apply_errors_total",
        "entity" => entity.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record an outbox row whose model name has no registry entry.
pub fn record_unresolved(model_name: &str) {
    counter!("mirror_unresolved_total", "model" => model_name.to_string()).increment(1);
}

// =============================================================================
// Liveness
// =============================================================================

/// Record a liveness probe.
pub fn record_probe(up: bool, latency: Duration) {
    let status = if up { "up" } else { "down" };
    counter!("mirror_probes_total", "status" => status).increment(1);
    histogram!("mirror_probe_duration_seconds").record(latency.as_secs_f64());
}

/// Gauge for secondary availability (1 = reachable).
pub fn set_secondary_available(up: bool) {
    gauge!("mirror_secondary_available").set(if up { 1.0 } else { 0.0 });
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        "Failed" => 4.0,
        _ => -1.0,
    };
    gauge!("mirror_engine_state").set(value);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "mirror_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
