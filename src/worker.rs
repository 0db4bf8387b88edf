// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync worker: periodic outbox drain.
//!
//! Replays pending intents against the secondary store once it is reachable
//! again, deleting each row only after the secondary confirms it.
//!
//! # Tick
//!
//! 1. Single-flight: if another tick holds the guard, return `SkippedOverlap`
//! 2. Probe the secondary; if down, return `SkippedSecondaryDown`
//! 3. Lease the oldest due rows (bounded batch, insertion order)
//! 4. For each row, first renew its lease (a row another worker has taken
//!    over is left alone, `lease_lost`), then:
//!    - model blocked earlier this tick → release (deferred)
//!    - model not registered → dead-letter `unknown_entity`
//!    - row undecodable → dead-letter `malformed`
//!    - apply (timeout, rate limit) → delete on success
//!    - failure → `attempts + 1` with backoff, or dead-letter
//!      `attempts_exhausted`; the model is blocked for the rest of the tick
//!    - secondary reported unavailable → release the remaining rows
//!      (deferred) and end the tick
//! 5. Refresh backlog gauges; warn above the alert threshold
//!
//! An outbox (SQLite) error aborts the tick. Rows still leased are picked
//! up again once their lease expires.
//!
//! # Record States
//!
//! ```text
//! Pending ──apply ok──────────────▶ Applied (row deleted)
//!    │
//!    ├──apply err, attempts < max─▶ Pending (attempts+1, next_attempt_at)
//!    │
//!    └──unknown / malformed / ────▶ DeadLettered
//!       attempts exhausted
//! ```

use crate::config::WorkerConfig;
use crate::error::{MirrorError, Result};
use crate::metrics;
use crate::operation::apply_to;
use crate::outbox::{DeadLetterReason, OperationRecord, Outbox};
use crate::prober::{Liveness, LivenessProber};
use crate::registry::EntityRegistry;
use crate::resilience::{BackoffPolicy, RateLimiter};
use crate::store::StoreError;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// How a tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The tick claimed and processed rows (possibly none).
    Ran,
    /// Another tick was in progress.
    SkippedOverlap,
    /// The secondary did not answer the liveness probe.
    SkippedSecondaryDown,
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub outcome: TickOutcome,
    pub claimed: u64,
    pub applied: u64,
    /// Applies that failed and were rescheduled.
    pub failed: u64,
    /// Rows moved to dead letters (any reason).
    pub dead_lettered: u64,
    pub unresolved: u64,
    pub malformed: u64,
    /// Rows released untouched: an earlier row of the same model failed,
    /// or the secondary went down mid-tick.
    pub deferred: u64,
    /// Rows skipped because another worker took over their lease.
    pub lease_lost: u64,
    /// Pending rows left after the tick.
    pub pending_after: u64,
    pub duration: Duration,
}

impl TickReport {
    fn new(outcome: TickOutcome) -> Self {
        Self {
            outcome,
            claimed: 0,
            applied: 0,
            failed: 0,
            dead_lettered: 0,
            unresolved: 0,
            malformed: 0,
            deferred: 0,
            lease_lost: 0,
            pending_after: 0,
            duration: Duration::ZERO,
        }
    }
}

/// Cumulative worker counters.
///
/// `dead_lettered` includes `unresolved` and `malformed` rows; neither is
/// ever counted in `applied`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub ticks: u64,
    pub skipped_overlap: u64,
    pub skipped_secondary_down: u64,
    pub tick_errors: u64,
    pub applied: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub unresolved: u64,
    pub malformed: u64,
    pub deferred: u64,
    pub lease_lost: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    skipped_overlap: AtomicU64,
    skipped_secondary_down: AtomicU64,
    tick_errors: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    unresolved: AtomicU64,
    malformed: AtomicU64,
    deferred: AtomicU64,
    lease_lost: AtomicU64,
}

impl Counters {
    fn add(&self, report: &TickReport) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.applied.fetch_add(report.applied, Ordering::Relaxed);
        self.failed.fetch_add(report.failed, Ordering::Relaxed);
        self.dead_lettered.fetch_add(report.dead_lettered, Ordering::Relaxed);
        self.unresolved.fetch_add(report.unresolved, Ordering::Relaxed);
        self.malformed.fetch_add(report.malformed, Ordering::Relaxed);
        self.deferred.fetch_add(report.deferred, Ordering::Relaxed);
        self.lease_lost.fetch_add(report.lease_lost, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            skipped_overlap: self.skipped_overlap.load(Ordering::Relaxed),
            skipped_secondary_down: self.skipped_secondary_down.load(Ordering::Relaxed),
            tick_errors: self.tick_errors.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            lease_lost: self.lease_lost.load(Ordering::Relaxed),
        }
    }
}

/// Per-record result inside a tick.
enum RecordOutcome {
    Applied,
    Rescheduled,
    DeadLettered(DeadLetterReason),
    /// Another worker holds the row now.
    LeaseLost,
}

/// Background drain of the outbox.
pub struct SyncWorker {
    registry: Arc<EntityRegistry>,
    outbox: Arc<Outbox>,
    prober: Arc<LivenessProber>,
    config: WorkerConfig,
    backoff: BackoffPolicy,
    worker_id: String,
    tick_lock: Mutex<()>,
    rate_limiter: Option<RateLimiter>,
    counters: Counters,
}

impl SyncWorker {
    pub fn new(
        registry: Arc<EntityRegistry>,
        outbox: Arc<Outbox>,
        prober: Arc<LivenessProber>,
        config: WorkerConfig,
    ) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self::with_worker_id(registry, outbox, prober, config, format!("worker-{}", &id[..8]))
    }

    /// Like [`new`](Self::new) with an explicit lease owner name.
    pub fn with_worker_id(
        registry: Arc<EntityRegistry>,
        outbox: Arc<Outbox>,
        prober: Arc<LivenessProber>,
        config: WorkerConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        let rate_limiter = config.rate_limit_config().map(RateLimiter::new);
        Self {
            registry,
            outbox,
            prober,
            backoff: config.backoff_policy(),
            config,
            worker_id: worker_id.into(),
            tick_lock: Mutex::new(()),
            rate_limiter,
            counters: Counters::default(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Cumulative counters.
    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Run one drain tick.
    ///
    /// Returns `Err` only for outbox failures; secondary failures are
    /// recorded on the rows and reported in the [`TickReport`].
    #[instrument(skip(self), fields(worker = %self.worker_id))]
    pub async fn run_tick(&self) -> Result<TickReport> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            debug!("Tick already in progress, skipping");
            self.counters.skipped_overlap.fetch_add(1, Ordering::Relaxed);
            metrics::record_tick_skipped("overlap");
            return Ok(TickReport::new(TickOutcome::SkippedOverlap));
        };

        let start = Instant::now();

        if !self.prober.is_available().await {
            debug!("Secondary down, skipping tick");
            self.counters.skipped_secondary_down.fetch_add(1, Ordering::Relaxed);
            metrics::record_tick_skipped("secondary_down");
            return Ok(TickReport::new(TickOutcome::SkippedSecondaryDown));
        }

        let result = self.drain(start).await;
        if result.is_err() {
            self.counters.tick_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn drain(&self, start: Instant) -> Result<TickReport> {
        let mut report = TickReport::new(TickOutcome::Ran);
        let lease = self.config.lease_duration();
        let records = self
            .outbox
            .claim_due(&self.worker_id, self.config.batch_size, lease)
            .await?;
        report.claimed = records.len() as u64;

        let mut blocked: HashSet<String> = HashSet::new();
        let mut records = records.into_iter();
        while let Some(record) = records.next() {
            if blocked.contains(&record.model_name) {
                self.outbox.release(record.id, &self.worker_id).await?;
                report.deferred += 1;
                continue;
            }

            match self.process(&record, lease).await? {
                RecordOutcome::Applied => report.applied += 1,
                RecordOutcome::Rescheduled => {
                    report.failed += 1;
                    blocked.insert(record.model_name.clone());
                }
                RecordOutcome::DeadLettered(reason) => {
                    report.dead_lettered += 1;
                    match reason {
                        DeadLetterReason::UnknownEntity => report.unresolved += 1,
                        DeadLetterReason::Malformed => report.malformed += 1,
                        DeadLetterReason::AttemptsExhausted => {
                            blocked.insert(record.model_name.clone());
                        }
                    }
                }
                RecordOutcome::LeaseLost => report.lease_lost += 1,
            }

            if self.prober.last_state() == Liveness::Down {
                let mut released = 0u64;
                for rest in records.by_ref() {
                    self.outbox.release(rest.id, &self.worker_id).await?;
                    released += 1;
                }
                if released > 0 {
                    info!(released, "Secondary went down mid-tick, releasing remaining rows");
                }
                report.deferred += released;
                break;
            }
        }

        report.pending_after = self.refresh_backlog().await?;
        report.duration = start.elapsed();
        self.counters.add(&report);
        metrics::record_tick(
            report.applied,
            report.failed,
            report.dead_lettered,
            report.deferred,
            report.duration,
        );

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                applied = report.applied,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                deferred = report.deferred,
                lease_lost = report.lease_lost,
                pending = report.pending_after,
                duration_ms = report.duration.as_millis() as u64,
                "Drain tick complete"
            );
        }
        Ok(report)
    }

    async fn process(&self, record: &OperationRecord, lease: Duration) -> Result<RecordOutcome> {
        // Earlier rows may have used up most of the claim-time lease
        if !self.outbox.renew_lease(record.id, &self.worker_id, lease).await? {
            return Ok(self.lease_lost(record));
        }

        let Some(pair) = self.registry.resolve(&record.model_name) else {
            error!(
                id = record.id,
                operation_id = %record.operation_id,
                entity = %record.model_name,
                "Outbox record names an unregistered entity, dead-lettering"
            );
            metrics::record_unresolved(&record.model_name);
            let message = MirrorError::UnknownEntity(record.model_name.clone()).to_string();
            if !self
                .outbox
                .dead_letter(record.id, &self.worker_id, DeadLetterReason::UnknownEntity, &message)
                .await?
            {
                return Ok(self.lease_lost(record));
            }
            return Ok(RecordOutcome::DeadLettered(DeadLetterReason::UnknownEntity));
        };

        let (op, payload) = match record.operation() {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(id = record.id, operation_id = %record.operation_id, error = %e, "Undecodable outbox record, dead-lettering");
                if !self
                    .outbox
                    .dead_letter(record.id, &self.worker_id, DeadLetterReason::Malformed, &e.to_string())
                    .await?
                {
                    return Ok(self.lease_lost(record));
                }
                return Ok(RecordOutcome::DeadLettered(DeadLetterReason::Malformed));
            }
        };

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
            if !self.outbox.renew_lease(record.id, &self.worker_id, lease).await? {
                return Ok(self.lease_lost(record));
            }
        }

        let apply_timeout = self.config.apply_timeout_duration();
        let apply = apply_to(pair.secondary.as_ref(), &pair.key_field, op, &payload);
        let err = match timeout(apply_timeout, apply).await {
            Ok(Ok(_)) => {
                if !self.outbox.delete(record.id, &self.worker_id).await? {
                    return Ok(self.lease_lost(record));
                }
                debug!(
                    id = record.id,
                    operation_id = %record.operation_id,
                    entity = %record.model_name,
                    op = %op,
                    "Outbox record applied"
                );
                return Ok(RecordOutcome::Applied);
            }
            Ok(Err(source)) => {
                if matches!(source, StoreError::Unavailable(_)) {
                    self.prober.mark_down().await;
                }
                MirrorError::Secondary {
                    entity: record.model_name.clone(),
                    op,
                    source,
                }
            }
            Err(_) => MirrorError::timeout(format!("apply {} {}", op, record.model_name), apply_timeout),
        };

        metrics::record_apply_failure(&record.model_name, err.kind());
        let attempts = u32::try_from(record.attempts).unwrap_or(u32::MAX).saturating_add(1);

        if attempts >= self.config.max_attempts {
            error!(
                id = record.id,
                operation_id = %record.operation_id,
                entity = %record.model_name,
                attempts,
                error = %err,
                "Giving up on outbox record, dead-lettering"
            );
            if !self
                .outbox
                .dead_letter(record.id, &self.worker_id, DeadLetterReason::AttemptsExhausted, &err.to_string())
                .await?
            {
                return Ok(self.lease_lost(record));
            }
            return Ok(RecordOutcome::DeadLettered(DeadLetterReason::AttemptsExhausted));
        }

        let next_attempt_at = self
            .backoff
            .next_attempt_at(chrono::Utc::now().timestamp_millis(), attempts);
        warn!(
            id = record.id,
            operation_id = %record.operation_id,
            entity = %record.model_name,
            attempts,
            retry_in_ms = self.backoff.delay_for_attempt(attempts).as_millis() as u64,
            error = %err,
            "Secondary apply failed, will retry"
        );
        if !self
            .outbox
            .record_failure(record.id, &self.worker_id, next_attempt_at, &err.to_string())
            .await?
        {
            return Ok(self.lease_lost(record));
        }
        Ok(RecordOutcome::Rescheduled)
    }

    fn lease_lost(&self, record: &OperationRecord) -> RecordOutcome {
        warn!(
            id = record.id,
            operation_id = %record.operation_id,
            entity = %record.model_name,
            "Lease on outbox record taken over by another worker, leaving it"
        );
        RecordOutcome::LeaseLost
    }

    async fn refresh_backlog(&self) -> Result<u64> {
        let stats = self.outbox.backlog_stats().await?;
        let now = chrono::Utc::now().timestamp_millis();
        metrics::set_backlog(stats.pending, stats.dead, stats.oldest_age(now));

        let threshold = self.config.backlog_alert_threshold;
        if threshold > 0 && stats.pending > threshold {
            warn!(
                pending = stats.pending,
                threshold,
                oldest_age_ms = stats.oldest_age(now).map(|d| d.as_millis() as u64),
                "Outbox backlog above alert threshold"
            );
            metrics::record_backlog_alert(stats.pending, threshold);
        }
        Ok(stats.pending)
    }

    /// Tick on the configured interval until shutdown is signaled.
    ///
    /// A tick in progress when shutdown arrives runs to completion.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let span = tracing::info_span!("sync_worker", worker = %self.worker_id);

        async move {
            // Mark initial shutdown value as seen so changed() only fires on actual changes
            let _ = shutdown_rx.borrow_and_update();

            let interval = self.config.interval_duration();
            info!(
                interval_ms = interval.as_millis() as u64,
                batch_size = self.config.batch_size,
                max_attempts = self.config.max_attempts,
                "Starting sync worker"
            );

            let mut timer = tokio::time::interval(interval);
            // Skip missed ticks instead of bursting to catch up
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            info!("Shutdown signal received, stopping sync worker");
                            break;
                        }
                        continue;
                    }

                    _ = timer.tick() => {}
                }

                if let Err(e) = self.run_tick().await {
                    error!(error = %e, "Drain tick aborted, retrying next tick");
                }
            }

            info!("Sync worker stopped");
        }
        .instrument(span)
        .await
    }
}
