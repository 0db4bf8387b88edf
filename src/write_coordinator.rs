//! Write coordinator: primary first, mirror inline, otherwise enqueue.
//!
//! # Call Flow
//!
//! ```text
//! perform(mutation, pair, outbox)
//!   │
//!   ├─ validate ──────────────── InvalidMutation (nothing written)
//!   │
//!   ├─ primary write ─────────── Primary error (propagated, nothing enqueued)
//!   │    create: row returned, key copied into mirrored data
//!   │    update: re-read by `where`
//!   │    delete: snapshot read before the delete
//!   │
//!   ├─ older rows for this model queued? ─────────┐
//!   │                                             │
//!   ├─ prober.is_available()?                     │
//!   │    no ──────────────────────────────────────┤
//!   │    yes: circuit ▸ timeout ▸ secondary apply │
//!   │         ok ──── return primary result       │
//!   │         err / timeout / rejected ───────────┤
//!   │                                             ▼
//!   └──────────────────────────────── outbox.append(attempts = 0)
//!                                        ok ── return primary result
//!                                        err ─ EnqueueFailed
//! ```
//!
//! A mutation never overtakes queued rows of its own model: while any are
//! pending it is enqueued behind them instead of mirrored inline.
//!
//! Secondary problems never reach the caller. The one exception is a failed
//! outbox append: the primary write has committed but the mirror will miss
//! it, and the caller is told so through [`MirrorError::EnqueueFailed`].

use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::config::CoordinatorConfig;
use crate::error::{MirrorError, Result};
use crate::metrics;
use crate::operation::{apply_to, Mutation, NewOperation, OpKind, Payload};
use crate::outbox::Outbox;
use crate::prober::LivenessProber;
use crate::registry::StorePair;
use crate::store::{Row, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, instrument, warn};

/// Why the inline attempt did not mirror the mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fallback {
    /// Older rows of the same model are still queued.
    Behind,
    Unavailable,
    Failed,
    Rejected,
}

impl Fallback {
    fn outcome(self) -> &'static str {
        match self {
            Fallback::Behind => "enqueued_behind",
            Fallback::Unavailable => "enqueued_unavailable",
            Fallback::Failed => "enqueued_failed",
            Fallback::Rejected => "enqueued_rejected",
        }
    }
}

/// Synchronous entry point for replicated mutations.
pub struct WriteCoordinator {
    prober: Arc<LivenessProber>,
    circuit: CircuitBreaker,
    secondary_timeout: Duration,
}

impl WriteCoordinator {
    pub fn new(prober: Arc<LivenessProber>, config: &CoordinatorConfig) -> Self {
        Self {
            prober,
            circuit: CircuitBreaker::new("secondary_writes", config.circuit_config()),
            secondary_timeout: config.secondary_timeout_duration(),
        }
    }

    pub fn prober(&self) -> &Arc<LivenessProber> {
        &self.prober
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Perform `mutation` on the primary and replicate it to the secondary.
    ///
    /// Returns the primary result: the created row, the re-read updated row,
    /// or the pre-delete snapshot (`None` when nothing matched).
    #[instrument(skip_all, fields(entity = %mutation.entity, op = %mutation.op))]
    pub async fn perform(
        &self,
        mutation: &Mutation,
        pair: &StorePair,
        outbox: &Outbox,
    ) -> Result<Option<Row>> {
        mutation.validate()?;

        let (primary_result, payload) = self.write_primary(mutation, pair).await?;

        let fallback = if self.behind_outbox(&mutation.entity, outbox).await {
            Fallback::Behind
        } else if self.prober.is_available().await {
            match self.mirror_inline(mutation, pair, &payload).await {
                Ok(()) => {
                    metrics::record_inline_outcome(&mutation.entity, "mirrored");
                    debug!("Mirrored inline");
                    return Ok(primary_result);
                }
                Err(fallback) => fallback,
            }
        } else {
            Fallback::Unavailable
        };

        let intent = NewOperation::new(&mutation.entity, mutation.op, payload);
        match outbox.append(&intent).await {
            Ok(id) => {
                metrics::record_inline_outcome(&mutation.entity, fallback.outcome());
                debug!(
                    outbox_id = id,
                    operation_id = %intent.operation_id,
                    reason = fallback.outcome(),
                    "Mutation enqueued for mirroring"
                );
                Ok(primary_result)
            }
            Err(source) => {
                metrics::record_inline_outcome(&mutation.entity, "enqueue_error");
                error!(
                    operation_id = %intent.operation_id,
                    error = %source,
                    "Primary write committed but outbox append failed"
                );
                Err(MirrorError::EnqueueFailed {
                    entity: mutation.entity.clone(),
                    operation_id: intent.operation_id,
                    source,
                })
            }
        }
    }

    /// Whether queued rows for `entity` must be applied before this mutation.
    ///
    /// A read error counts as "not behind"; the append that may follow
    /// surfaces a broken outbox anyway.
    async fn behind_outbox(&self, entity: &str, outbox: &Outbox) -> bool {
        match outbox.has_pending(entity).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Failed to check outbox for pending rows");
                false
            }
        }
    }

    /// Apply to the primary. Returns the primary result and the payload to mirror.
    async fn write_primary(&self, mutation: &Mutation, pair: &StorePair) -> Result<(Option<Row>, Payload)> {
        let primary_err = |source: StoreError| {
            metrics::record_primary_write(&mutation.entity, mutation.op.as_str(), false);
            MirrorError::Primary {
                entity: mutation.entity.clone(),
                op: mutation.op,
                source,
            }
        };
        let mut payload = mutation.payload();

        let result = match mutation.op {
            OpKind::Create => {
                let row = pair
                    .primary
                    .create(payload.data.clone())
                    .await
                    .map_err(primary_err)?;
                if let Some(key) = row.get(&pair.key_field) {
                    payload.data.insert(pair.key_field.clone(), key.clone());
                }
                Some(row)
            }
            OpKind::Update => {
                pair.primary
                    .update(payload.data.clone(), payload.filter.clone())
                    .await
                    .map_err(primary_err)?;
                pair.primary
                    .find_one(payload.filter.clone())
                    .await
                    .map_err(primary_err)?
            }
            OpKind::Delete => {
                let snapshot = pair
                    .primary
                    .find_one(payload.filter.clone())
                    .await
                    .map_err(primary_err)?;
                pair.primary
                    .delete(payload.filter.clone())
                    .await
                    .map_err(primary_err)?;
                snapshot
            }
        };

        metrics::record_primary_write(&mutation.entity, mutation.op.as_str(), true);
        Ok((result, payload))
    }

    /// One bounded, circuit-guarded secondary attempt.
    async fn mirror_inline(
        &self,
        mutation: &Mutation,
        pair: &StorePair,
        payload: &Payload,
    ) -> std::result::Result<(), Fallback> {
        let start = Instant::now();
        let attempt = self
            .circuit
            .call(|| async {
                let apply = apply_to(pair.secondary.as_ref(), &pair.key_field, mutation.op, payload);
                match timeout(self.secondary_timeout, apply).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(source)) => Err(MirrorError::Secondary {
                        entity: mutation.entity.clone(),
                        op: mutation.op,
                        source,
                    }),
                    Err(_) => Err(MirrorError::timeout(
                        format!("secondary {} {}", mutation.op, mutation.entity),
                        self.secondary_timeout,
                    )),
                }
            })
            .await;
        metrics::record_inline_latency(&mutation.entity, start.elapsed());

        match attempt {
            Ok(()) => Ok(()),
            Err(CircuitError::Rejected) => Err(Fallback::Rejected),
            Err(CircuitError::Inner(e)) => {
                warn!(error = %e, "Inline secondary write failed, enqueueing");
                if matches!(
                    e,
                    MirrorError::Secondary {
                        source: StoreError::Unavailable(_),
                        ..
                    } | MirrorError::Timeout { .. }
                ) {
                    self.prober.mark_down().await;
                }
                Err(Fallback::Failed)
            }
        }
    }
}
