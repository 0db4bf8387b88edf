// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for the Mirror Engine
//!
//! End-to-end through `MirrorEngine`: in-memory stores on both sides and a
//! real SQLite outbox (in-memory unless a test needs restart persistence).
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//! - `scenario_*` - reference walkthroughs (down/up, inline, unknown entity)
//! - `write_*` - coordinator guarantees
//! - `drain_*` - worker guarantees
//! - `engine_*` - lifecycle and persistence

mod common;

use common::{fields, manual_config, registry, test_mirror, FlakyStore, Mode};
use outbox_mirror::{
    DeadLetterReason, EngineState, EntityStore, MirrorEngine, MirrorError, Mutation, OpKind, OutboxConfig,
    Payload, TickOutcome,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

// =============================================================================
// Reference Scenarios
// =============================================================================

#[tokio::test]
async fn scenario_create_while_secondary_down_then_drain() {
    let m = test_mirror(manual_config()).await;
    m.secondary.set_mode(Mode::Offline);

    let row = m
        .engine
        .perform(&Mutation::create(
            "Wallet",
            fields(json!({"studentId": 5, "balanceCents": 0})),
        ))
        .await
        .unwrap()
        .expect("created row");
    assert_eq!(row["studentId"], json!(5));
    assert_eq!(m.primary.rows().await.len(), 1);

    let pending = m.engine.outbox().list_oldest(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].model_name, "Wallet");
    assert_eq!(pending[0].op, "create");
    assert_eq!(pending[0].attempts, 0);

    m.secondary.set_mode(Mode::Healthy);
    let report = m.engine.drain_now().await.unwrap();

    assert_eq!(report.applied, 1);
    let mirrored = m.secondary.get(row["id"].clone()).await.expect("mirrored row");
    assert_eq!(mirrored, row);
    assert!(m.engine.outbox().list_oldest(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn scenario_update_mirrored_inline() {
    let m = test_mirror(manual_config()).await;
    let seed = fields(json!({"id": 5, "balanceCents": 0}));
    m.primary.inner().create(seed.clone()).await.unwrap();
    m.secondary.inner().create(seed).await.unwrap();

    let row = m
        .engine
        .perform(&Mutation::update(
            "Wallet",
            fields(json!({"balanceCents": 500})),
            fields(json!({"id": 5})),
        ))
        .await
        .unwrap()
        .expect("updated row");

    assert_eq!(row["balanceCents"], json!(500));
    assert_eq!(m.primary.get(5).await.unwrap()["balanceCents"], json!(500));
    assert_eq!(m.secondary.get(5).await.unwrap()["balanceCents"], json!(500));
    assert!(m.engine.outbox().list_oldest(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn scenario_unknown_entity_is_dead_lettered_not_applied() {
    let m = test_mirror(manual_config()).await;
    let payload = Payload {
        data: fields(json!({"id": 1})),
        filter: fields(json!({})),
    };
    m.engine
        .outbox()
        .append(&outbox_mirror::operation::NewOperation::new("Ghost", OpKind::Create, payload))
        .await
        .unwrap();

    let report = m.engine.drain_now().await.unwrap();

    assert_eq!(report.unresolved, 1);
    assert_eq!(report.applied, 0);
    assert!(m.engine.outbox().list_oldest(10).await.unwrap().is_empty());

    let dead = m.engine.outbox().dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].model_name, "Ghost");
    assert_eq!(dead[0].reason(), Some(DeadLetterReason::UnknownEntity));

    let stats = m.engine.worker_stats();
    assert_eq!(stats.unresolved, 1);
    assert_eq!(stats.applied, 0);
    assert!(m.secondary.calls().is_empty());
}

// =============================================================================
// Write Path
// =============================================================================

#[tokio::test]
async fn write_secondary_rejection_still_returns_primary_result() {
    let m = test_mirror(manual_config()).await;
    m.secondary.set_mode(Mode::RejectWrites);

    let result = m
        .engine
        .perform(&Mutation::create("Wallet", fields(json!({"balanceCents": 1}))))
        .await;

    let row = result.unwrap().expect("primary row");
    assert_eq!(row["balanceCents"], json!(1));
    let pending = m.engine.outbox().list_oldest(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 0);
}

#[tokio::test]
async fn write_primary_failure_propagates_and_enqueues_nothing() {
    let m = test_mirror(manual_config()).await;
    m.primary.set_mode(Mode::Offline);

    let result = m
        .engine
        .perform(&Mutation::create("Wallet", fields(json!({"balanceCents": 1}))))
        .await;

    match result {
        Err(MirrorError::Primary { entity, op, .. }) => {
            assert_eq!(entity, "Wallet");
            assert_eq!(op, OpKind::Create);
        }
        other => panic!("Expected Primary error, got {:?}", other),
    }
    assert!(m.secondary.calls().is_empty());
    assert!(m.engine.outbox().list_oldest(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn write_inline_success_enqueues_nothing() {
    let m = test_mirror(manual_config()).await;

    for cents in [10, 20, 30] {
        m.engine
            .perform(&Mutation::create("Wallet", fields(json!({"balanceCents": cents}))))
            .await
            .unwrap();
    }

    assert_eq!(m.secondary.rows().await.len(), 3);
    assert!(m.engine.outbox().list_oldest(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn write_fallback_payload_matches_mutation() {
    let m = test_mirror(manual_config()).await;
    m.primary
        .inner()
        .create(fields(json!({"id": 3, "balanceCents": 0})))
        .await
        .unwrap();
    m.secondary.set_mode(Mode::Offline);

    let data = fields(json!({"balanceCents": 7}));
    let filter = fields(json!({"id": 3}));
    m.engine
        .perform(&Mutation::update("Wallet", data.clone(), filter.clone()))
        .await
        .unwrap();

    let pending = m.engine.outbox().list_oldest(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    let (op, payload) = pending[0].operation().unwrap();
    assert_eq!(op, OpKind::Update);
    assert_eq!(payload.data, data);
    assert_eq!(payload.filter, filter);
}

#[tokio::test]
async fn write_delete_returns_snapshot_and_mirrors() {
    let m = test_mirror(manual_config()).await;
    let seed = fields(json!({"id": 8, "balanceCents": 42}));
    m.primary.inner().create(seed.clone()).await.unwrap();
    m.secondary.inner().create(seed.clone()).await.unwrap();

    let snapshot = m
        .engine
        .perform(&Mutation::delete("Wallet", fields(json!({"id": 8}))))
        .await
        .unwrap();

    assert_eq!(snapshot, Some(seed));
    assert!(m.primary.get(8).await.is_none());
    assert!(m.secondary.get(8).await.is_none());
}

#[tokio::test]
async fn write_invalid_mutation_touches_nothing() {
    let m = test_mirror(manual_config()).await;

    let result = m
        .engine
        .perform(&Mutation::delete("Wallet", fields(json!({}))))
        .await;

    assert!(matches!(result, Err(MirrorError::InvalidMutation(_))));
    assert!(m.primary.calls().is_empty());
    assert!(m.engine.outbox().list_oldest(10).await.unwrap().is_empty());
}

// =============================================================================
// Drain Path
// =============================================================================

#[tokio::test]
async fn drain_failed_row_increments_attempts_only() {
    let m = test_mirror(manual_config()).await;
    m.secondary.set_mode(Mode::Offline);
    for cents in [1, 2] {
        m.engine
            .perform(&Mutation::create("Wallet", fields(json!({"balanceCents": cents}))))
            .await
            .unwrap();
    }

    m.secondary.set_mode(Mode::Healthy);
    m.secondary.reject_next(1);
    let report = m.engine.drain_now().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.applied, 0);
    assert_eq!(report.deferred, 1);

    let pending = m.engine.outbox().list_oldest(10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_error.is_some());
    assert_eq!(pending[1].attempts, 0);
}

#[tokio::test]
async fn drain_replayed_create_does_not_duplicate() {
    let m = test_mirror(manual_config()).await;
    m.secondary.set_mode(Mode::Offline);
    let row = m
        .engine
        .perform(&Mutation::create("Wallet", fields(json!({"balanceCents": 9}))))
        .await
        .unwrap()
        .unwrap();

    // The row reached the secondary by another route before the drain
    m.secondary.set_mode(Mode::Healthy);
    m.secondary.inner().create(row.clone()).await.unwrap();

    let report = m.engine.drain_now().await.unwrap();

    assert_eq!(report.applied, 1);
    assert!(m.engine.outbox().list_oldest(10).await.unwrap().is_empty());
    assert_eq!(m.secondary.rows().await.len(), 1);
}

#[tokio::test]
async fn drain_applies_same_entity_in_enqueue_order() {
    let m = test_mirror(manual_config()).await;
    m.secondary.set_mode(Mode::Offline);

    let row = m
        .engine
        .perform(&Mutation::create("Wallet", fields(json!({"balanceCents": 0}))))
        .await
        .unwrap()
        .unwrap();
    let filter = fields(json!({"id": row["id"].clone()}));
    for cents in [10, 20] {
        m.engine
            .perform(&Mutation::update(
                "Wallet",
                fields(json!({"balanceCents": cents})),
                filter.clone(),
            ))
            .await
            .unwrap();
    }

    m.secondary.set_mode(Mode::Healthy);
    let report = m.engine.drain_now().await.unwrap();
    assert_eq!(report.applied, 3);

    let ops: Vec<OpKind> = m.secondary.calls().iter().map(|c| c.op).collect();
    assert_eq!(ops, vec![OpKind::Create, OpKind::Update, OpKind::Update]);
    let cents: Vec<_> = m.secondary.calls()[1..]
        .iter()
        .map(|c| c.data["balanceCents"].clone())
        .collect();
    assert_eq!(cents, vec![json!(10), json!(20)]);
    assert_eq!(m.secondary.get(row["id"].clone()).await.unwrap()["balanceCents"], json!(20));
}

#[tokio::test]
async fn drain_respects_backoff_window() {
    let mut config = manual_config();
    config.worker.backoff_base_ms = 60_000;
    config.worker.backoff_max_sec = 3600;
    let m = test_mirror(config).await;
    m.secondary.set_mode(Mode::RejectWrites);
    m.engine
        .perform(&Mutation::create("Wallet", fields(json!({"balanceCents": 1}))))
        .await
        .unwrap();

    let report = m.engine.drain_now().await.unwrap();
    assert_eq!(report.failed, 1);

    m.secondary.set_mode(Mode::Healthy);
    let report = m.engine.drain_now().await.unwrap();
    assert_eq!(report.claimed, 0);

    let pending = m.engine.outbox().list_oldest(10).await.unwrap();
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].next_attempt_at > chrono::Utc::now().timestamp_millis());
}

#[tokio::test]
async fn drain_dead_letters_after_max_attempts_and_requeues() {
    let mut config = manual_config();
    config.worker.max_attempts = 2;
    config.worker.backoff_base_ms = 0;
    let m = test_mirror(config).await;
    m.secondary.set_mode(Mode::RejectWrites);
    let row = m
        .engine
        .perform(&Mutation::create("Wallet", fields(json!({"balanceCents": 1}))))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(m.engine.drain_now().await.unwrap().failed, 1);
    assert_eq!(m.engine.drain_now().await.unwrap().dead_lettered, 1);

    assert!(m.engine.outbox().list_oldest(10).await.unwrap().is_empty());
    let dead = m.engine.outbox().dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason(), Some(DeadLetterReason::AttemptsExhausted));
    assert_eq!(dead[0].attempts, 2);
    assert!(!m.engine.health_check().await.healthy);

    // Operator fixes the secondary and requeues
    m.secondary.set_mode(Mode::Healthy);
    assert!(m
        .engine
        .outbox()
        .requeue_dead_letter(&dead[0].operation_id)
        .await
        .unwrap());
    let report = m.engine.drain_now().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(m.secondary.get(row["id"].clone()).await.unwrap(), row);
    assert!(m.engine.outbox().dead_letters(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn drain_skips_tick_while_secondary_down() {
    let m = test_mirror(manual_config()).await;
    m.secondary.set_mode(Mode::Offline);
    m.engine
        .perform(&Mutation::create("Wallet", fields(json!({"balanceCents": 1}))))
        .await
        .unwrap();

    let report = m.engine.drain_now().await.unwrap();

    assert_eq!(report.outcome, TickOutcome::SkippedSecondaryDown);
    let pending = m.engine.outbox().list_oldest(10).await.unwrap();
    assert_eq!(pending[0].attempts, 0);
}

// =============================================================================
// Engine Lifecycle
// =============================================================================

#[tokio::test]
async fn engine_background_worker_drains_after_recovery() {
    let m = test_mirror(outbox_mirror::MirrorConfig::for_testing()).await;
    m.secondary.set_mode(Mode::Offline);
    let row = m
        .engine
        .perform(&Mutation::create("Wallet", fields(json!({"balanceCents": 3}))))
        .await
        .unwrap()
        .unwrap();

    m.secondary.set_mode(Mode::Healthy);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !m.engine.outbox().list_oldest(1).await.unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "outbox never drained");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(m.secondary.get(row["id"].clone()).await.unwrap(), row);
    m.engine.shutdown().await;
    assert_eq!(m.engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn engine_outbox_survives_restart() {
    let dir = tempdir().unwrap();
    let mut config = manual_config();
    config.outbox = OutboxConfig {
        sqlite_path: dir.path().join("outbox.db").to_string_lossy().into_owned(),
        ..OutboxConfig::default()
    };

    let primary = Arc::new(FlakyStore::new("primary"));
    let secondary = Arc::new(FlakyStore::new("secondary"));
    secondary.set_mode(Mode::Offline);

    {
        let engine = MirrorEngine::open(
            config.clone(),
            Arc::new(registry(&primary, &secondary)),
            secondary.clone(),
        )
        .await
        .unwrap();
        engine.start().await.unwrap();
        engine
            .perform(&Mutation::create("Wallet", fields(json!({"balanceCents": 11}))))
            .await
            .unwrap();
        engine.shutdown().await;
    }

    secondary.set_mode(Mode::Healthy);
    let engine = MirrorEngine::open(config, Arc::new(registry(&primary, &secondary)), secondary.clone())
        .await
        .unwrap();
    engine.start().await.unwrap();
    assert_eq!(engine.outbox().list_oldest(10).await.unwrap().len(), 1);

    let report = engine.drain_now().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(secondary.rows().await.len(), 1);
    engine.shutdown().await;
}
