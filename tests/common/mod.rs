#![allow(dead_code)] // not every test binary uses every helper

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A store wrapper with switchable failure modes
//! - Engine / registry fixtures
//! - Field helpers

pub mod mock_store;

pub use mock_store::*;

use outbox_mirror::{EntityRegistry, Fields, MirrorConfig, MirrorEngine, RegistryBuilder};
use std::sync::Arc;

/// Build a field map from a JSON object literal.
pub fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().unwrap_or_default()
}

/// Primary, secondary and engine for one entity set.
pub struct TestMirror {
    pub primary: Arc<FlakyStore>,
    pub secondary: Arc<FlakyStore>,
    pub engine: MirrorEngine,
}

/// Registry with a single `Wallet` entity keyed on `id`.
pub fn registry(primary: &Arc<FlakyStore>, secondary: &Arc<FlakyStore>) -> EntityRegistry {
    RegistryBuilder::new()
        .register_dynamic("Wallet", "id", primary.clone(), secondary.clone())
        .build()
        .expect("registry")
}

/// Config with the background worker off; tests drive ticks with `drain_now()`.
pub fn manual_config() -> MirrorConfig {
    let mut config = MirrorConfig::for_testing();
    config.worker.enabled = false;
    config
}

/// Open and start an engine over fresh in-memory stores.
pub async fn test_mirror(config: MirrorConfig) -> TestMirror {
    let primary = Arc::new(FlakyStore::new("primary"));
    let secondary = Arc::new(FlakyStore::new("secondary"));
    let registry = Arc::new(registry(&primary, &secondary));
    let engine = MirrorEngine::open(config, registry, secondary.clone())
        .await
        .expect("open engine");
    engine.start().await.expect("start engine");
    TestMirror {
        primary,
        secondary,
        engine,
    }
}
