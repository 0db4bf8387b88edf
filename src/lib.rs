//! # Outbox Mirror
//!
//! A dual-store replication engine: every business write lands in the
//! primary store first and is mirrored to a secondary store, either inline
//! or, when the secondary is unreachable, later from a durable outbox.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              outbox-mirror                                │
//! │                                                                           │
//! │  ┌──────────────────┐  primary ok   ┌──────────────────┐                  │
//! │  │ WriteCoordinator │──────────────►│ LivenessProber   │                  │
//! │  │ (caller's task)  │               │ (ping + timeout) │                  │
//! │  └──────────────────┘               └──────────────────┘                  │
//! │       │ up: inline apply                  │ down / failed                 │
//! │       ▼                                   ▼                               │
//! │  ┌──────────────────┐               ┌──────────────────┐                  │
//! │  │ Secondary store  │◄──────────────│ Outbox (SQLite)  │                  │
//! │  └──────────────────┘  SyncWorker   └──────────────────┘                  │
//! │                        (interval)         │ unknown / exhausted           │
//! │                                           ▼                               │
//! │                                     Dead letters                          │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Primary first**: a primary failure is returned unchanged and nothing
//!    is mirrored or enqueued.
//! 2. **No silent loss**: after a primary commit the mutation is either on
//!    the secondary or in the outbox (or the caller gets `EnqueueFailed`).
//! 3. **At-least-once**: outbox rows are deleted only after the secondary
//!    confirms; replays are idempotent for keyed creates.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use outbox_mirror::{EntityRegistry, InMemoryStore, MirrorConfig, MirrorEngine, Mutation};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> outbox_mirror::Result<()> {
//!     let primary = Arc::new(InMemoryStore::new("primary"));
//!     let secondary = Arc::new(InMemoryStore::new("secondary"));
//!     let registry = EntityRegistry::builder()
//!         .register_dynamic("Wallet", "id", primary, secondary.clone())
//!         .build()?;
//!
//!     let engine = MirrorEngine::open(MirrorConfig::default(), Arc::new(registry), secondary).await?;
//!     engine.start().await?;
//!
//!     let data = serde_json::json!({"balanceCents": 0});
//!     engine.perform(&Mutation::create("Wallet", data.as_object().cloned().unwrap_or_default())).await?;
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod operation;
pub mod outbox;
pub mod prober;
pub mod registry;
pub mod resilience;
pub mod store;
pub mod worker;
pub mod write_coordinator;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use config::{CoordinatorConfig, MirrorConfig, OutboxConfig, ProberConfig, WorkerConfig};
pub use engine::{EngineState, HealthCheck, MirrorEngine};
pub use error::{MirrorError, Result};
pub use operation::{Mutation, OpKind, Payload};
pub use outbox::{BacklogStats, DeadLetter, DeadLetterReason, OperationRecord, Outbox};
pub use prober::{Liveness, LivenessProber};
pub use registry::{EntityKind, EntityRegistry, RegistryBuilder, StorePair};
pub use store::{EntityStore, Fields, InMemoryStore, Row, StoreError};
pub use worker::{SyncWorker, TickOutcome, TickReport, WorkerStats};
pub use write_coordinator::WriteCoordinator;
