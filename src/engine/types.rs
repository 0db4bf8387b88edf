//! Engine state types.
//!
//! Defines the state machine for the mirror engine lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Running
//!    │                            │
//!    │ (audit failed)             │ shutdown()
//!    ↓                            ↓
//! Failed                     ShuttingDown
//!                                 │
//!                                 │ (tick finished, outbox closed)
//!                                 ↓
//!                              Stopped
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Outbox open, worker not spawned. `perform()` already works;
//!   unmirrored writes wait in the outbox.
//! - **Running**: Worker draining on its interval.
//! - **ShuttingDown**: `shutdown()` called. The current tick is finishing.
//! - **Stopped**: Outbox closed. Safe to drop.
//! - **Failed**: Startup error. Check logs.

use crate::outbox::BacklogStats;
use crate::prober::Liveness;
use crate::worker::WorkerStats;

/// State of the mirror engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine opened but the worker is not running.
    ///
    /// Call [`start()`](super::MirrorEngine::start) to begin draining.
    Created,

    /// Worker draining the outbox.
    Running,

    /// Shutting down gracefully.
    ShuttingDown,

    /// Stopped. The outbox is closed.
    Stopped,

    /// Failed to start.
    Failed,
}

impl EngineState {
    /// Whether business writes are still accepted.
    pub fn accepts_writes(&self) -> bool {
        matches!(self, EngineState::Created | EngineState::Running)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Health snapshot for monitoring endpoints.
///
/// Built from cached state plus one local SQLite count; the secondary is
/// not probed.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,

    /// Engine is running.
    pub ready: bool,

    /// Last probe result for the secondary.
    pub secondary: Liveness,

    /// Milliseconds since the secondary last answered (`u64::MAX` if never).
    pub millis_since_secondary_success: u64,

    /// Inline mirror calls shed by the open circuit.
    pub circuit_rejections: u64,

    /// Outbox depth. `None` if the outbox could not be read.
    pub backlog: Option<BacklogStats>,

    /// Age of the oldest pending row.
    pub oldest_pending_ms: Option<u64>,

    /// Pending rows above the configured alert threshold.
    pub backlog_over_threshold: bool,

    pub worker: WorkerStats,

    /// Ready, secondary up, no dead letters and backlog under threshold.
    pub healthy: bool,
}
