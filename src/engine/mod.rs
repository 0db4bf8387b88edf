// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mirror engine.
//!
//! The orchestrator that ties together:
//! - The outbox via [`crate::outbox::Outbox`]
//! - Inline mirroring via [`crate::write_coordinator::WriteCoordinator`]
//! - Background draining via [`crate::worker::SyncWorker`]
//! - Secondary liveness via [`crate::prober::LivenessProber`]
//!
//! # Lifecycle
//!
//! 1. [`open()`](MirrorEngine::open) validates config and opens the outbox
//! 2. [`start()`](MirrorEngine::start) audits pending rows against the
//!    registry and spawns the worker loop
//! 3. [`perform()`](MirrorEngine::perform) serves business writes
//! 4. [`shutdown()`](MirrorEngine::shutdown) stops the worker (the current
//!    tick finishes) and closes the outbox

mod types;

pub use types::{EngineState, HealthCheck};

use crate::config::MirrorConfig;
use crate::error::{MirrorError, Result};
use crate::metrics;
use crate::operation::Mutation;
use crate::outbox::Outbox;
use crate::prober::{Liveness, LivenessProber};
use crate::registry::EntityRegistry;
use crate::store::{EntityStore, Row};
use crate::worker::{SyncWorker, TickReport, WorkerStats};
use crate::write_coordinator::WriteCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// How long shutdown waits for an in-progress tick.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The main mirror engine.
///
/// Shareable behind an `Arc`: every method takes `&self`.
pub struct MirrorEngine {
    config: MirrorConfig,

    registry: Arc<EntityRegistry>,

    outbox: Arc<Outbox>,

    prober: Arc<LivenessProber>,

    coordinator: WriteCoordinator,

    worker: Arc<SyncWorker>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    state_rx: watch::Receiver<EngineState>,

    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,

    /// Worker task handle
    worker_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,

    /// Serializes start/shutdown transitions
    lifecycle: Mutex<()>,
}

impl MirrorEngine {
    /// Open the engine in `Created` state.
    ///
    /// `probe_target` is the store the liveness prober pings, normally the
    /// secondary database shared by every registered pair.
    pub async fn open(
        config: MirrorConfig,
        registry: Arc<EntityRegistry>,
        probe_target: Arc<dyn EntityStore>,
    ) -> Result<Self> {
        config.validate()?;

        let outbox = Arc::new(Outbox::open(&config.outbox).await?);
        let prober = Arc::new(LivenessProber::new(probe_target, &config.prober));
        let coordinator = WriteCoordinator::new(Arc::clone(&prober), &config.coordinator);
        let worker = Arc::new(SyncWorker::new(
            Arc::clone(&registry),
            Arc::clone(&outbox),
            Arc::clone(&prober),
            config.worker.clone(),
        ));

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        metrics::set_engine_state("Created");

        info!(
            outbox = %outbox.path(),
            entities = registry.len(),
            "Mirror engine opened"
        );

        Ok(Self {
            config,
            registry,
            outbox,
            prober,
            coordinator,
            worker,
            state_tx,
            state_rx,
            shutdown_tx,
            worker_handle: Mutex::new(None),
            lifecycle: Mutex::new(()),
        })
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn prober(&self) -> &Arc<LivenessProber> {
        &self.prober
    }

    pub fn coordinator(&self) -> &WriteCoordinator {
        &self.coordinator
    }

    pub fn worker(&self) -> &Arc<SyncWorker> {
        &self.worker
    }

    pub fn worker_stats(&self) -> WorkerStats {
        self.worker.stats()
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Start draining.
    ///
    /// Pending rows whose model is not registered are reported here and
    /// dead-lettered by the worker on its first tick.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() != EngineState::Created {
            return Err(MirrorError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        let unknown = match self.registry.audit_outbox(&self.outbox).await {
            Ok(unknown) => unknown,
            Err(e) => {
                error!(error = %e, "Failed to audit outbox against registry");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };
        for model in &unknown {
            error!(model = %model, "Pending outbox rows name an unregistered entity");
        }

        if self.config.worker.enabled {
            let worker = Arc::clone(&self.worker);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let handle = tokio::spawn(worker.run(shutdown_rx));
            *self.worker_handle.lock().await = Some(handle);
            info!(worker = %self.worker.worker_id(), "Spawned sync worker");
        } else {
            warn!("Sync worker disabled, outbox will only drain via drain_now()");
        }

        self.set_state(EngineState::Running);
        info!(
            entities = self.registry.len(),
            unregistered_pending = unknown.len(),
            "Mirror engine running"
        );
        Ok(())
    }

    /// Perform a replicated mutation.
    ///
    /// Returns the primary result. Errors only if the primary write fails,
    /// the mutation is invalid or unregistered, or the intent could not be
    /// recorded after the primary committed.
    pub async fn perform(&self, mutation: &Mutation) -> Result<Option<Row>> {
        let state = self.state();
        if !state.accepts_writes() {
            return Err(match state {
                EngineState::Failed => MirrorError::InvalidState {
                    expected: "Created or Running".to_string(),
                    actual: state.to_string(),
                },
                _ => MirrorError::Shutdown,
            });
        }

        let pair = self
            .registry
            .resolve(&mutation.entity)
            .ok_or_else(|| MirrorError::UnknownEntity(mutation.entity.clone()))?;
        self.coordinator.perform(mutation, &pair, &self.outbox).await
    }

    /// Run one drain tick now, outside the worker schedule.
    pub async fn drain_now(&self) -> Result<TickReport> {
        match self.state() {
            EngineState::ShuttingDown | EngineState::Stopped => Err(MirrorError::Shutdown),
            _ => self.worker.run_tick().await,
        }
    }

    /// Get health status for monitoring endpoints.
    ///
    /// Performs no secondary I/O; backlog comes from the local outbox.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let secondary = self.prober.last_state();

        let backlog = if state == EngineState::Stopped {
            None
        } else {
            match self.outbox.backlog_stats().await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!(error = %e, "Failed to read outbox backlog for health check");
                    None
                }
            }
        };

        let now = chrono::Utc::now().timestamp_millis();
        let oldest_pending_ms = backlog
            .as_ref()
            .and_then(|b| b.oldest_age(now))
            .map(|d| d.as_millis() as u64);
        let threshold = self.config.worker.backlog_alert_threshold;
        let backlog_over_threshold = backlog
            .as_ref()
            .is_some_and(|b| threshold > 0 && b.pending > threshold);

        let ready = state == EngineState::Running;
        let healthy = ready
            && secondary == Liveness::Up
            && !backlog_over_threshold
            && backlog.as_ref().is_some_and(|b| b.dead == 0);

        HealthCheck {
            state,
            ready,
            secondary,
            millis_since_secondary_success: self.prober.millis_since_success(),
            circuit_rejections: self.coordinator.circuit().rejections(),
            backlog,
            oldest_pending_ms,
            backlog_over_threshold,
            worker: self.worker.stats(),
            healthy,
        }
    }

    /// Shutdown the engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal the worker to stop
    /// 2. Wait for the current tick to finish (bounded)
    /// 3. Checkpoint and close the outbox
    ///
    /// Calling it again after `Stopped` is a no-op.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == EngineState::Stopped {
            debug!("Mirror engine already stopped");
            return;
        }

        info!("Shutting down mirror engine");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        if let Some(mut handle) = self.worker_handle.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!("Sync worker completed gracefully"),
                Ok(Err(e)) => warn!(error = %e, "Sync worker panicked during shutdown"),
                Err(_) => {
                    warn!(
                        timeout_ms = SHUTDOWN_DRAIN_TIMEOUT.as_millis() as u64,
                        "Sync worker did not stop in time, aborting (leased rows retry after lease expiry)"
                    );
                    handle.abort();
                }
            }
        }

        self.outbox.close().await;

        self.set_state(EngineState::Stopped);
        info!("Mirror engine stopped");
    }
}
