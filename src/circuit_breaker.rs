//! Circuit breaker for inline secondary writes.
//!
//! The liveness probe answers "is the secondary reachable right now"; the
//! circuit answers "has it been failing lately". When enough recent inline
//! writes fail, the coordinator stops trying the secondary inline and
//! enqueues straight away, so a struggling mirror does not add latency to
//! every business write.
//!
//! The drain worker does not go through the circuit: its own backoff and
//! per-model blocking already pace retries.
//!
//! # States
//!
//! - **Closed**: inline writes pass through
//! - **Open**: recent failure rate over `error_rate`, inline writes are shed
//! - **HalfOpen**: after `open_wait`, `half_open_calls` trial writes decide
//!
//! # Usage
//!
//! ```rust,no_run
//! # use outbox_mirror::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
//! # use outbox_mirror::StoreError;
//! # async fn example() {
//! let circuit = CircuitBreaker::new("secondary_writes", CircuitConfig::default());
//!
//! match circuit.call(|| async { Ok::<(), StoreError>(()) }).await {
//!     Ok(()) => { /* mirrored inline */ }
//!     Err(CircuitError::Rejected) => { /* shed: enqueue without trying */ }
//!     Err(CircuitError::Inner(_)) => { /* secondary failed: enqueue */ }
//! }
//! # }
//! ```

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a guarded call that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Shed without running: the circuit is open.
    #[error("circuit open, call shed")]
    Rejected,

    /// The guarded call ran and failed.
    #[error("guarded call failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }
}

/// Trip and recovery settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Failure fraction over the closed window that opens the circuit.
    pub error_rate: f32,
    /// Recent calls considered while closed.
    pub window: u32,
    /// Trial calls let through when half-open.
    pub half_open_calls: u32,
    pub open_wait: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.5,
            window: 10,
            half_open_calls: 2,
            open_wait: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Small window, short open period.
    pub fn testing() -> Self {
        Self {
            error_rate: 0.5,
            window: 2,
            half_open_calls: 1,
            open_wait: Duration::from_millis(50),
        }
    }
}

/// Named circuit with call accounting.
pub struct CircuitBreaker {
    name: String,
    recloser: AsyncRecloser,
    /// Whether the most recent call was shed
    shedding: AtomicBool,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.error_rate.clamp(0.0, 1.0))
            .closed_len(config.window.max(1) as usize)
            .half_open_len(config.half_open_calls.max(1) as usize)
            .open_wait(config.open_wait)
            .build();

        Self {
            name: name.into(),
            recloser: recloser.into(),
            shedding: AtomicBool::new(false),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` through the circuit.
    ///
    /// The future `f` builds is only polled when the circuit lets the call
    /// through.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let outcome = self.recloser.call(f()).await;
        let shed = matches!(outcome, Err(RecloserError::Rejected));
        let was_shedding = self.shedding.swap(shed, Ordering::Relaxed);

        match outcome {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                if was_shedding {
                    info!(circuit = %self.name, "Circuit let a call through again");
                }
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "rejected");
                if !was_shedding {
                    warn!(circuit = %self.name, "Circuit open, shedding inline secondary writes");
                }
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, "Guarded call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Whether the most recent call was shed.
    pub fn is_shedding(&self) -> bool {
        self.shedding.load(Ordering::Relaxed)
    }

    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Failed share of calls that actually ran (shed calls excluded).
    pub fn failure_rate(&self) -> f64 {
        let ran = self.successes() + self.failures();
        if ran == 0 {
            return 0.0;
        }
        self.failures() as f64 / ran as f64
    }
}
