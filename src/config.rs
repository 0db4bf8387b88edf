//! Configuration for the mirror engine.
//!
//! Configuration is passed to [`MirrorEngine::open()`](crate::MirrorEngine::open)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//! Durations are humantime strings (`"500ms"`, `"5s"`, `"2m"`).
//!
//! # Quick Start
//!
//! ```rust
//! use outbox_mirror::config::{MirrorConfig, OutboxConfig};
//!
//! let config = MirrorConfig {
//!     outbox: OutboxConfig {
//!         sqlite_path: "/var/lib/app/outbox.db".into(),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! MirrorConfig
//! ├── coordinator: CoordinatorConfig  # inline secondary timeout, circuit
//! ├── worker: WorkerConfig            # drain period, batch, backoff, dead-letter
//! ├── prober: ProberConfig            # probe timeout, cache TTL
//! └── outbox: OutboxConfig            # SQLite persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! coordinator:
//!   secondary_timeout: "2s"
//! worker:
//!   interval: "5s"
//!   batch_size: 100
//!   max_attempts: 10
//! prober:
//!   timeout: "1s"
//!   cache_ttl: "0s"
//! outbox:
//!   sqlite_path: "/var/lib/app/outbox.db"
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::error::{MirrorError, Result};
use crate::resilience::{BackoffPolicy, RateLimitConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_or(raw: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(raw).unwrap_or(fallback)
}

fn check_duration(field: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw)
        .map_err(|e| MirrorError::Config(format!("{field}: invalid duration `{raw}`: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `MirrorEngine::open()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub prober: ProberConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
}

impl MirrorConfig {
    /// Create a config for tests: in-memory outbox, short timeouts, fast backoff.
    pub fn for_testing() -> Self {
        Self {
            coordinator: CoordinatorConfig {
                secondary_timeout: "200ms".to_string(),
                ..Default::default()
            },
            worker: WorkerConfig {
                interval: "50ms".to_string(),
                batch_size: 100,
                max_attempts: 5,
                backoff_base_ms: 10,
                backoff_max_sec: 1,
                lease: "5s".to_string(),
                apply_timeout: "200ms".to_string(),
                ..Default::default()
            },
            prober: ProberConfig {
                timeout: "100ms".to_string(),
                cache_ttl: "0s".to_string(),
            },
            outbox: OutboxConfig::in_memory(),
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        check_duration("coordinator.secondary_timeout", &self.coordinator.secondary_timeout)?;
        check_duration("coordinator.circuit_open_wait", &self.coordinator.circuit_open_wait)?;
        if !(0.0..=1.0).contains(&self.coordinator.circuit_error_rate) {
            return Err(MirrorError::Config(
                "coordinator.circuit_error_rate must be within 0.0..=1.0".into(),
            ));
        }

        let interval = check_duration("worker.interval", &self.worker.interval)?;
        let lease = check_duration("worker.lease", &self.worker.lease)?;
        let apply_timeout = check_duration("worker.apply_timeout", &self.worker.apply_timeout)?;
        // The worker renews a row's lease right before applying it
        if lease <= apply_timeout {
            return Err(MirrorError::Config(format!(
                "worker.lease ({}) must exceed worker.apply_timeout ({})",
                self.worker.lease, self.worker.apply_timeout
            )));
        }
        if interval.is_zero() {
            return Err(MirrorError::Config("worker.interval must be > 0".into()));
        }
        if self.worker.batch_size == 0 {
            return Err(MirrorError::Config("worker.batch_size must be > 0".into()));
        }
        if self.worker.max_attempts == 0 {
            return Err(MirrorError::Config("worker.max_attempts must be > 0".into()));
        }
        if self.worker.rate_limit_enabled && self.worker.rate_limit_per_sec == 0 {
            return Err(MirrorError::Config("worker.rate_limit_per_sec must be > 0".into()));
        }

        check_duration("prober.timeout", &self.prober.timeout)?;
        let ttl = check_duration("prober.cache_ttl", &self.prober.cache_ttl)?;
        // A stale "up" must not outlive one drain period
        if ttl > interval {
            return Err(MirrorError::Config(format!(
                "prober.cache_ttl ({}) exceeds worker.interval ({})",
                self.prober.cache_ttl, self.worker.interval
            )));
        }

        if self.outbox.sqlite_path.trim().is_empty() {
            return Err(MirrorError::Config("outbox.sqlite_path must not be empty".into()));
        }
        if self.outbox.max_connections == 0 {
            return Err(MirrorError::Config("outbox.max_connections must be > 0".into()));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// CoordinatorConfig: inline write path
// ═══════════════════════════════════════════════════════════════════════════════

/// Write coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Deadline for the inline secondary attempt.
    #[serde(default = "default_secondary_timeout")]
    pub secondary_timeout: String,

    /// Failure fraction over the window that opens the inline circuit.
    #[serde(default = "default_circuit_error_rate")]
    pub circuit_error_rate: f32,

    /// Calls considered by the circuit while closed.
    #[serde(default = "default_circuit_window")]
    pub circuit_window: u32,

    /// How long the circuit stays open.
    #[serde(default = "default_circuit_open_wait")]
    pub circuit_open_wait: String,
}

fn default_secondary_timeout() -> String {
    "2s".to_string()
}

fn default_circuit_error_rate() -> f32 {
    0.5
}

fn default_circuit_window() -> u32 {
    10
}

fn default_circuit_open_wait() -> String {
    "30s".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            secondary_timeout: default_secondary_timeout(),
            circuit_error_rate: default_circuit_error_rate(),
            circuit_window: default_circuit_window(),
            circuit_open_wait: default_circuit_open_wait(),
        }
    }
}

impl CoordinatorConfig {
    pub fn secondary_timeout_duration(&self) -> Duration {
        parse_or(&self.secondary_timeout, Duration::from_secs(2))
    }

    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            error_rate: self.circuit_error_rate,
            window: self.circuit_window,
            half_open_calls: 2,
            open_wait: parse_or(&self.circuit_open_wait, Duration::from_secs(30)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WorkerConfig: background drain
// ═══════════════════════════════════════════════════════════════════════════════

/// Sync worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Whether the engine spawns the periodic drain loop.
    /// `drain_now()` works either way.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tick period.
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Maximum records claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Failed applies before a record is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff after the first failure (ms). Doubles per failure.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling (seconds).
    #[serde(default = "default_backoff_max_sec")]
    pub backoff_max_sec: u64,

    /// How long a claimed record stays leased to this worker.
    #[serde(default = "default_lease")]
    pub lease: String,

    /// Deadline for one secondary apply.
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout: String,

    /// Pending count above which each tick logs a backlog warning.
    #[serde(default = "default_backlog_alert_threshold")]
    pub backlog_alert_threshold: u64,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (recovered secondary protection)
    // ─────────────────────────────────────────────────────────────────────────

    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained applies per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst above the sustained rate.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_interval() -> String {
    "5s".to_string()
}

fn default_batch_size() -> u32 {
    100
}

fn default_max_attempts() -> u32 {
    10
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_sec() -> u64 {
    300 // 5 minutes
}

fn default_lease() -> String {
    "30s".to_string()
}

fn default_apply_timeout() -> String {
    "5s".to_string()
}

fn default_backlog_alert_threshold() -> u64 {
    10_000
}

fn default_rate_limit_per_sec() -> u32 {
    500
}

fn default_rate_limit_burst() -> u32 {
    100
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_interval(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_sec: default_backoff_max_sec(),
            lease: default_lease(),
            apply_timeout: default_apply_timeout(),
            backlog_alert_threshold: default_backlog_alert_threshold(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl WorkerConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_or(&self.interval, Duration::from_secs(5))
    }

    pub fn lease_duration(&self) -> Duration {
        parse_or(&self.lease, Duration::from_secs(30))
    }

    pub fn apply_timeout_duration(&self) -> Duration {
        parse_or(&self.apply_timeout, Duration::from_secs(5))
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_secs(self.backoff_max_sec),
        )
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ProberConfig: secondary liveness
// ═══════════════════════════════════════════════════════════════════════════════

/// Liveness prober configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProberConfig {
    /// Deadline for one probe. A probe that times out counts as "down".
    #[serde(default = "default_probe_timeout")]
    pub timeout: String,

    /// Reuse a probe answer for this long. `"0s"` probes on every call.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: String,
}

fn default_probe_timeout() -> String {
    "1s".to_string()
}

fn default_cache_ttl() -> String {
    "0s".to_string()
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            timeout: default_probe_timeout(),
            cache_ttl: default_cache_ttl(),
        }
    }
}

impl ProberConfig {
    pub fn timeout_duration(&self) -> Duration {
        parse_or(&self.timeout, Duration::from_secs(1))
    }

    pub fn cache_ttl_duration(&self) -> Duration {
        parse_or(&self.cache_ttl, Duration::ZERO)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OutboxConfig: SQLite persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Outbox persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Path to the SQLite database. `":memory:"` for a private in-memory outbox.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long SQLite waits on a lock before returning SQLITE_BUSY.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: String,
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout() -> String {
    "5s".to_string()
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "mirror_outbox.db".to_string(),
            wal_mode: true,
            max_connections: default_max_connections(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

impl OutboxConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            max_connections: 1,
            busy_timeout: default_busy_timeout(),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }

    pub fn busy_timeout(&self) -> Duration {
        parse_or(&self.busy_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MirrorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker.interval_duration(), Duration::from_secs(5));
        assert_eq!(config.coordinator.secondary_timeout_duration(), Duration::from_secs(2));
        assert_eq!(config.outbox.sqlite_path, "mirror_outbox.db");
    }

    #[test]
    fn test_for_testing_config() {
        let config = MirrorConfig::for_testing();
        assert!(config.validate().is_ok());
        assert!(config.outbox.is_in_memory());
        assert_eq!(config.worker.interval_duration(), Duration::from_millis(50));
    }

    #[test]
    fn test_duration_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let config = WorkerConfig {
                interval: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.interval_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_invalid_duration_falls_back_but_fails_validation() {
        let mut config = MirrorConfig::default();
        config.worker.interval = "soon".to_string();
        assert_eq!(config.worker.interval_duration(), Duration::from_secs(5));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("worker.interval"));
    }

    #[test]
    fn test_cache_ttl_longer_than_interval_rejected() {
        let mut config = MirrorConfig::default();
        config.prober.cache_ttl = "10s".to_string();
        config.worker.interval = "5s".to_string();
        assert!(matches!(config.validate(), Err(MirrorError::Config(_))));

        config.prober.cache_ttl = "5s".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lease_not_longer_than_apply_timeout_rejected() {
        let mut config = MirrorConfig::default();
        config.worker.lease = "100ms".to_string();
        config.worker.apply_timeout = "1s".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("worker.lease"));

        config.worker.lease = "1s".to_string();
        assert!(config.validate().is_err());

        config.worker.lease = "2s".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut config = MirrorConfig::default();
        config.worker.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = MirrorConfig::default();
        config.worker.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = MirrorConfig::default();
        config.worker.interval = "0s".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_policy_from_worker_config() {
        let config = WorkerConfig::default();
        let policy = config.backoff_policy();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.max, Duration::from_secs(300));
    }

    #[test]
    fn test_rate_limit_config() {
        let mut config = WorkerConfig::default();
        assert!(config.rate_limit_config().is_none());

        config.rate_limit_enabled = true;
        config.rate_limit_per_sec = 50;
        config.rate_limit_burst = 5;
        let rate = config.rate_limit_config().unwrap();
        assert_eq!(rate.refill_rate, 50);
        assert_eq!(rate.burst_size, 5);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"worker": {"batch_size": 25}, "outbox": {"sqlite_path": "/tmp/o.db"}}"#;
        let config: MirrorConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.worker.batch_size, 25);
        assert_eq!(config.worker.max_attempts, 10);
        assert_eq!(config.worker.lease, "30s");
        assert!(config.outbox.wal_mode);
        assert_eq!(config.prober.timeout, "1s");
    }

    #[test]
    fn test_circuit_config_from_coordinator() {
        let config = CoordinatorConfig {
            circuit_open_wait: "1m".to_string(),
            ..Default::default()
        };
        let circuit = config.circuit_config();
        assert_eq!(circuit.open_wait, Duration::from_secs(60));
        assert_eq!(circuit.window, 10);
    }
}
