//! Secondary store liveness.
//!
//! One question, asked by both the coordinator and the worker: "can the
//! secondary be reached right now?" The answer comes from the store's
//! [`ping`](crate::store::EntityStore::ping), bounded by a timeout so an
//! unreachable host cannot stall a business write.
//!
//! # Caching
//!
//! With `cache_ttl = 0` (the default) every call probes. A positive TTL
//! reuses the last answer; config validation keeps it at or below one
//! worker period, so a stale "up" never outlives a drain tick.
//!
//! # Transitions
//!
//! Up/down changes are logged once per transition (warn on down, info on
//! recovery) and mirrored in the `mirror_secondary_available` gauge.

use crate::config::ProberConfig;
use crate::metrics;
use crate::store::EntityStore;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Last known secondary state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Never probed.
    Unknown,
    Up,
    Down,
}

impl Liveness {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Liveness::Up,
            2 => Liveness::Down,
            _ => Liveness::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Liveness::Unknown => 0,
            Liveness::Up => 1,
            Liveness::Down => 2,
        }
    }
}

struct CachedProbe {
    up: bool,
    expires_at: Instant,
}

/// Probes the secondary store for reachability.
pub struct LivenessProber {
    target: Arc<dyn EntityStore>,
    timeout: Duration,
    cache_ttl: Duration,
    cache: RwLock<Option<CachedProbe>>,
    state: AtomicU8,
    probes: AtomicU64,
    failures: AtomicU64,
    /// Epoch millis of the last successful probe (0 = never)
    last_success: AtomicU64,
}

impl LivenessProber {
    /// Create a prober for `target`.
    pub fn new(target: Arc<dyn EntityStore>, config: &ProberConfig) -> Self {
        Self {
            target,
            timeout: config.timeout_duration(),
            cache_ttl: config.cache_ttl_duration(),
            cache: RwLock::new(None),
            state: AtomicU8::new(Liveness::Unknown.as_u8()),
            probes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_success: AtomicU64::new(0),
        }
    }

    /// Whether the secondary is reachable, honoring the cache TTL.
    pub async fn is_available(&self) -> bool {
        if !self.cache_ttl.is_zero() {
            let cache = self.cache.read().await;
            if let Some(ref cached) = *cache {
                if Instant::now() < cached.expires_at {
                    return cached.up;
                }
            }
        }
        self.probe_now().await
    }

    /// Probe immediately, bypassing the cache.
    pub async fn probe_now(&self) -> bool {
        self.probes.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let up = match timeout(self.timeout, self.target.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(error = %e, "Secondary probe failed");
                false
            }
            Err(_) => {
                debug!(timeout_ms = self.timeout.as_millis() as u64, "Secondary probe timed out");
                false
            }
        };

        metrics::record_probe(up, start.elapsed());
        self.record(up).await;
        up
    }

    /// Record that the secondary just failed outside a probe.
    ///
    /// Cached "up" answers are dropped so the next caller re-probes.
    pub async fn mark_down(&self) {
        *self.cache.write().await = None;
        self.transition(Liveness::Down);
    }

    /// Last observed state (no probe).
    pub fn last_state(&self) -> Liveness {
        Liveness::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn probes_total(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    pub fn failures_total(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Milliseconds since the last successful probe (`u64::MAX` if never).
    pub fn millis_since_success(&self) -> u64 {
        let last = self.last_success.load(Ordering::Relaxed);
        if last == 0 {
            return u64::MAX;
        }
        epoch_millis().saturating_sub(last)
    }

    async fn record(&self, up: bool) {
        if up {
            self.last_success.store(epoch_millis(), Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        if !self.cache_ttl.is_zero() {
            *self.cache.write().await = Some(CachedProbe {
                up,
                expires_at: Instant::now() + self.cache_ttl,
            });
        }
        self.transition(if up { Liveness::Up } else { Liveness::Down });
    }

    fn transition(&self, next: Liveness) {
        let prev = Liveness::from_u8(self.state.swap(next.as_u8(), Ordering::Relaxed));
        if prev == next {
            return;
        }
        metrics::set_secondary_available(next == Liveness::Up);
        match (prev, next) {
            (_, Liveness::Down) => warn!(previous = ?prev, "Secondary store unreachable"),
            (Liveness::Down, Liveness::Up) => info!("Secondary store reachable again"),
            (_, Liveness::Up) => info!("Secondary store reachable"),
            (_, Liveness::Unknown) => {}
        }
    }
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
