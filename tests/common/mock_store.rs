//! Store wrapper with switchable failure modes.
//!
//! Wraps an [`InMemoryStore`] and records every write call for assertions.
//! Modes cover the ways a secondary misbehaves in production: refusing
//! connections, rejecting writes, and hanging.

use outbox_mirror::store::BoxFuture;
use outbox_mirror::{EntityStore, Fields, InMemoryStore, OpKind, Row, StoreError};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// How the store answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Healthy,
    /// Every call, ping included, fails with `Unavailable`.
    Offline,
    /// Ping succeeds; writes fail with `Other`.
    RejectWrites,
    /// Every call, ping included, sleeps for a minute.
    Hang,
    /// Ping succeeds; writes sleep for a minute.
    HangWrites,
}

impl Mode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Mode::Offline,
            2 => Mode::RejectWrites,
            3 => Mode::Hang,
            4 => Mode::HangWrites,
            _ => Mode::Healthy,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Mode::Healthy => 0,
            Mode::Offline => 1,
            Mode::RejectWrites => 2,
            Mode::Hang => 3,
            Mode::HangWrites => 4,
        }
    }
}

/// A recorded write call.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteCall {
    pub op: OpKind,
    pub data: Fields,
    pub filter: Fields,
}

/// Store with a switchable failure mode.
pub struct FlakyStore {
    inner: InMemoryStore,
    mode: AtomicU8,
    /// Remaining writes to reject before returning to the current mode
    reject_next: AtomicUsize,
    calls: Mutex<Vec<WriteCall>>,
}

impl FlakyStore {
    pub fn new(name: &str) -> Self {
        Self {
            inner: InMemoryStore::new(name),
            mode: AtomicU8::new(Mode::Healthy.as_u8()),
            reject_next: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        self.mode.store(mode.as_u8(), Ordering::SeqCst);
    }

    pub fn mode(&self) -> Mode {
        Mode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    /// Reject the next `n` writes regardless of mode.
    #[allow(dead_code)]
    pub fn reject_next(&self, n: usize) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    /// Writes that reached the store (successful or not).
    pub fn calls(&self) -> Vec<WriteCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    pub async fn get(&self, key: impl Into<serde_json::Value>) -> Option<Row> {
        self.inner.get(key).await
    }

    pub async fn rows(&self) -> Vec<Row> {
        self.inner.rows().await
    }

    fn record(&self, op: OpKind, data: &Fields, filter: &Fields) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(WriteCall {
                op,
                data: data.clone(),
                filter: filter.clone(),
            });
        }
    }

    /// Gate shared by every write. `Ok` means forward to the inner store.
    async fn gate(&self) -> Result<(), StoreError> {
        let forced = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return Err(StoreError::Other("injected rejection".into()));
        }
        match self.mode() {
            Mode::Healthy => Ok(()),
            Mode::Offline => Err(StoreError::Unavailable("connection refused".into())),
            Mode::RejectWrites => Err(StoreError::Other("write rejected".into())),
            Mode::Hang | Mode::HangWrites => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(StoreError::Unavailable("hung".into()))
            }
        }
    }
}

impl EntityStore for FlakyStore {
    fn create(&self, data: Fields) -> BoxFuture<'_, Row> {
        Box::pin(async move {
            self.record(OpKind::Create, &data, &Fields::new());
            self.gate().await?;
            self.inner.create(data).await
        })
    }

    fn update(&self, data: Fields, filter: Fields) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            self.record(OpKind::Update, &data, &filter);
            self.gate().await?;
            self.inner.update(data, filter).await
        })
    }

    fn delete(&self, filter: Fields) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            self.record(OpKind::Delete, &Fields::new(), &filter);
            self.gate().await?;
            self.inner.delete(filter).await
        })
    }

    fn find_one(&self, filter: Fields) -> BoxFuture<'_, Option<Row>> {
        Box::pin(async move {
            match self.mode() {
                Mode::Offline => Err(StoreError::Unavailable("connection refused".into())),
                Mode::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Err(StoreError::Unavailable("hung".into()))
                }
                _ => self.inner.find_one(filter).await,
            }
        })
    }

    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match self.mode() {
                Mode::Offline => Err(StoreError::Unavailable("connection refused".into())),
                Mode::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
                _ => Ok(()),
            }
        })
    }
}
