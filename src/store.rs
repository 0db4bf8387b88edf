// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store handle abstraction.
//!
//! Both the primary and the secondary side of an entity are reached through
//! [`EntityStore`]. The engine never looks inside a row: rows and filters
//! are plain JSON field maps, and filters match by field equality.
//!
//! # Example
//!
//! ```rust,no_run
//! use outbox_mirror::store::{BoxFuture, EntityStore, Fields, Row};
//!
//! struct OrmWalletTable { /* connection pool, model handle... */ }
//!
//! impl EntityStore for OrmWalletTable {
//!     fn create(&self, data: Fields) -> BoxFuture<'_, Row> {
//!         Box::pin(async move { Ok(data) })
//!     }
//!
//!     fn update(&self, _data: Fields, _filter: Fields) -> BoxFuture<'_, u64> {
//!         Box::pin(async move { Ok(1) })
//!     }
//!
//!     fn delete(&self, _filter: Fields) -> BoxFuture<'_, u64> {
//!         Box::pin(async move { Ok(1) })
//!     }
//!
//!     fn find_one(&self, _filter: Fields) -> BoxFuture<'_, Option<Row>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//! }
//! ```

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::RwLock;

/// Field map used for row data and `where` filters.
pub type Fields = serde_json::Map<String, Value>;

/// A row as returned by a store.
pub type Row = Fields;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Error reported by a store handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, auth failed...).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness constraint rejected the write.
    #[error("unique constraint violated on `{field}`")]
    Conflict { field: String },

    /// Any other store failure.
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Check if this is a duplicate-key violation.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// A CRUD-capable handle for one entity on one store.
///
/// Implementations are expected to be cheap to share (`Arc<dyn EntityStore>`).
/// The underlying store API is assumed not to return mutated rows from
/// `update`/`delete`, so the coordinator re-reads through `find_one`.
pub trait EntityStore: Send + Sync + 'static {
    /// Insert a row and return it as stored (including any assigned key).
    fn create(&self, data: Fields) -> BoxFuture<'_, Row>;

    /// Apply `data` to every row matching `filter`. Returns rows affected.
    fn update(&self, data: Fields, filter: Fields) -> BoxFuture<'_, u64>;

    /// Delete every row matching `filter`. Returns rows affected.
    fn delete(&self, filter: Fields) -> BoxFuture<'_, u64>;

    /// Fetch the first row matching `filter`.
    fn find_one(&self, filter: Fields) -> BoxFuture<'_, Option<Row>>;

    /// Connect/authenticate check used by the liveness prober.
    ///
    /// Default implementation returns `Ok(())`.
    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Whether `row` satisfies every equality in `filter`.
///
/// An empty filter matches everything.
pub fn matches_filter(row: &Row, filter: &Fields) -> bool {
    filter.iter().all(|(k, v)| row.get(k) == Some(v))
}

/// In-memory store with autoincrement keys and unique fields.
///
/// Used in tests and demos, and as a stand-in mirror during development.
/// Can be taken offline to simulate an unreachable store: every call
/// (including `ping`) then fails with [`StoreError::Unavailable`].
pub struct InMemoryStore {
    name: String,
    key_field: String,
    unique_fields: Vec<String>,
    rows: RwLock<Vec<Row>>,
    next_key: AtomicI64,
    online: AtomicBool,
}

impl InMemoryStore {
    /// Create an empty store keyed on `id`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_key(name, "id")
    }

    /// Create an empty store keyed on `key_field`.
    pub fn with_key(name: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_field: key_field.into(),
            unique_fields: Vec::new(),
            rows: RwLock::new(Vec::new()),
            next_key: AtomicI64::new(1),
            online: AtomicBool::new(true),
        }
    }

    /// Add a unique constraint on `field` (besides the key).
    #[must_use]
    pub fn unique(mut self, field: impl Into<String>) -> Self {
        self.unique_fields.push(field.into());
        self
    }

    /// Store name (for logging).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the store on/offline.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Whether the store is currently online.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Snapshot of all rows, in insertion order.
    pub async fn rows(&self) -> Vec<Row> {
        self.rows.read().await.clone()
    }

    /// Number of rows stored.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Whether the store holds no rows.
    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Fetch a row by key.
    pub async fn get(&self, key: impl Into<Value>) -> Option<Row> {
        let key = key.into();
        self.rows
            .read()
            .await
            .iter()
            .find(|r| r.get(&self.key_field) == Some(&key))
            .cloned()
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("{} is offline", self.name)))
        }
    }

    fn check_unique(&self, rows: &[Row], candidate: &Row, skip: Option<usize>) -> StoreResult<()> {
        let constrained = std::iter::once(&self.key_field).chain(self.unique_fields.iter());
        for field in constrained {
            let Some(value) = candidate.get(field) else {
                continue;
            };
            let clash = rows
                .iter()
                .enumerate()
                .any(|(i, r)| Some(i) != skip && r.get(field) == Some(value));
            if clash {
                return Err(StoreError::Conflict {
                    field: field.clone(),
                });
            }
        }
        Ok(())
    }
}

impl EntityStore for InMemoryStore {
    fn create(&self, data: Fields) -> BoxFuture<'_, Row> {
        Box::pin(async move {
            self.check_online()?;
            let mut rows = self.rows.write().await;
            let mut row = data;

            match row.get(&self.key_field).and_then(Value::as_i64) {
                // Explicit key: keep autoincrement ahead of it
                Some(explicit) => {
                    self.next_key.fetch_max(explicit + 1, Ordering::SeqCst);
                }
                None if !row.contains_key(&self.key_field) => {
                    let key = self.next_key.fetch_add(1, Ordering::SeqCst);
                    row.insert(self.key_field.clone(), Value::from(key));
                }
                None => {}
            }

            self.check_unique(&rows, &row, None)?;
            rows.push(row.clone());
            tracing::trace!(store = %self.name, "InMemory: created row");
            Ok(row)
        })
    }

    fn update(&self, data: Fields, filter: Fields) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            self.check_online()?;
            let mut rows = self.rows.write().await;
            let targets: Vec<usize> = rows
                .iter()
                .enumerate()
                .filter(|(_, r)| matches_filter(r, &filter))
                .map(|(i, _)| i)
                .collect();

            for &i in &targets {
                let mut updated = rows[i].clone();
                for (k, v) in &data {
                    updated.insert(k.clone(), v.clone());
                }
                self.check_unique(&rows, &updated, Some(i))?;
                rows[i] = updated;
            }
            Ok(targets.len() as u64)
        })
    }

    fn delete(&self, filter: Fields) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            self.check_online()?;
            let mut rows = self.rows.write().await;
            let before = rows.len();
            rows.retain(|r| !matches_filter(r, &filter));
            Ok((before - rows.len()) as u64)
        })
    }

    fn find_one(&self, filter: Fields) -> BoxFuture<'_, Option<Row>> {
        Box::pin(async move {
            self.check_online()?;
            Ok(self
                .rows
                .read()
                .await
                .iter()
                .find(|r| matches_filter(r, &filter))
                .cloned())
        })
    }

    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.check_online() })
    }
}
