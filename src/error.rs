// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the mirror engine.
//!
//! Errors are categorized by which side of the replication boundary they
//! came from. Only primary-store failures (and a failed outbox append, which
//! leaves the intent undurable) cross the component boundary to business
//! code; everything else is absorbed by enqueueing or retrying.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Primary` | No | Primary store rejected the mutation (propagated to caller) |
//! | `Secondary` | Yes | Mirror store unavailable or failed |
//! | `Timeout` | Yes | Secondary call exceeded its deadline |
//! | `Outbox` | Yes | SQLite error on the outbox table |
//! | `EnqueueFailed` | No | Primary committed, outbox append failed |
//! | `UnknownEntity` | No | Model name missing from the registry (structural) |
//! | `InvalidMutation` | No | Caller passed an incomplete mutation |
//! | `MalformedRecord` | No | Outbox row could not be decoded |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |

use crate::operation::OpKind;
use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for mirror operations.
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Errors that can occur while mirroring.
///
/// Use [`is_retryable()`](Self::is_retryable) to check whether a later
/// attempt can be expected to succeed.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// The primary store failed. Fatal for the current call.
    #[error("Primary store error ({entity} {op}): {source}")]
    Primary {
        entity: String,
        op: OpKind,
        #[source]
        source: StoreError,
    },

    /// The secondary store failed.
    ///
    /// Absorbed by the coordinator (enqueue) and the worker (attempts++).
    #[error("Secondary store error ({entity} {op}): {source}")]
    Secondary {
        entity: String,
        op: OpKind,
        #[source]
        source: StoreError,
    },

    /// A secondary-store call did not finish in time.
    #[error("Timed out after {after_ms}ms: {what}")]
    Timeout { what: String, after_ms: u64 },

    /// SQLite error on the outbox.
    #[error("Outbox error: {0}")]
    Outbox(#[from] sqlx::Error),

    /// The primary write committed but its replication intent could not be
    /// recorded. The mirror will miss this mutation until repaired.
    #[error("Primary write committed but outbox append failed for {entity} (operation {operation_id}): {source}")]
    EnqueueFailed {
        entity: String,
        operation_id: String,
        #[source]
        source: sqlx::Error,
    },

    /// Model name has no registry entry.
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    /// Mutation is missing required parts (no writes were performed).
    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    /// An outbox row could not be decoded into an operation.
    #[error("Malformed outbox record {id}: {message}")]
    MalformedRecord { id: i64, message: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl MirrorError {
    /// Create a timeout error.
    pub fn timeout(what: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Secondary { .. } => true,
            Self::Timeout { .. } => true,
            Self::Outbox(_) => true, // busy/locked or transient I/O
            Self::Primary { .. } => false, // caller decides, we never retry
            Self::EnqueueFailed { .. } => false,
            Self::UnknownEntity(_) => false,
            Self::InvalidMutation(_) => false,
            Self::MalformedRecord { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
        }
    }

    /// Whether this error came from the secondary side of the boundary.
    ///
    /// These are the errors a write must never surface to its caller.
    pub fn is_secondary(&self) -> bool {
        matches!(self, Self::Secondary { .. } | Self::Timeout { .. })
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Primary { .. } => "primary",
            Self::Secondary { .. } => "secondary",
            Self::Timeout { .. } => "timeout",
            Self::Outbox(_) => "outbox",
            Self::EnqueueFailed { .. } => "enqueue_failed",
            Self::UnknownEntity(_) => "unknown_entity",
            Self::InvalidMutation(_) => "invalid_mutation",
            Self::MalformedRecord { .. } => "malformed",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
        }
    }
}
