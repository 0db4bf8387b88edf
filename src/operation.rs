// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mutations and their durable encoding.
//!
//! A [`Mutation`] is what business code asks for. A [`NewOperation`] is the
//! replication intent the coordinator enqueues when the secondary could not
//! take the mutation inline. The same [`Mutation::apply_to`] is used for the
//! inline attempt and for the worker's replay, so both paths share one
//! idempotency rule:
//!
//! | Op | Key in `data`? | Secondary call |
//! |----|----------------|----------------|
//! | create | yes | upsert: `find_one(key)` then update or create |
//! | create | no | create; duplicate-key conflict counts as applied |
//! | update | n/a | `update(data, where)` |
//! | delete | n/a | `delete(where)` |

use crate::error::{MirrorError, Result};
use crate::store::{EntityStore, Fields, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    /// Column value used in the outbox `op` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create" => Ok(OpKind::Create),
            "update" => Ok(OpKind::Update),
            "delete" => Ok(OpKind::Delete),
            other => Err(format!("unknown op `{other}`")),
        }
    }
}

/// The `{data, where}` payload stored in the outbox `payload` column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub data: Fields,
    #[serde(default, rename = "where")]
    pub filter: Fields,
}

impl Payload {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// A mutation requested by business code.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub entity: String,
    pub op: OpKind,
    pub data: Option<Fields>,
    pub filter: Option<Fields>,
}

impl Mutation {
    pub fn create(entity: impl Into<String>, data: Fields) -> Self {
        Self {
            entity: entity.into(),
            op: OpKind::Create,
            data: Some(data),
            filter: None,
        }
    }

    pub fn update(entity: impl Into<String>, data: Fields, filter: Fields) -> Self {
        Self {
            entity: entity.into(),
            op: OpKind::Update,
            data: Some(data),
            filter: Some(filter),
        }
    }

    pub fn delete(entity: impl Into<String>, filter: Fields) -> Self {
        Self {
            entity: entity.into(),
            op: OpKind::Delete,
            data: None,
            filter: Some(filter),
        }
    }

    /// Reject incomplete mutations before any store is touched.
    ///
    /// An empty `where` on update/delete is rejected too: it would rewrite
    /// or wipe the whole table on both stores.
    pub fn validate(&self) -> Result<()> {
        if self.entity.trim().is_empty() {
            return Err(MirrorError::InvalidMutation("entity name is empty".into()));
        }
        let needs_data = matches!(self.op, OpKind::Create | OpKind::Update);
        let needs_filter = matches!(self.op, OpKind::Update | OpKind::Delete);

        if needs_data && self.data.is_none() {
            return Err(MirrorError::InvalidMutation(format!(
                "{} {} requires data",
                self.op, self.entity
            )));
        }
        if needs_filter && self.filter.as_ref().map_or(true, |f| f.is_empty()) {
            return Err(MirrorError::InvalidMutation(format!(
                "{} {} requires a non-empty where",
                self.op, self.entity
            )));
        }
        Ok(())
    }

    /// Payload as it will be mirrored.
    pub fn payload(&self) -> Payload {
        Payload {
            data: self.data.clone().unwrap_or_default(),
            filter: self.filter.clone().unwrap_or_default(),
        }
    }
}

/// A replication intent ready to be appended to the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub operation_id: String,
    pub model_name: String,
    pub op: OpKind,
    pub payload: Payload,
}

impl NewOperation {
    /// Build an intent with a fresh UUID v4 operation id.
    pub fn new(model_name: impl Into<String>, op: OpKind, payload: Payload) -> Self {
        Self {
            operation_id: uuid::Uuid::new_v4().to_string(),
            model_name: model_name.into(),
            op,
            payload,
        }
    }
}

/// How a secondary apply ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Mutation written.
    Applied,
    /// Create hit a duplicate key: the row is already there.
    AlreadyPresent,
}

/// Apply `op`/`payload` to `store`.
///
/// `key_field` names the primary-assigned key used for create upserts.
pub async fn apply_to(
    store: &dyn EntityStore,
    key_field: &str,
    op: OpKind,
    payload: &Payload,
) -> StoreResult<ApplyOutcome> {
    match op {
        OpKind::Create => {
            let data = payload.data.clone();
            if let Some(key) = data.get(key_field).cloned() {
                let mut by_key = Fields::new();
                by_key.insert(key_field.to_string(), key);
                if store.find_one(by_key.clone()).await?.is_some() {
                    store.update(data, by_key).await?;
                    return Ok(ApplyOutcome::Applied);
                }
            }
            match store.create(data).await {
                Ok(_) => Ok(ApplyOutcome::Applied),
                Err(StoreError::Conflict { field }) => {
                    tracing::debug!(field = %field, "Create replay hit duplicate key, treating as applied");
                    Ok(ApplyOutcome::AlreadyPresent)
                }
                Err(e) => Err(e),
            }
        }
        OpKind::Update => {
            store
                .update(payload.data.clone(), payload.filter.clone())
                .await?;
            Ok(ApplyOutcome::Applied)
        }
        OpKind::Delete => {
            store.delete(payload.filter.clone()).await?;
            Ok(ApplyOutcome::Applied)
        }
    }
}
