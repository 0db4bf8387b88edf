// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity store registry.
//!
//! Immutable map from logical entity name to its `{primary, secondary}`
//! store pair. Built once at startup, shared behind an `Arc`.
//!
//! ```rust,no_run
//! use outbox_mirror::registry::{EntityKind, RegistryBuilder};
//! use outbox_mirror::store::InMemoryStore;
//! use std::sync::Arc;
//!
//! struct Wallet;
//! impl EntityKind for Wallet {
//!     const NAME: &'static str = "Wallet";
//! }
//!
//! let registry = RegistryBuilder::new()
//!     .register::<Wallet>(
//!         Arc::new(InMemoryStore::new("local")),
//!         Arc::new(InMemoryStore::new("remote")),
//!     )
//!     .build()
//!     .unwrap();
//! assert!(registry.resolve("Wallet").is_some());
//! ```

use crate::error::{MirrorError, Result};
use crate::outbox::Outbox;
use crate::store::EntityStore;
use std::collections::HashMap;
use std::sync::Arc;

/// A statically named entity.
pub trait EntityKind {
    /// Registry key, also written to the outbox `model_name` column.
    const NAME: &'static str;
    /// Field holding the primary-assigned key.
    const KEY_FIELD: &'static str = "id";
}

/// Primary and secondary handles for one entity.
#[derive(Clone)]
pub struct StorePair {
    pub name: String,
    pub primary: Arc<dyn EntityStore>,
    pub secondary: Arc<dyn EntityStore>,
    pub key_field: String,
}

impl std::fmt::Debug for StorePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorePair")
            .field("name", &self.name)
            .field("key_field", &self.key_field)
            .finish_non_exhaustive()
    }
}

/// Builder for [`EntityRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<StorePair>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed entity.
    #[must_use]
    pub fn register<K: EntityKind>(
        self,
        primary: Arc<dyn EntityStore>,
        secondary: Arc<dyn EntityStore>,
    ) -> Self {
        self.register_dynamic(K::NAME, K::KEY_FIELD, primary, secondary)
    }

    /// Register an entity by runtime name.
    #[must_use]
    pub fn register_dynamic(
        mut self,
        name: impl Into<String>,
        key_field: impl Into<String>,
        primary: Arc<dyn EntityStore>,
        secondary: Arc<dyn EntityStore>,
    ) -> Self {
        self.entries.push(StorePair {
            name: name.into(),
            primary,
            secondary,
            key_field: key_field.into(),
        });
        self
    }

    /// Freeze the registry. Empty or duplicate names are a config error.
    pub fn build(self) -> Result<EntityRegistry> {
        let mut pairs = HashMap::with_capacity(self.entries.len());
        for pair in self.entries {
            if pair.name.trim().is_empty() {
                return Err(MirrorError::Config("entity name must not be empty".into()));
            }
            if pair.key_field.trim().is_empty() {
                return Err(MirrorError::Config(format!(
                    "entity {} has an empty key field",
                    pair.name
                )));
            }
            if pairs.contains_key(&pair.name) {
                return Err(MirrorError::Config(format!(
                    "entity {} registered twice",
                    pair.name
                )));
            }
            pairs.insert(pair.name.clone(), Arc::new(pair));
        }
        Ok(EntityRegistry { pairs })
    }
}

/// Read-only entity name → store pair map.
#[derive(Debug)]
pub struct EntityRegistry {
    pairs: HashMap<String, Arc<StorePair>>,
}

impl EntityRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Look up a pair by entity name.
    pub fn resolve(&self, name: &str) -> Option<Arc<StorePair>> {
        self.pairs.get(name).cloned()
    }

    /// Look up a typed entity.
    pub fn pair_for<K: EntityKind>(&self) -> Option<Arc<StorePair>> {
        self.resolve(K::NAME)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pairs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Pending outbox model names with no entry here.
    pub async fn audit_outbox(&self, outbox: &Outbox) -> Result<Vec<String>> {
        let names = outbox.model_names().await?;
        Ok(names
            .into_iter()
            .filter(|n| !self.pairs.contains_key(n))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    struct Wallet;
    impl EntityKind for Wallet {
        const NAME: &'static str = "Wallet";
    }

    struct Attendance;
    impl EntityKind for Attendance {
        const NAME: &'static str = "Attendance";
        const KEY_FIELD: &'static str = "attendanceId";
    }

    fn store(name: &str) -> Arc<dyn EntityStore> {
        Arc::new(InMemoryStore::new(name))
    }

    #[test]
    fn test_typed_registration() {
        let registry = RegistryBuilder::new()
            .register::<Wallet>(store("p"), store("s"))
            .register::<Attendance>(store("p"), store("s"))
            .build()
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.pair_for::<Wallet>().unwrap().key_field, "id");
        assert_eq!(registry.pair_for::<Attendance>().unwrap().key_field, "attendanceId");
        assert_eq!(registry.names(), vec!["Attendance", "Wallet"]);
    }

    #[test]
    fn test_unknown_name_resolves_to_none() {
        let registry = RegistryBuilder::new()
            .register::<Wallet>(store("p"), store("s"))
            .build()
            .unwrap();
        assert!(registry.resolve("Ghost").is_none());
        assert!(registry.resolve("wallet").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let err = RegistryBuilder::new()
            .register::<Wallet>(store("p"), store("s"))
            .register_dynamic("Wallet", "id", store("p"), store("s"))
            .build()
            .unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = RegistryBuilder::new()
            .register_dynamic("", "id", store("p"), store("s"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
