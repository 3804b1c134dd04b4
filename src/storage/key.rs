//! Storage keys.
//!
//! Keys are opaque hierarchical identifiers. The only structure the core
//! relies on is child composition: a backing family derives one child key
//! per entity id.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::StoreError;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn parse(s: impl Into<String>) -> Result<Self, StoreError> {
        let s = s.into();
        if s.is_empty() {
            return Err(StoreError::InvalidKey {
                raw: s,
                reason: "must be non-empty",
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn child_key_with_component(&self, component: &str) -> StorageKey {
        StorageKey(format!("{}/{}", self.0, component))
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageKey({:?})", self.0)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The key pair of a reference-mode store: entity bodies below `backing`,
/// the reference container at `storage`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReferenceModeStorageKey {
    pub backing: StorageKey,
    pub storage: StorageKey,
}

impl ReferenceModeStorageKey {
    pub fn new(backing: StorageKey, storage: StorageKey) -> Self {
        Self { backing, storage }
    }
}

impl fmt::Display for ReferenceModeStorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reference-mode://{{{}}}{{{}}}", self.backing, self.storage)
    }
}
