//! The store stack.
//!
//! Module hierarchy follows dependency order:
//! - key: opaque hierarchical storage keys
//! - message: proxy message union and store options
//! - driver: the persistence contract plus the in-memory driver/registry
//! - direct: one CRDT model over one driver, with send-retry
//! - backing: a lazily-created keyed family of entity stores
//! - refmode: the reference-mode store coordinating container and backing

pub mod backing;
pub mod direct;
pub mod driver;
pub mod key;
pub mod message;
pub mod refmode;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crdt::{CrdtError, Referenceable, VersionMap};
use crate::error::{Effect, Transience};
use crate::schema::{ReferenceId, SchemaViolation};

pub use backing::BackingFamily;
pub use direct::DirectStore;
pub use driver::{DriverRegistry, DriverUpdate, MemoryDriver, StorageDriver};
pub use key::{ReferenceModeStorageKey, StorageKey};
pub use message::{
    Existence, HandleMode, MuxedProxyMessage, ProxyId, ProxyMessage, StoreMode, StoreOptions,
};
pub use refmode::{ContainerModel, ReferenceModeStore};

/// A value placed in a reference-mode container: it points at the entity
/// body in the backing store, carrying the version the body must reach
/// before the reference may be dereferenced.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    pub id: ReferenceId,
    pub storage_key: StorageKey,
    pub version: VersionMap,
}

impl Referenceable for Reference {
    fn unique_id(&self) -> String {
        self.id.as_str().to_string()
    }
}

/// Canonical error enum for the store capability.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("driver unavailable for key `{key}`: {reason}")]
    DriverUnavailable { key: String, reason: String },
    #[error("storage key `{raw}` is invalid: {reason}")]
    InvalidKey { raw: String, reason: &'static str },
    #[error("message requires an originating proxy id")]
    MissingProxyId,
    #[error("store options request mode {requested:?}, but this constructor builds {supported:?}")]
    UnsupportedMode {
        requested: StoreMode,
        supported: StoreMode,
    },
    #[error("proxy {0} is not registered")]
    UnregisteredProxy(ProxyId),
    #[error("{what} exceeds the configured limit of {limit}")]
    LimitExceeded { what: &'static str, limit: usize },
    #[error(transparent)]
    Crdt(#[from] CrdtError),
    #[error(transparent)]
    Schema(#[from] SchemaViolation),
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::DriverUnavailable { .. } => Transience::Retryable,
            StoreError::MissingProxyId
            | StoreError::InvalidKey { .. }
            | StoreError::UnsupportedMode { .. }
            | StoreError::UnregisteredProxy(_)
            | StoreError::LimitExceeded { .. } => Transience::Permanent,
            StoreError::Crdt(e) => e.transience(),
            StoreError::Schema(e) => e.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            // A divergence surfaces mid-merge; partial adoption is possible.
            StoreError::Crdt(_) => Effect::Unknown,
            _ => Effect::None,
        }
    }
}
