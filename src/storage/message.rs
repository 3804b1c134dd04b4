//! Proxy messages and store options.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::key::StorageKey;
use crate::crdt::CrdtModel;

/// Identifier handed out when a proxy registers with a store.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ProxyId(pub u32);

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The tagged message union exchanged between proxies and stores.
///
/// `id` names the originating proxy: stores exclude it when broadcasting
/// updates, and target it exclusively when answering a sync request.
#[derive(Debug)]
pub enum ProxyMessage<M: CrdtModel> {
    SyncRequest {
        id: Option<ProxyId>,
    },
    ModelUpdate {
        model: M::Data,
        id: Option<ProxyId>,
    },
    Operations {
        operations: Vec<M::Operation>,
        id: Option<ProxyId>,
    },
}

impl<M: CrdtModel> Clone for ProxyMessage<M> {
    fn clone(&self) -> Self {
        match self {
            ProxyMessage::SyncRequest { id } => ProxyMessage::SyncRequest { id: *id },
            ProxyMessage::ModelUpdate { model, id } => ProxyMessage::ModelUpdate {
                model: model.clone(),
                id: *id,
            },
            ProxyMessage::Operations { operations, id } => ProxyMessage::Operations {
                operations: operations.clone(),
                id: *id,
            },
        }
    }
}

impl<M: CrdtModel> ProxyMessage<M> {
    pub fn origin(&self) -> Option<ProxyId> {
        match self {
            ProxyMessage::SyncRequest { id }
            | ProxyMessage::ModelUpdate { id, .. }
            | ProxyMessage::Operations { id, .. } => *id,
        }
    }

    pub fn with_origin(mut self, origin: Option<ProxyId>) -> Self {
        match &mut self {
            ProxyMessage::SyncRequest { id }
            | ProxyMessage::ModelUpdate { id, .. }
            | ProxyMessage::Operations { id, .. } => *id = origin,
        }
        self
    }
}

/// A proxy message routed within a keyed store family: `mux_id` names the
/// entity store the message belongs to.
#[derive(Debug)]
pub struct MuxedProxyMessage<M: CrdtModel> {
    pub mux_id: crate::schema::ReferenceId,
    pub message: ProxyMessage<M>,
}

impl<M: CrdtModel> Clone for MuxedProxyMessage<M> {
    fn clone(&self) -> Self {
        Self {
            mux_id: self.mux_id.clone(),
            message: self.message.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Existence {
    MayExist,
    MustExist,
    ShouldCreate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    Direct,
    Backing,
    ReferenceMode,
}

/// What a handle is allowed to do with its store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleMode {
    Read,
    Write,
    ReadWrite,
}

impl Default for HandleMode {
    fn default() -> Self {
        HandleMode::ReadWrite
    }
}

impl HandleMode {
    pub fn can_read(self) -> bool {
        matches!(self, HandleMode::Read | HandleMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, HandleMode::Write | HandleMode::ReadWrite)
    }

    /// True when every capability of `requested` is permitted by `self`.
    pub fn allows(self, requested: HandleMode) -> bool {
        (!requested.can_read() || self.can_read())
            && (!requested.can_write() || self.can_write())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    pub storage_key: StorageKey,
    pub existence: Existence,
    pub mode: StoreMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_token: Option<String>,
}

impl StoreOptions {
    pub fn new(storage_key: StorageKey, mode: StoreMode) -> Self {
        Self {
            storage_key,
            existence: Existence::ShouldCreate,
            mode,
            version_token: None,
        }
    }
}
