//! Merge-safe replicated data types.
//!
//! Module hierarchy follows type dependency order:
//! - version: Actor, VersionMap (Layer 0)
//! - count: per-actor counter with guarded increments (Layer 1)
//! - set: versioned-value set shared by Collection and Singleton (Layer 1)
//! - collection: observed-remove collection (Layer 2)
//! - singleton: at-most-one register with deterministic winner (Layer 2)
//! - entity: field-addressed record of singletons and collections (Layer 3)
//!
//! Every model exposes the same capability surface through [`CrdtModel`]:
//! apply an operation (out-of-order ops return `false`, they are not
//! errors), merge a remote snapshot producing a two-sided delta, and read
//! the particle-facing view.

pub mod collection;
pub mod count;
pub mod entity;
pub mod set;
pub mod singleton;
pub mod version;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::error::{Effect, Transience};

pub use collection::CrdtCollection;
pub use count::{CountData, CountOperation, CrdtCount};
pub use entity::{CrdtEntity, EntityData, EntityOperation, EntityView};
pub use set::{Referenceable, SetData, SetOperation, VersionedValue};
pub use singleton::{CrdtSingleton, SingletonOperation};
pub use version::{Actor, CausalOrder, VersionMap};

/// Canonical error enum for the CRDT capability.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CrdtError {
    #[error("actor id must be non-empty")]
    EmptyActor,
    #[error("cannot merge divergent replicas: {detail}")]
    Divergence { detail: String },
}

impl CrdtError {
    pub fn transience(&self) -> Transience {
        // Divergence never heals by retrying the same merge.
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}

/// One side of a merge delta: either an exact operation list or a whole
/// replacement model.
#[derive(Clone, Debug, PartialEq)]
pub enum CrdtChange<Op, Data> {
    Operations(Vec<Op>),
    Model(Data),
}

impl<Op, Data> CrdtChange<Op, Data> {
    pub fn is_empty(&self) -> bool {
        match self {
            CrdtChange::Operations(ops) => ops.is_empty(),
            CrdtChange::Model(_) => false,
        }
    }
}

/// Two-sided merge delta.
///
/// Applying `other_change` to the pre-merge other replica yields the merged
/// state; `model_change` describes what happened to this replica.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeOutcome<Op, Data> {
    pub model_change: CrdtChange<Op, Data>,
    pub other_change: CrdtChange<Op, Data>,
}

/// A replicated model that can be merged deterministically.
///
/// Merge properties (over `data()` snapshots):
/// - Commutative: merging A into B and B into A reach the same state.
/// - Associative and idempotent.
///
/// `apply_operation` returns `false` for operations that do not connect to
/// the current version vector (out-of-order or duplicate); the caller is
/// expected to re-request a sync. Merges that cannot reconcile raise
/// [`CrdtError::Divergence`].
pub trait CrdtModel: Sized {
    type Data: Clone + PartialEq + std::fmt::Debug + Serialize + DeserializeOwned;
    type Operation: Clone + std::fmt::Debug;
    type View;

    fn from_data(data: Self::Data) -> Self;

    fn data(&self) -> &Self::Data;

    fn apply_operation(&mut self, op: &Self::Operation) -> bool;

    fn merge(
        &mut self,
        other: &Self::Data,
    ) -> Result<MergeOutcome<Self::Operation, Self::Data>, CrdtError>;

    /// The value a particle observes, with CRDT bookkeeping stripped.
    fn particle_view(&self) -> Self::View;
}
