//! # Weft
//!
//! Platform core for composing reactive, data-sharing particles connected
//! via storage handles.
//!
//! ## Subsystems
//!
//! - [`crdt`] - causally ordered, merge-safe replicated data types (Count,
//!   Singleton, Collection, Entity) with version vectors and two-sided
//!   merge deltas.
//! - [`refine`] - refinement expression algebra: typed predicates over
//!   record fields and numeric range derivation.
//! - [`storage`] - the store stack: direct stores over abstract drivers,
//!   and the reference-mode store that splits entity collections into a
//!   reference container and a per-entity backing family.
//! - [`recipe`] - the recipe graph: particles, handles, and slots with
//!   structural invariants, canonical normalization, and a resolvability
//!   predicate.
//!
//! Cross-component signaling (driver delivery, proxy notification, host
//! exceptions) travels over channels; owners pump them explicitly. A
//! [`runtime::Runtime`] bundles configuration, the driver registry, and
//! the host exception channel for single-process use.

#![forbid(unsafe_code)]

pub mod config;
pub mod crdt;
pub mod error;
pub mod recipe;
pub mod refine;
pub mod runtime;
pub mod schema;
pub mod storage;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export primary types at crate root for convenience
pub use crate::crdt::{
    Actor, CausalOrder, CountData, CountOperation, CrdtChange, CrdtCollection, CrdtCount,
    CrdtEntity, CrdtError, CrdtModel, CrdtSingleton, EntityData, EntityOperation, MergeOutcome,
    Referenceable, SetData, SetOperation, SingletonOperation, VersionMap, VersionedValue,
};
pub use crate::recipe::{
    CloneMap, Direction, Fate, FrozenRecipe, Handle, HandleConnection, MergeSlices, Particle,
    Recipe, RecipeErrors, Search, Slot, SlotConnection, TypeDecl,
};
pub use crate::refine::{
    BinaryOp, Boundary, BoundaryKind, EvalType, Expression, NumericRange, RefinementError,
    Segment, TypeEnv, UnaryOp,
};
pub use crate::schema::{Entity, FieldType, PrimitiveKind, ReferenceId, Schema, SchemaValue,
    SchemaViolation,
};
pub use crate::runtime::{PropagatedException, Runtime};
pub use crate::storage::{
    BackingFamily, DirectStore, DriverRegistry, Existence, HandleMode, MemoryDriver, ProxyId,
    ProxyMessage, Reference, ReferenceModeStorageKey, ReferenceModeStore, StorageDriver,
    StorageKey, StoreError, StoreMode, StoreOptions,
};
