//! The recipe graph.
//!
//! A recipe aggregates particles, handles, slots, and the connections
//! between them. It is built mutable, validated, then normalized exactly
//! once into a [`FrozenRecipe`]: canonically ordered, deeply immutable,
//! and the only form resolution, digesting, and printing accept.
//!
//! Module hierarchy:
//! - compare: the total order used for canonical sorting
//! - node: particles, handles, slots, connections, constraints, search
//! - recipe: the aggregate, normalization, resolution, clone/merge, print

pub mod compare;
pub mod node;
pub mod recipe;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::error::{Effect, Transience};

pub use compare::{compare_comparables, Comparable};
pub use node::{
    ConnectionConstraint, Direction, Fate, Handle, HandleConnection, Obligation, Particle, Search,
    Slot, SlotConnection, TypeDecl,
};
pub use recipe::{
    CloneMap, FrozenRecipe, HandleConnectionIndex, HandleIndex, MergeSlices, NormalizeFailure,
    ParticleIndex, Recipe, SlotConnectionIndex, SlotIndex,
};

/// Node label -> error message, collected non-fatally when supplied.
pub type RecipeErrors = BTreeMap<String, String>;

/// Canonical error enum for the recipe capability.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum RecipeError {
    #[error("recipe is invalid: {summary}")]
    Invalid { summary: String },
    #[error("recipe node index out of range: {kind}")]
    BadIndex { kind: &'static str },
}

impl RecipeError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        // Normalization refuses without mutating.
        Effect::None
    }
}
