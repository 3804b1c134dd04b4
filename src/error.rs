use thiserror::Error;

use crate::config::ConfigError;
use crate::crdt::CrdtError;
use crate::recipe::RecipeError;
use crate::refine::RefinementError;
use crate::schema::SchemaViolation;
use crate::storage::StoreError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (locally or remotely).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Crdt(#[from] CrdtError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Refinement(#[from] RefinementError),

    #[error(transparent)]
    Schema(#[from] SchemaViolation),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Crdt(e) => e.transience(),
            Error::Store(e) => e.transience(),
            Error::Recipe(e) => e.transience(),
            Error::Refinement(e) => e.transience(),
            Error::Schema(e) => e.transience(),
            Error::Config(e) => e.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Crdt(e) => e.effect(),
            Error::Store(e) => e.effect(),
            Error::Recipe(e) => e.effect(),
            Error::Refinement(e) => e.effect(),
            Error::Schema(e) => e.effect(),
            Error::Config(e) => e.effect(),
        }
    }
}
