//! Recipe node kinds.
//!
//! Nodes reference each other through arena indices owned by the recipe;
//! nothing here holds a direct pointer, which keeps clone/merge a plain
//! arena walk.

use std::collections::BTreeMap;
use std::fmt;

use crate::storage::HandleMode;

use super::recipe::{HandleConnectionIndex, ParticleIndex, SlotConnectionIndex, SlotIndex};

/// A handle's acquisition intent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fate {
    #[default]
    Unknown,
    Use,
    Map,
    Copy,
    Create,
}

impl Fate {
    pub fn as_str(self) -> &'static str {
        match self {
            Fate::Unknown => "?",
            Fate::Use => "use",
            Fate::Map => "map",
            Fate::Copy => "copy",
            Fate::Create => "create",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "?" => Some(Fate::Unknown),
            "use" => Some(Fate::Use),
            "map" => Some(Fate::Map),
            "copy" => Some(Fate::Copy),
            "create" => Some(Fate::Create),
            _ => None,
        }
    }
}

impl fmt::Display for Fate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Direction {
    Reads,
    Writes,
    ReadsWrites,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Reads => "reads",
            Direction::Writes => "writes",
            Direction::ReadsWrites => "reads writes",
        }
    }

    /// The store capability this direction demands.
    pub fn handle_mode(self) -> HandleMode {
        match self {
            Direction::Reads => HandleMode::Read,
            Direction::Writes => HandleMode::Write,
            Direction::ReadsWrites => HandleMode::ReadWrite,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A lightweight type declaration; just enough structure for canonical
/// ordering (interface-typed connections sort last) and printing.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeDecl {
    Entity { schema: String },
    Collection(Box<TypeDecl>),
    Interface { name: String },
}

impl TypeDecl {
    pub fn is_interface(&self) -> bool {
        match self {
            TypeDecl::Interface { .. } => true,
            TypeDecl::Collection(inner) => inner.is_interface(),
            TypeDecl::Entity { .. } => false,
        }
    }
}

impl fmt::Display for TypeDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDecl::Entity { schema } => write!(f, "{schema}"),
            TypeDecl::Collection(inner) => write!(f, "[{inner}]"),
            TypeDecl::Interface { name } => write!(f, "interface {name}"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Particle {
    pub name: String,
    pub local_name: Option<String>,
    pub verbs: Vec<String>,
    pub connections: Vec<HandleConnectionIndex>,
    pub slot_connections: Vec<SlotConnectionIndex>,
}

impl Particle {
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Handle {
    pub id: Option<String>,
    pub local_name: Option<String>,
    pub tags: Vec<String>,
    pub fate: Fate,
    pub ty: Option<TypeDecl>,
    /// What the underlying type permits; connections must not exceed it.
    pub mode: HandleMode,
    pub connections: Vec<HandleConnectionIndex>,
}

impl Handle {
    pub fn is_valid(&self) -> bool {
        self.id.as_deref() != Some("")
    }

    /// Resolved: a fate is chosen, and the handle either names an
    /// existing store or will create one.
    pub fn is_resolved(&self) -> bool {
        self.fate != Fate::Unknown && (self.fate == Fate::Create || self.id.is_some())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HandleConnection {
    pub particle: ParticleIndex,
    pub name: String,
    pub direction: Option<Direction>,
    pub ty: Option<TypeDecl>,
    pub tags: Vec<String>,
    pub handle: Option<super::recipe::HandleIndex>,
}

impl HandleConnection {
    pub fn is_interface_typed(&self) -> bool {
        self.ty.as_ref().is_some_and(TypeDecl::is_interface)
    }

    pub fn is_resolved(&self) -> bool {
        self.handle.is_some() && self.direction.is_some() && self.ty.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Slot {
    pub id: Option<String>,
    pub name: Option<String>,
    pub local_name: Option<String>,
    pub tags: Vec<String>,
    pub source_connection: Option<SlotConnectionIndex>,
    pub consumers: Vec<SlotConnectionIndex>,
}

impl Slot {
    pub fn is_valid(&self) -> bool {
        self.id.as_deref() != Some("")
    }

    pub fn is_resolved(&self) -> bool {
        self.id.is_some() || self.source_connection.is_some()
    }

    /// Nothing produces it and nothing consumes it.
    pub fn is_orphan(&self) -> bool {
        self.source_connection.is_none() && self.consumers.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SlotConnection {
    pub particle: ParticleIndex,
    pub name: String,
    pub tags: Vec<String>,
    pub target_slot: Option<SlotIndex>,
    /// Name -> slot this connection provides; provided slots follow their
    /// producing connection in canonical order.
    pub provided_slots: BTreeMap<String, SlotIndex>,
}

impl SlotConnection {
    pub fn is_resolved(&self) -> bool {
        self.target_slot.is_some()
    }
}

/// An unresolved wiring request between two particle endpoints. A frozen
/// recipe with remaining constraints cannot be resolved.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionConstraint {
    pub from_particle: String,
    pub from_connection: String,
    pub to_particle: String,
    pub to_connection: String,
    pub direction: Direction,
}

impl ConnectionConstraint {
    pub fn is_valid(&self) -> bool {
        !self.from_particle.is_empty()
            && !self.from_connection.is_empty()
            && !self.to_particle.is_empty()
            && !self.to_connection.is_empty()
    }
}

/// An outstanding commitment recorded during planning; resolution requires
/// none remain.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Obligation {
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Search {
    phrase: String,
    unresolved_tokens: Vec<String>,
    resolved_tokens: Vec<String>,
}

impl Search {
    pub fn new(phrase: impl Into<String>) -> Self {
        let phrase = phrase.into();
        let unresolved_tokens = phrase
            .split_whitespace()
            .map(|token| token.to_lowercase())
            .collect();
        Self {
            phrase,
            unresolved_tokens,
            resolved_tokens: Vec::new(),
        }
    }

    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    pub fn unresolved_tokens(&self) -> &[String] {
        &self.unresolved_tokens
    }

    pub fn resolved_tokens(&self) -> &[String] {
        &self.resolved_tokens
    }

    /// Mark a token as consumed by some strategy.
    pub fn resolve_token(&mut self, token: &str) -> bool {
        let token = token.to_lowercase();
        if let Some(position) = self.unresolved_tokens.iter().position(|t| *t == token) {
            let token = self.unresolved_tokens.remove(position);
            self.resolved_tokens.push(token);
            self.resolved_tokens.sort();
            true
        } else {
            false
        }
    }

    /// Every token still belongs to the phrase.
    pub fn is_valid(&self) -> bool {
        let mut all: Vec<String> = self
            .unresolved_tokens
            .iter()
            .chain(self.resolved_tokens.iter())
            .cloned()
            .collect();
        all.sort();
        let mut expected: Vec<String> = self
            .phrase
            .split_whitespace()
            .map(|token| token.to_lowercase())
            .collect();
        expected.sort();
        all == expected
    }

    pub fn is_resolved(&self) -> bool {
        self.unresolved_tokens.is_empty()
    }

    pub(crate) fn normalize(&mut self) {
        self.unresolved_tokens.sort();
        self.resolved_tokens.sort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fate_round_trips_through_strings() {
        for fate in [Fate::Unknown, Fate::Use, Fate::Map, Fate::Copy, Fate::Create] {
            assert_eq!(Fate::parse(fate.as_str()), Some(fate));
        }
        assert_eq!(Fate::parse("borrow"), None);
    }

    #[test]
    fn interface_detection_sees_through_collections() {
        let direct = TypeDecl::Interface {
            name: "HostedParticle".into(),
        };
        let nested = TypeDecl::Collection(Box::new(direct.clone()));
        let entity = TypeDecl::Entity {
            schema: "Person".into(),
        };
        assert!(direct.is_interface());
        assert!(nested.is_interface());
        assert!(!entity.is_interface());
    }

    #[test]
    fn handle_resolution_requires_fate_and_binding() {
        let mut handle = Handle::default();
        assert!(!handle.is_resolved());
        handle.fate = Fate::Create;
        assert!(handle.is_resolved());
        handle.fate = Fate::Map;
        assert!(!handle.is_resolved());
        handle.id = Some("store-0".into());
        assert!(handle.is_resolved());
    }

    #[test]
    fn search_tracks_token_resolution() {
        let mut search = Search::new("Find My Friends");
        assert!(search.is_valid());
        assert!(!search.is_resolved());
        assert!(search.resolve_token("find"));
        assert!(search.resolve_token("MY"));
        assert!(!search.resolve_token("strangers"));
        assert!(search.resolve_token("friends"));
        assert!(search.is_resolved());
        assert!(search.is_valid());
    }
}
