//! Layer 0: Causality primitives
//!
//! Actor: replica self-identification.
//! VersionMap: actor -> counter mapping establishing causal order.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::CrdtError;

/// Actor identifier - non-empty string.
///
/// Replicas name themselves. No validation beyond non-empty.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(String);

impl Actor {
    pub fn new(s: impl Into<String>) -> Result<Self, CrdtError> {
        let s = s.into();
        if s.is_empty() {
            Err(CrdtError::EmptyActor)
        } else {
            Ok(Self(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Actor({:?})", self.0)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of comparing two version maps under the causal partial order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CausalOrder {
    Equal,
    /// Left strictly dominates right.
    Dominates,
    /// Left is strictly dominated by right.
    DominatedBy,
    Concurrent,
}

/// Version vector: actor -> event counter, missing key == 0.
///
/// Partial order: `u <= v` iff every actor's counter in `u` is <= the
/// counter in `v`. Two maps where neither dominates are concurrent.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionMap {
    entries: BTreeMap<Actor, u64>,
}

impl VersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(entries: impl IntoIterator<Item = (Actor, u64)>) -> Self {
        Self {
            entries: entries.into_iter().filter(|(_, n)| *n > 0).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, actor: &Actor) -> u64 {
        self.entries.get(actor).copied().unwrap_or(0)
    }

    pub fn set(&mut self, actor: Actor, count: u64) {
        if count == 0 {
            self.entries.remove(&actor);
        } else {
            self.entries.insert(actor, count);
        }
    }

    /// Advance the actor's counter by one, returning the new value.
    pub fn bump(&mut self, actor: &Actor) -> u64 {
        let entry = self.entries.entry(actor.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn actors(&self) -> impl Iterator<Item = &Actor> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Actor, u64)> {
        self.entries.iter().map(|(a, n)| (a, *n))
    }

    /// True iff `other <= self` pointwise.
    pub fn dominates(&self, other: &Self) -> bool {
        other
            .entries
            .iter()
            .all(|(actor, count)| self.get(actor) >= *count)
    }

    pub fn causal_cmp(&self, other: &Self) -> CausalOrder {
        let forward = self.dominates(other);
        let backward = other.dominates(self);
        match (forward, backward) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::Dominates,
            (false, true) => CausalOrder::DominatedBy,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    /// Pointwise max merge. Returns true if any entry changed.
    pub fn merge_in(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (actor, count) in &other.entries {
            let entry = self.entries.entry(actor.clone()).or_insert(0);
            if *count > *entry {
                *entry = *count;
                changed = true;
            }
        }
        changed
    }

    pub fn merged(a: &Self, b: &Self) -> Self {
        let mut out = a.clone();
        out.merge_in(b);
        out
    }

    /// Total order used for deterministic winner selection: event count
    /// first, then the (actor, counter) sequence lexicographically. Ties
    /// beyond that are identical maps.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        let self_total: u64 = self.entries.values().sum();
        let other_total: u64 = other.entries.values().sum();
        self_total
            .cmp(&other_total)
            .then_with(|| self.entries.iter().cmp(other.entries.iter()))
    }
}

impl FromIterator<(Actor, u64)> for VersionMap {
    fn from_iter<I: IntoIterator<Item = (Actor, u64)>>(iter: I) -> Self {
        Self::of(iter)
    }
}
