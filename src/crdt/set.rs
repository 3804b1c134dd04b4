//! Layer 1: Versioned-value set
//!
//! The raw state shared by Collection and Singleton:
//! - values: Map<element id, {value, clock}> (one causal clock per element)
//! - version: VersionMap (everything this replica has observed)
//!
//! Add inserts the actor's next event; Remove drops an element only when
//! the removal clock dominates every stored clock for it (observed-remove).
//! Join keeps an element present on one side only if the other side has
//! not already observed and removed it.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::version::{Actor, VersionMap};

/// Values stored in a versioned set must expose a stable identity.
///
/// Two elements with the same id are causally the same element; their
/// clocks merge. Identity collisions with differing payloads resolve
/// deterministically through `Ord`.
pub trait Referenceable:
    Clone + Ord + Serialize + DeserializeOwned + std::fmt::Debug
{
    fn unique_id(&self) -> String;
}

impl Referenceable for String {
    fn unique_id(&self) -> String {
        self.clone()
    }
}

/// An element plus the causal clock under which it was last written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue<T> {
    pub value: T,
    pub clock: VersionMap,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Referenceable"))]
pub struct SetData<T: Referenceable> {
    pub values: BTreeMap<String, VersionedValue<T>>,
    pub version: VersionMap,
}

impl<T: Referenceable> Default for SetData<T> {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
            version: VersionMap::new(),
        }
    }
}

/// Shared operation shape: collection add/remove and singleton set/clear
/// all lower onto these primitives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(bound(deserialize = "T: Referenceable"))]
pub enum SetOperation<T: Referenceable> {
    Add {
        actor: Actor,
        clock: VersionMap,
        value: T,
    },
    Remove {
        actor: Actor,
        clock: VersionMap,
        value: T,
    },
}

impl<T: Referenceable> SetData<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.values.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&VersionedValue<T>> {
        self.values.get(id)
    }

    pub fn elements(&self) -> impl Iterator<Item = &VersionedValue<T>> {
        self.values.values()
    }

    /// An add is acceptable when it is the actor's next event and claims no
    /// knowledge beyond what this replica has observed for other actors.
    fn add_connects(&self, actor: &Actor, clock: &VersionMap) -> bool {
        if clock.get(actor) != self.version.get(actor) + 1 {
            return false;
        }
        clock
            .iter()
            .all(|(a, n)| a == actor || n <= self.version.get(a))
    }

    /// A remove carries no new event: its clock must already be observed.
    fn remove_connects(&self, clock: &VersionMap) -> bool {
        self.version.dominates(clock)
    }

    pub fn apply_add(&mut self, actor: &Actor, clock: &VersionMap, value: T) -> bool {
        if !self.add_connects(actor, clock) {
            return false;
        }
        self.force_add(clock, value);
        true
    }

    pub fn apply_remove(&mut self, clock: &VersionMap, id: &str) -> bool {
        if !self.remove_connects(clock) {
            return false;
        }
        self.force_remove(clock, id)
    }

    /// Insert without the next-event connectivity check. Entity fields
    /// share the entity-level version map, so the guard runs there and the
    /// field state just absorbs the write.
    pub(crate) fn force_add(&mut self, clock: &VersionMap, value: T) {
        self.version.merge_in(clock);
        let id = value.unique_id();
        match self.values.get_mut(&id) {
            Some(existing) => {
                existing.clock.merge_in(clock);
                if value.cmp(&existing.value) == Ordering::Greater {
                    existing.value = value;
                }
            }
            None => {
                self.values.insert(
                    id,
                    VersionedValue {
                        value,
                        clock: clock.clone(),
                    },
                );
            }
        }
    }

    /// Remove `id` if `clock` dominates its stored clock.
    pub(crate) fn force_remove(&mut self, clock: &VersionMap, id: &str) -> bool {
        let Some(existing) = self.values.get(id) else {
            return false;
        };
        if !clock.dominates(&existing.clock) {
            return false;
        }
        self.values.remove(id);
        true
    }

    /// Drop every element whose clock is dominated by `clock`, except the
    /// element with `keep_id`. Used by singleton set/clear.
    pub fn remove_dominated(&mut self, clock: &VersionMap, keep_id: Option<&str>) -> bool {
        let doomed: Vec<String> = self
            .values
            .iter()
            .filter(|(id, entry)| {
                keep_id != Some(id.as_str()) && clock.dominates(&entry.clock)
            })
            .map(|(id, _)| id.clone())
            .collect();
        let changed = !doomed.is_empty();
        for id in doomed {
            self.values.remove(&id);
        }
        changed
    }

    /// Merge `other` into self. Elements present on one side only survive
    /// when the other side has not already observed them (their clock is
    /// not dominated by the other side's version); otherwise absence means
    /// removal.
    pub fn join_in(&mut self, other: &Self) {
        let mut merged: BTreeMap<String, VersionedValue<T>> = BTreeMap::new();

        for (id, entry) in &self.values {
            match other.values.get(id) {
                Some(other_entry) => {
                    let mut clock = entry.clock.clone();
                    clock.merge_in(&other_entry.clock);
                    let value = if other_entry.value.cmp(&entry.value) == Ordering::Greater {
                        other_entry.value.clone()
                    } else {
                        entry.value.clone()
                    };
                    merged.insert(id.clone(), VersionedValue { value, clock });
                }
                None => {
                    if !other.version.dominates(&entry.clock) {
                        merged.insert(id.clone(), entry.clone());
                    }
                }
            }
        }
        for (id, entry) in &other.values {
            if self.values.contains_key(id) {
                continue;
            }
            if !self.version.dominates(&entry.clock) {
                merged.insert(id.clone(), entry.clone());
            }
        }

        self.values = merged;
        self.version.merge_in(&other.version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(name: &str) -> Actor {
        Actor::new(name).unwrap()
    }

    fn vm(entries: &[(&str, u64)]) -> VersionMap {
        VersionMap::of(entries.iter().map(|(a, n)| (actor(a), *n)))
    }

    #[test]
    fn add_requires_next_event() {
        let mut set: SetData<String> = SetData::new();
        let me = actor("me");
        assert!(set.apply_add(&me, &vm(&[("me", 1)]), "x".to_string()));
        // Replay and gap both fail.
        assert!(!set.apply_add(&me, &vm(&[("me", 1)]), "y".to_string()));
        assert!(!set.apply_add(&me, &vm(&[("me", 3)]), "y".to_string()));
        assert!(set.apply_add(&me, &vm(&[("me", 2)]), "y".to_string()));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn add_rejects_unseen_foreign_knowledge() {
        let mut set: SetData<String> = SetData::new();
        // Claims to have seen them:1, but this replica has not.
        assert!(!set.apply_add(
            &actor("me"),
            &vm(&[("me", 1), ("them", 1)]),
            "x".to_string()
        ));
    }

    #[test]
    fn remove_requires_domination_of_element_clock() {
        let mut set: SetData<String> = SetData::new();
        set.apply_add(&actor("a"), &vm(&[("a", 1)]), "x".to_string());
        set.apply_add(&actor("b"), &vm(&[("b", 1)]), "x".to_string());

        // Clock covering only a's write cannot remove the element.
        assert!(!set.apply_remove(&vm(&[("a", 1)]), "x"));
        assert!(set.contains_id("x"));

        assert!(set.apply_remove(&vm(&[("a", 1), ("b", 1)]), "x"));
        assert!(!set.contains_id("x"));
    }

    #[test]
    fn remove_of_unseen_clock_fails() {
        let mut set: SetData<String> = SetData::new();
        set.apply_add(&actor("a"), &vm(&[("a", 1)]), "x".to_string());
        // The remove claims b:1 which this replica has not observed.
        assert!(!set.apply_remove(&vm(&[("a", 1), ("b", 1)]), "x"));
    }

    #[test]
    fn join_preserves_concurrent_add_and_honors_observed_remove() {
        let mut left: SetData<String> = SetData::new();
        let mut right: SetData<String> = SetData::new();

        left.apply_add(&actor("a"), &vm(&[("a", 1)]), "kept".to_string());
        right.apply_add(&actor("b"), &vm(&[("b", 1)]), "removed".to_string());

        // Left observes right's element, then removes it.
        left.join_in(&right.clone());
        assert!(left.apply_remove(&vm(&[("b", 1)]), "removed"));

        // Now join back: right must lose "removed" (left observed it),
        // while "kept" (concurrent to right) survives.
        right.join_in(&left);
        assert!(!right.contains_id("removed"));
        assert!(right.contains_id("kept"));
    }

    #[test]
    fn join_is_commutative_and_idempotent() {
        let mut a: SetData<String> = SetData::new();
        let mut b: SetData<String> = SetData::new();
        a.apply_add(&actor("a"), &vm(&[("a", 1)]), "one".to_string());
        b.apply_add(&actor("b"), &vm(&[("b", 1)]), "two".to_string());

        let mut ab = a.clone();
        ab.join_in(&b);
        let mut ba = b.clone();
        ba.join_in(&a);
        assert_eq!(ab, ba);

        let mut aa = a.clone();
        aa.join_in(&a.clone());
        assert_eq!(aa, a);
    }

    #[test]
    fn same_id_collision_resolves_deterministically() {
        // Two replicas write different payloads under one id; both joins
        // must pick the same winner.
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
        struct Tagged {
            id: String,
            payload: String,
        }
        impl Referenceable for Tagged {
            fn unique_id(&self) -> String {
                self.id.clone()
            }
        }

        let mut a: SetData<Tagged> = SetData::new();
        let mut b: SetData<Tagged> = SetData::new();
        a.apply_add(
            &actor("a"),
            &vm(&[("a", 1)]),
            Tagged {
                id: "x".into(),
                payload: "alpha".into(),
            },
        );
        b.apply_add(
            &actor("b"),
            &vm(&[("b", 1)]),
            Tagged {
                id: "x".into(),
                payload: "beta".into(),
            },
        );

        let mut ab = a.clone();
        ab.join_in(&b);
        let mut ba = b.clone();
        ba.join_in(&a);
        assert_eq!(ab, ba);
        assert_eq!(ab.get("x").unwrap().value.payload, "beta");
    }
}
