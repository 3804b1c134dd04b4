//! Layer 1: Count CRDT
//!
//! Per-actor non-negative counters with a per-actor version guard. An
//! increment names the version interval it advances (`from` -> `to`), so
//! duplicates and out-of-order deliveries are detected without history.
//!
//! Merge emits exact two-sided operation lists: each side receives the
//! `MultiIncrement`s that lift it to the merged state. Divergence (a larger
//! value without a larger version) is unreconcilable and raises.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::version::Actor;
use super::{CrdtChange, CrdtError, CrdtModel, MergeOutcome};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountData {
    pub values: BTreeMap<Actor, u64>,
    pub version: BTreeMap<Actor, u64>,
}

impl CountData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value_of(&self, actor: &Actor) -> u64 {
        self.values.get(actor).copied().unwrap_or(0)
    }

    pub fn version_of(&self, actor: &Actor) -> u64 {
        self.version.get(actor).copied().unwrap_or(0)
    }

    /// Particle-visible value: the sum over all actors.
    pub fn total(&self) -> u64 {
        self.values.values().sum()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CountOperation {
    Increment {
        actor: Actor,
        from: u64,
    },
    MultiIncrement {
        actor: Actor,
        from: u64,
        to: u64,
        value: u64,
    },
}

impl CountOperation {
    /// (actor, from, to, value) with Increment desugared.
    fn parts(&self) -> (&Actor, u64, u64, u64) {
        match self {
            CountOperation::Increment { actor, from } => (actor, *from, *from + 1, 1),
            CountOperation::MultiIncrement {
                actor,
                from,
                to,
                value,
            } => (actor, *from, *to, *value),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdtCount {
    data: CountData,
}

impl CrdtCount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience: build the next valid increment for `actor`.
    pub fn increment_op(&self, actor: &Actor) -> CountOperation {
        CountOperation::Increment {
            actor: actor.clone(),
            from: self.data.version_of(actor),
        }
    }
}

impl CrdtModel for CrdtCount {
    type Data = CountData;
    type Operation = CountOperation;
    type View = u64;

    fn from_data(data: CountData) -> Self {
        Self { data }
    }

    fn data(&self) -> &CountData {
        &self.data
    }

    fn apply_operation(&mut self, op: &CountOperation) -> bool {
        let (actor, from, to, value) = op.parts();
        if to <= from || value == 0 {
            return false;
        }
        if self.data.version_of(actor) != from {
            return false;
        }
        *self.data.values.entry(actor.clone()).or_insert(0) += value;
        self.data.version.insert(actor.clone(), to);
        true
    }

    fn merge(
        &mut self,
        other: &CountData,
    ) -> Result<MergeOutcome<CountOperation, CountData>, CrdtError> {
        let mut this_changes = Vec::new();
        let mut other_changes = Vec::new();

        let actors: BTreeSet<Actor> = self
            .data
            .values
            .keys()
            .chain(other.values.keys())
            .cloned()
            .collect();

        for actor in actors {
            let this_value = self.data.value_of(&actor);
            let this_version = self.data.version_of(&actor);
            let other_value = other.value_of(&actor);
            let other_version = other.version_of(&actor);

            if this_value == other_value && this_version == other_version {
                continue;
            }

            if this_value > other_value {
                if this_version <= other_version {
                    return Err(CrdtError::Divergence {
                        detail: format!(
                            "actor {actor}: value {this_value} > {other_value} \
                             but version {this_version} <= {other_version}"
                        ),
                    });
                }
                other_changes.push(CountOperation::MultiIncrement {
                    actor: actor.clone(),
                    from: other_version,
                    to: this_version,
                    value: this_value - other_value,
                });
            } else if other_value > this_value {
                if other_version <= this_version {
                    return Err(CrdtError::Divergence {
                        detail: format!(
                            "actor {actor}: value {other_value} > {this_value} \
                             but version {other_version} <= {this_version}"
                        ),
                    });
                }
                this_changes.push(CountOperation::MultiIncrement {
                    actor: actor.clone(),
                    from: this_version,
                    to: other_version,
                    value: other_value - this_value,
                });
                self.data.values.insert(actor.clone(), other_value);
                self.data.version.insert(actor.clone(), other_version);
            } else {
                // Equal values with unequal versions: there is no value-free
                // operation that could lift either side, so the replicas
                // cannot be reconciled.
                return Err(CrdtError::Divergence {
                    detail: format!(
                        "actor {actor}: equal value {this_value} with versions \
                         {this_version} != {other_version}"
                    ),
                });
            }
        }

        Ok(MergeOutcome {
            model_change: CrdtChange::Operations(this_changes),
            other_change: CrdtChange::Operations(other_changes),
        })
    }

    fn particle_view(&self) -> u64 {
        self.data.total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(name: &str) -> Actor {
        Actor::new(name).unwrap()
    }

    fn multi(name: &str, from: u64, to: u64, value: u64) -> CountOperation {
        CountOperation::MultiIncrement {
            actor: actor(name),
            from,
            to,
            value,
        }
    }

    #[test]
    fn increment_applies_in_order() {
        let mut count = CrdtCount::new();
        let me = actor("me");
        assert!(count.apply_operation(&CountOperation::Increment {
            actor: me.clone(),
            from: 0
        }));
        assert!(count.apply_operation(&CountOperation::Increment {
            actor: me.clone(),
            from: 1
        }));
        assert_eq!(count.particle_view(), 2);
        assert_eq!(count.data().version_of(&me), 2);
    }

    #[test]
    fn out_of_order_and_duplicate_ops_return_false() {
        let mut count = CrdtCount::new();
        let op = CountOperation::Increment {
            actor: actor("me"),
            from: 0,
        };
        assert!(count.apply_operation(&op));
        // Same op again: version has moved past `from`.
        assert!(!count.apply_operation(&op));
        // A gap: from 5 does not connect.
        assert!(!count.apply_operation(&CountOperation::Increment {
            actor: actor("me"),
            from: 5
        }));
        assert_eq!(count.particle_view(), 1);
    }

    #[test]
    fn multi_increment_zero_value_rejected() {
        let mut count = CrdtCount::new();
        assert!(!count.apply_operation(&multi("me", 0, 1, 0)));
        assert_eq!(count.particle_view(), 0);
    }

    #[test]
    fn multi_increment_backwards_interval_rejected() {
        let mut count = CrdtCount::new();
        assert!(!count.apply_operation(&multi("me", 1, 1, 3)));
        assert!(!count.apply_operation(&multi("me", 2, 1, 3)));
    }

    #[test]
    fn merge_emits_single_lift_per_actor() {
        let mut left = CrdtCount::new();
        let mut right = CrdtCount::new();
        assert!(left.apply_operation(&multi("me", 0, 1, 7)));
        assert!(right.apply_operation(&multi("them", 0, 1, 4)));

        let outcome = left.merge(right.data()).unwrap();

        let CrdtChange::Operations(this_ops) = &outcome.model_change else {
            panic!("count merge emits operation lists");
        };
        let CrdtChange::Operations(other_ops) = &outcome.other_change else {
            panic!("count merge emits operation lists");
        };
        assert_eq!(this_ops.len(), 1);
        assert_eq!(other_ops.len(), 1);
        assert_eq!(left.particle_view(), 11);

        // Applying the other-side delta converges the right replica.
        for op in other_ops {
            assert!(right.apply_operation(op));
        }
        assert_eq!(right.data(), left.data());
        assert_eq!(right.particle_view(), 11);
    }

    #[test]
    fn merge_same_actor_divergence_raises() {
        let mut left = CrdtCount::new();
        let mut right = CrdtCount::new();
        assert!(left.apply_operation(&multi("me", 0, 1, 7)));
        assert!(right.apply_operation(&multi("me", 0, 1, 4)));

        let err = left.merge(right.data()).unwrap_err();
        assert!(matches!(err, CrdtError::Divergence { .. }));
    }

    #[test]
    fn merge_equal_value_unequal_version_raises() {
        let mut left = CrdtCount::new();
        let mut right = CrdtCount::new();
        assert!(left.apply_operation(&multi("me", 0, 1, 4)));
        assert!(right.apply_operation(&multi("me", 0, 3, 4)));

        let err = left.merge(right.data()).unwrap_err();
        assert!(matches!(err, CrdtError::Divergence { .. }));
    }

    #[test]
    fn merge_is_noop_for_identical_replicas() {
        let mut left = CrdtCount::new();
        assert!(left.apply_operation(&multi("me", 0, 2, 5)));
        let snapshot = left.data().clone();

        let outcome = left.merge(&snapshot).unwrap();
        assert!(outcome.model_change.is_empty());
        assert!(outcome.other_change.is_empty());
        assert_eq!(left.data(), &snapshot);
    }

    #[test]
    fn version_dominates_after_sparse_multi_increment() {
        let mut count = CrdtCount::new();
        // Version advances further than the value: allowed, `to` only has
        // to exceed `from`.
        assert!(count.apply_operation(&multi("me", 0, 5, 2)));
        assert_eq!(count.data().version_of(&actor("me")), 5);
        assert_eq!(count.particle_view(), 2);
        assert!(!count.apply_operation(&multi("me", 2, 6, 1)));
        assert!(count.apply_operation(&multi("me", 5, 6, 1)));
    }
}
