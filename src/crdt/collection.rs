//! Layer 2: Collection CRDT
//!
//! Observed-remove collection over [`SetData`]. Every element carries the
//! clock of its latest add; removal requires having observed all of them.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::set::{Referenceable, SetData, SetOperation};
use super::version::{Actor, VersionMap};
use super::{CrdtChange, CrdtError, CrdtModel, MergeOutcome};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Referenceable"))]
pub struct CrdtCollection<T: Referenceable> {
    data: SetData<T>,
}

impl<T: Referenceable> Default for CrdtCollection<T> {
    fn default() -> Self {
        Self {
            data: SetData::new(),
        }
    }
}

impl<T: Referenceable> CrdtCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> &VersionMap {
        &self.data.version
    }

    /// Convenience: build the add operation carrying `actor`'s next clock.
    pub fn add_op(&self, actor: &Actor, value: T) -> SetOperation<T> {
        let mut clock = self.data.version.clone();
        clock.bump(actor);
        SetOperation::Add {
            actor: actor.clone(),
            clock,
            value,
        }
    }

    /// Convenience: build a remove operation over the current version.
    pub fn remove_op(&self, actor: &Actor, value: T) -> SetOperation<T> {
        SetOperation::Remove {
            actor: actor.clone(),
            clock: self.data.version.clone(),
            value,
        }
    }
}

impl<T: Referenceable> CrdtModel for CrdtCollection<T> {
    type Data = SetData<T>;
    type Operation = SetOperation<T>;
    type View = BTreeSet<T>;

    fn from_data(data: SetData<T>) -> Self {
        Self { data }
    }

    fn data(&self) -> &SetData<T> {
        &self.data
    }

    fn apply_operation(&mut self, op: &SetOperation<T>) -> bool {
        match op {
            SetOperation::Add {
                actor,
                clock,
                value,
            } => self.data.apply_add(actor, clock, value.clone()),
            SetOperation::Remove { clock, value, .. } => {
                self.data.apply_remove(clock, &value.unique_id())
            }
        }
    }

    fn merge(
        &mut self,
        other: &SetData<T>,
    ) -> Result<MergeOutcome<SetOperation<T>, SetData<T>>, CrdtError> {
        self.data.join_in(other);
        Ok(MergeOutcome {
            model_change: CrdtChange::Model(self.data.clone()),
            other_change: CrdtChange::Model(self.data.clone()),
        })
    }

    fn particle_view(&self) -> BTreeSet<T> {
        self.data
            .elements()
            .map(|entry| entry.value.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(name: &str) -> Actor {
        Actor::new(name).unwrap()
    }

    #[test]
    fn add_then_remove_round_trip() {
        let mut coll: CrdtCollection<String> = CrdtCollection::new();
        let me = actor("me");
        let add = coll.add_op(&me, "alpha".to_string());
        assert!(coll.apply_operation(&add));
        assert!(coll.particle_view().contains("alpha"));

        let remove = coll.remove_op(&me, "alpha".to_string());
        assert!(coll.apply_operation(&remove));
        assert!(coll.particle_view().is_empty());
    }

    #[test]
    fn concurrent_add_survives_remove_based_on_older_view() {
        let mut left: CrdtCollection<String> = CrdtCollection::new();
        let mut right: CrdtCollection<String> = CrdtCollection::new();

        let add_left = left.add_op(&actor("a"), "x".to_string());
        assert!(left.apply_operation(&add_left));
        let add_right = right.add_op(&actor("b"), "x".to_string());
        assert!(right.apply_operation(&add_right));

        // Right removes based only on its own add.
        let remove = right.remove_op(&actor("b"), "x".to_string());
        assert!(right.apply_operation(&remove));

        left.merge(right.data()).unwrap();
        // Left's concurrent add was never observed by the remove.
        assert!(left.particle_view().contains("x"));
    }

    #[test]
    fn merge_exchanging_model_deltas_converges() {
        let mut left: CrdtCollection<String> = CrdtCollection::new();
        let mut right: CrdtCollection<String> = CrdtCollection::new();
        let add_left = left.add_op(&actor("a"), "one".to_string());
        left.apply_operation(&add_left);
        let add_right = right.add_op(&actor("b"), "two".to_string());
        right.apply_operation(&add_right);

        let outcome = left.merge(right.data()).unwrap();
        let CrdtChange::Model(for_other) = outcome.other_change else {
            panic!("set merges emit model deltas");
        };
        right.merge(&for_other).unwrap();

        assert_eq!(left.data(), right.data());
        assert_eq!(left.particle_view().len(), 2);
    }
}
