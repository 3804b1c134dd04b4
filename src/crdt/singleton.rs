//! Layer 2: Singleton CRDT
//!
//! At rest holds zero or one causally-maximal value. Divergent writes keep
//! a set of concurrent candidates; the particle view selects the winner by
//! the total order on clocks (event count, then actor sequence).

use serde::{Deserialize, Serialize};

use super::set::{Referenceable, SetData};
use super::version::{Actor, VersionMap};
use super::{CrdtChange, CrdtError, CrdtModel, MergeOutcome};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(bound(deserialize = "T: Referenceable"))]
pub enum SingletonOperation<T: Referenceable> {
    Set {
        actor: Actor,
        clock: VersionMap,
        value: T,
    },
    Clear {
        actor: Actor,
        clock: VersionMap,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Referenceable"))]
pub struct CrdtSingleton<T: Referenceable> {
    data: SetData<T>,
}

impl<T: Referenceable> Default for CrdtSingleton<T> {
    fn default() -> Self {
        Self {
            data: SetData::new(),
        }
    }
}

impl<T: Referenceable> CrdtSingleton<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> &VersionMap {
        &self.data.version
    }

    /// Convenience: build the set operation carrying `actor`'s next clock.
    pub fn set_op(&self, actor: &Actor, value: T) -> SingletonOperation<T> {
        let mut clock = self.data.version.clone();
        clock.bump(actor);
        SingletonOperation::Set {
            actor: actor.clone(),
            clock,
            value,
        }
    }

    pub fn clear_op(&self, actor: &Actor) -> SingletonOperation<T> {
        SingletonOperation::Clear {
            actor: actor.clone(),
            clock: self.data.version.clone(),
        }
    }
}

impl<T: Referenceable> CrdtModel for CrdtSingleton<T> {
    type Data = SetData<T>;
    type Operation = SingletonOperation<T>;
    type View = Option<T>;

    fn from_data(data: SetData<T>) -> Self {
        Self { data }
    }

    fn data(&self) -> &SetData<T> {
        &self.data
    }

    fn apply_operation(&mut self, op: &SingletonOperation<T>) -> bool {
        match op {
            SingletonOperation::Set {
                actor,
                clock,
                value,
            } => {
                let id = value.unique_id();
                if !self.data.apply_add(actor, clock, value.clone()) {
                    return false;
                }
                // A set displaces everything it causally supersedes;
                // concurrent candidates survive until merged away.
                self.data.remove_dominated(clock, Some(&id));
                true
            }
            SingletonOperation::Clear { clock, .. } => {
                if !self.data.version.dominates(clock) {
                    return false;
                }
                self.data.remove_dominated(clock, None)
            }
        }
    }

    fn merge(
        &mut self,
        other: &SetData<T>,
    ) -> Result<MergeOutcome<SingletonOperation<T>, SetData<T>>, CrdtError> {
        self.data.join_in(other);
        Ok(MergeOutcome {
            model_change: CrdtChange::Model(self.data.clone()),
            other_change: CrdtChange::Model(self.data.clone()),
        })
    }

    /// Deterministic winner among surviving candidates: greatest clock in
    /// the total order, then greatest value.
    fn particle_view(&self) -> Option<T> {
        self.data
            .elements()
            .max_by(|a, b| {
                a.clock
                    .total_cmp(&b.clock)
                    .then_with(|| a.value.cmp(&b.value))
            })
            .map(|entry| entry.value.clone())
    }
}
