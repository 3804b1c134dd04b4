//! Layer 3: Entity CRDT
//!
//! A record whose fields are singleton or collection CRDTs over primitive
//! values. Operations target exactly one field; the causal guard runs
//! against the entity-level version map, which every field shares.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::set::SetData;
use super::version::{Actor, VersionMap};
use super::{CrdtChange, CrdtError, CrdtModel, MergeOutcome};
use crate::schema::{Entity, ReferenceId, SchemaValue};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    pub singletons: BTreeMap<String, SetData<SchemaValue>>,
    pub collections: BTreeMap<String, SetData<SchemaValue>>,
    pub version: VersionMap,
}

impl EntityData {
    pub fn new(
        singleton_fields: impl IntoIterator<Item = String>,
        collection_fields: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            singletons: singleton_fields
                .into_iter()
                .map(|name| (name, SetData::new()))
                .collect(),
            collections: collection_fields
                .into_iter()
                .map(|name| (name, SetData::new()))
                .collect(),
            version: VersionMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.singletons.values().all(SetData::is_empty)
            && self.collections.values().all(SetData::is_empty)
    }
}

/// Materialized (bookkeeping-free) entity state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityView {
    pub singletons: BTreeMap<String, Option<SchemaValue>>,
    pub collections: BTreeMap<String, BTreeSet<SchemaValue>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityOperation {
    SetSingleton {
        field: String,
        value: SchemaValue,
        actor: Actor,
        clock: VersionMap,
    },
    ClearSingleton {
        field: String,
        actor: Actor,
        clock: VersionMap,
    },
    AddToCollection {
        field: String,
        value: SchemaValue,
        actor: Actor,
        clock: VersionMap,
    },
    RemoveFromCollection {
        field: String,
        value: SchemaValue,
        actor: Actor,
        clock: VersionMap,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CrdtEntity {
    data: EntityData,
}

impl CrdtEntity {
    pub fn new(
        singleton_fields: impl IntoIterator<Item = String>,
        collection_fields: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            data: EntityData::new(singleton_fields, collection_fields),
        }
    }

    /// Build a full entity model with every field written at `actor`'s
    /// event `version`. This is the shape a reference-mode store pushes
    /// into its backing family.
    pub fn model_from_entity(entity: &Entity, actor: &Actor, version: u64) -> EntityData {
        let clock = VersionMap::of([(actor.clone(), version)]);
        let mut data = EntityData::new(
            entity.singletons.keys().cloned(),
            entity.collections.keys().cloned(),
        );
        for (field, value) in &entity.singletons {
            data.singletons
                .get_mut(field)
                .expect("field created above")
                .force_add(&clock, value.clone());
        }
        for (field, values) in &entity.collections {
            let set = data
                .collections
                .get_mut(field)
                .expect("field created above");
            for value in values {
                set.force_add(&clock, value.clone());
            }
        }
        data.version = clock;
        data
    }

    /// Materialize the particle-facing entity under `id`.
    pub fn materialize(&self, id: ReferenceId) -> Entity {
        let view = self.particle_view();
        let mut entity = Entity::new(id);
        for (field, value) in view.singletons {
            if let Some(value) = value {
                entity.singletons.insert(field, value);
            }
        }
        entity.collections = view.collections;
        entity
    }

    /// An op is the actor's next entity-level event, claiming no unseen
    /// knowledge of other actors.
    fn write_connects(&self, actor: &Actor, clock: &VersionMap) -> bool {
        if clock.get(actor) != self.data.version.get(actor) + 1 {
            return false;
        }
        clock
            .iter()
            .all(|(a, n)| a == actor || n <= self.data.version.get(a))
    }
}

impl CrdtModel for CrdtEntity {
    type Data = EntityData;
    type Operation = EntityOperation;
    type View = EntityView;

    fn from_data(data: EntityData) -> Self {
        Self { data }
    }

    fn data(&self) -> &EntityData {
        &self.data
    }

    fn apply_operation(&mut self, op: &EntityOperation) -> bool {
        match op {
            EntityOperation::SetSingleton {
                field,
                value,
                actor,
                clock,
            } => {
                if !self.write_connects(actor, clock) {
                    return false;
                }
                let Some(state) = self.data.singletons.get_mut(field) else {
                    return false;
                };
                let keep = crate::crdt::Referenceable::unique_id(value);
                state.force_add(clock, value.clone());
                state.remove_dominated(clock, Some(&keep));
                self.data.version.merge_in(clock);
                true
            }
            EntityOperation::ClearSingleton { clock, .. } if !self.data.version.dominates(clock) => {
                false
            }
            EntityOperation::ClearSingleton { field, clock, .. } => {
                let Some(state) = self.data.singletons.get_mut(field) else {
                    return false;
                };
                state.remove_dominated(clock, None)
            }
            EntityOperation::AddToCollection {
                field,
                value,
                actor,
                clock,
            } => {
                if !self.write_connects(actor, clock) {
                    return false;
                }
                let Some(state) = self.data.collections.get_mut(field) else {
                    return false;
                };
                state.force_add(clock, value.clone());
                self.data.version.merge_in(clock);
                true
            }
            EntityOperation::RemoveFromCollection {
                field,
                value,
                clock,
                ..
            } => {
                if !self.data.version.dominates(clock) {
                    return false;
                }
                let Some(state) = self.data.collections.get_mut(field) else {
                    return false;
                };
                state.force_remove(clock, &crate::crdt::Referenceable::unique_id(value))
            }
        }
    }

    fn merge(
        &mut self,
        other: &EntityData,
    ) -> Result<MergeOutcome<EntityOperation, EntityData>, CrdtError> {
        for (field, state) in &other.singletons {
            self.data
                .singletons
                .entry(field.clone())
                .or_default()
                .join_in(state);
        }
        for (field, state) in &other.collections {
            self.data
                .collections
                .entry(field.clone())
                .or_default()
                .join_in(state);
        }
        self.data.version.merge_in(&other.version);
        Ok(MergeOutcome {
            model_change: CrdtChange::Model(self.data.clone()),
            other_change: CrdtChange::Model(self.data.clone()),
        })
    }

    fn particle_view(&self) -> EntityView {
        let singletons = self
            .data
            .singletons
            .iter()
            .map(|(field, state)| {
                let winner = state
                    .elements()
                    .max_by(|a, b| {
                        a.clock
                            .total_cmp(&b.clock)
                            .then_with(|| a.value.cmp(&b.value))
                    })
                    .map(|entry| entry.value.clone());
                (field.clone(), winner)
            })
            .collect();
        let collections = self
            .data
            .collections
            .iter()
            .map(|(field, state)| {
                (
                    field.clone(),
                    state.elements().map(|entry| entry.value.clone()).collect(),
                )
            })
            .collect();
        EntityView {
            singletons,
            collections,
        }
    }
}
