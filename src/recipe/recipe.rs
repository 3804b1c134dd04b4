//! The recipe aggregate.
//!
//! Arena-allocated: nodes live in vectors and reference each other by
//! index, so deep copies are a table walk and canonical reordering is a
//! permutation of the arenas. `normalize` consumes the mutable recipe and
//! returns the frozen form; an invalid recipe comes back untouched with
//! its error map.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Range;

use sha2::{Digest, Sha256};

use crate::config::OrphanSlotPolicy;

use super::compare::{compare_comparables, Comparable};
use super::node::{
    ConnectionConstraint, Direction, Handle, HandleConnection, Obligation, Particle, Search, Slot,
    SlotConnection,
};
use super::RecipeErrors;

macro_rules! arena_index {
    ($name:ident) => {
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
        )]
        pub struct $name(pub(crate) usize);

        impl $name {
            pub fn as_usize(self) -> usize {
                self.0
            }
        }
    };
}

arena_index!(ParticleIndex);
arena_index!(HandleIndex);
arena_index!(SlotIndex);
arena_index!(HandleConnectionIndex);
arena_index!(SlotConnectionIndex);

/// Mutable recipe under construction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Recipe {
    pub name: Option<String>,
    policy: OrphanSlotPolicy,
    particles: Vec<Particle>,
    handles: Vec<Handle>,
    slots: Vec<Slot>,
    handle_connections: Vec<HandleConnection>,
    slot_connections: Vec<SlotConnection>,
    constraints: Vec<ConnectionConstraint>,
    obligations: Vec<Obligation>,
    verbs: Vec<String>,
    patterns: Vec<String>,
    search: Option<Search>,
}

/// Normalization refusal: the recipe comes back untouched.
#[derive(Debug)]
pub struct NormalizeFailure {
    pub recipe: Recipe,
    pub errors: RecipeErrors,
}

impl Recipe {
    pub fn new(name: Option<String>) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    pub fn with_policy(name: Option<String>, policy: OrphanSlotPolicy) -> Self {
        Self {
            name,
            policy,
            ..Self::default()
        }
    }

    // -- construction ----------------------------------------------------

    pub fn add_particle(&mut self, name: impl Into<String>) -> ParticleIndex {
        self.particles.push(Particle {
            name: name.into(),
            ..Particle::default()
        });
        ParticleIndex(self.particles.len() - 1)
    }

    pub fn add_handle(&mut self) -> HandleIndex {
        self.handles.push(Handle::default());
        HandleIndex(self.handles.len() - 1)
    }

    pub fn add_slot(&mut self) -> SlotIndex {
        self.slots.push(Slot::default());
        SlotIndex(self.slots.len() - 1)
    }

    pub fn add_handle_connection(
        &mut self,
        particle: ParticleIndex,
        name: impl Into<String>,
    ) -> HandleConnectionIndex {
        self.handle_connections.push(HandleConnection {
            particle,
            name: name.into(),
            ..HandleConnection::default()
        });
        let index = HandleConnectionIndex(self.handle_connections.len() - 1);
        self.particles[particle.0].connections.push(index);
        index
    }

    /// Bind a connection to a handle (both directions of the edge).
    pub fn connect_handle(&mut self, connection: HandleConnectionIndex, handle: HandleIndex) {
        self.handle_connections[connection.0].handle = Some(handle);
        self.handles[handle.0].connections.push(connection);
    }

    pub fn add_slot_connection(
        &mut self,
        particle: ParticleIndex,
        name: impl Into<String>,
    ) -> SlotConnectionIndex {
        self.slot_connections.push(SlotConnection {
            particle,
            name: name.into(),
            ..SlotConnection::default()
        });
        let index = SlotConnectionIndex(self.slot_connections.len() - 1);
        self.particles[particle.0].slot_connections.push(index);
        index
    }

    pub fn connect_slot(&mut self, connection: SlotConnectionIndex, slot: SlotIndex) {
        self.slot_connections[connection.0].target_slot = Some(slot);
        self.slots[slot.0].consumers.push(connection);
    }

    /// Declare that `connection` provides `slot` under `name`.
    pub fn provide_slot(
        &mut self,
        connection: SlotConnectionIndex,
        name: impl Into<String>,
        slot: SlotIndex,
    ) {
        self.slot_connections[connection.0]
            .provided_slots
            .insert(name.into(), slot);
        self.slots[slot.0].source_connection = Some(connection);
    }

    pub fn set_search(&mut self, phrase: impl Into<String>) {
        self.search = Some(Search::new(phrase));
    }

    pub fn add_constraint(&mut self, constraint: ConnectionConstraint) {
        self.constraints.push(constraint);
    }

    pub fn add_obligation(&mut self, description: impl Into<String>) {
        self.obligations.push(Obligation {
            description: description.into(),
        });
    }

    pub fn add_verb(&mut self, verb: impl Into<String>) {
        self.verbs.push(verb.into());
    }

    pub fn add_pattern(&mut self, pattern: impl Into<String>) {
        self.patterns.push(pattern.into());
    }

    // -- access ----------------------------------------------------------

    pub fn particle(&self, index: ParticleIndex) -> &Particle {
        &self.particles[index.0]
    }

    pub fn particle_mut(&mut self, index: ParticleIndex) -> &mut Particle {
        &mut self.particles[index.0]
    }

    pub fn handle(&self, index: HandleIndex) -> &Handle {
        &self.handles[index.0]
    }

    pub fn handle_mut(&mut self, index: HandleIndex) -> &mut Handle {
        &mut self.handles[index.0]
    }

    pub fn slot(&self, index: SlotIndex) -> &Slot {
        &self.slots[index.0]
    }

    pub fn slot_mut(&mut self, index: SlotIndex) -> &mut Slot {
        &mut self.slots[index.0]
    }

    pub fn handle_connection(&self, index: HandleConnectionIndex) -> &HandleConnection {
        &self.handle_connections[index.0]
    }

    pub fn handle_connection_mut(
        &mut self,
        index: HandleConnectionIndex,
    ) -> &mut HandleConnection {
        &mut self.handle_connections[index.0]
    }

    pub fn slot_connection(&self, index: SlotConnectionIndex) -> &SlotConnection {
        &self.slot_connections[index.0]
    }

    pub fn slot_connection_mut(&mut self, index: SlotConnectionIndex) -> &mut SlotConnection {
        &mut self.slot_connections[index.0]
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn handles(&self) -> &[Handle] {
        &self.handles
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn search(&self) -> Option<&Search> {
        self.search.as_ref()
    }

    pub fn search_mut(&mut self) -> Option<&mut Search> {
        self.search.as_mut()
    }

    pub fn constraints(&self) -> &[ConnectionConstraint] {
        &self.constraints
    }

    pub fn obligations(&self) -> &[Obligation] {
        &self.obligations
    }

    // -- validity --------------------------------------------------------

    /// Structural validity. When an error map is supplied, every failure
    /// is recorded under a node label; the check itself never mutates.
    pub fn is_valid(&self, mut errors: Option<&mut RecipeErrors>) -> bool {
        let mut valid = true;
        let record = |errors: &mut Option<&mut RecipeErrors>, label: String, message: String| {
            if let Some(map) = errors.as_deref_mut() {
                map.insert(label, message);
            }
        };

        let mut seen_handle_ids = BTreeSet::new();
        for handle in &self.handles {
            if !handle.is_valid() {
                valid = false;
                record(
                    &mut errors,
                    self.handle_label_of(handle),
                    "handle id must not be empty".to_string(),
                );
            }
            if let Some(id) = &handle.id {
                if !seen_handle_ids.insert(id.clone()) {
                    valid = false;
                    record(
                        &mut errors,
                        self.handle_label_of(handle),
                        format!("duplicate handle id '{id}'"),
                    );
                }
            }
        }

        let mut seen_slot_ids = BTreeSet::new();
        for slot in &self.slots {
            if !slot.is_valid() {
                valid = false;
                record(
                    &mut errors,
                    slot_label(slot),
                    "slot id must not be empty".to_string(),
                );
            }
            if let Some(id) = &slot.id {
                if !seen_slot_ids.insert(id.clone()) {
                    valid = false;
                    record(&mut errors, slot_label(slot), format!("duplicate slot id '{id}'"));
                }
            }
            if self.policy == OrphanSlotPolicy::Strict && slot.is_orphan() {
                valid = false;
                record(
                    &mut errors,
                    slot_label(slot),
                    "orphan slot: nothing provides or consumes it".to_string(),
                );
            }
        }

        for particle in &self.particles {
            if !particle.is_valid() {
                valid = false;
                record(
                    &mut errors,
                    format!("particle:{}", particle.name),
                    "particle name must not be empty".to_string(),
                );
            }
        }

        for (index, connection) in self.handle_connections.iter().enumerate() {
            let label = format!(
                "connection:{}.{}",
                self.particles
                    .get(connection.particle.0)
                    .map(|p| p.name.as_str())
                    .unwrap_or("?"),
                connection.name
            );
            if connection.particle.0 >= self.particles.len() {
                valid = false;
                record(&mut errors, label, "connection names a missing particle".to_string());
                continue;
            }
            if let Some(handle) = connection.handle {
                let Some(handle) = self.handles.get(handle.0) else {
                    valid = false;
                    record(&mut errors, label, "connection names a missing handle".to_string());
                    continue;
                };
                if !handle.connections.contains(&HandleConnectionIndex(index)) {
                    valid = false;
                    record(&mut errors, label, "handle does not link back".to_string());
                    continue;
                }
                if let Some(direction) = connection.direction {
                    if !handle.mode.allows(direction.handle_mode()) {
                        valid = false;
                        record(
                            &mut errors,
                            label,
                            format!(
                                "connection mode {} exceeds what the handle permits",
                                direction.as_str()
                            ),
                        );
                    }
                }
            }
        }

        for (index, connection) in self.slot_connections.iter().enumerate() {
            let label = format!(
                "slot-connection:{}.{}",
                self.particles
                    .get(connection.particle.0)
                    .map(|p| p.name.as_str())
                    .unwrap_or("?"),
                connection.name
            );
            if connection.particle.0 >= self.particles.len() {
                valid = false;
                record(&mut errors, label, "slot connection names a missing particle".to_string());
                continue;
            }
            if let Some(target) = connection.target_slot {
                match self.slots.get(target.0) {
                    Some(slot) if slot.consumers.contains(&SlotConnectionIndex(index)) => {}
                    Some(_) => {
                        valid = false;
                        record(
                            &mut errors,
                            label.clone(),
                            "target slot does not link back".to_string(),
                        );
                    }
                    None => {
                        valid = false;
                        record(
                            &mut errors,
                            label.clone(),
                            "slot connection names a missing slot".to_string(),
                        );
                    }
                }
            }
            for (name, provided) in &connection.provided_slots {
                match self.slots.get(provided.0) {
                    Some(slot)
                        if slot.source_connection == Some(SlotConnectionIndex(index)) => {}
                    Some(_) => {
                        valid = false;
                        record(
                            &mut errors,
                            label.clone(),
                            format!("provided slot `{name}` does not link back"),
                        );
                    }
                    None => {
                        valid = false;
                        record(
                            &mut errors,
                            label.clone(),
                            format!("provided slot `{name}` is missing"),
                        );
                    }
                }
            }
        }

        for constraint in &self.constraints {
            if !constraint.is_valid() {
                valid = false;
                record(
                    &mut errors,
                    "constraint".to_string(),
                    "constraint endpoints must be named".to_string(),
                );
            }
        }

        if let Some(search) = &self.search {
            if !search.is_valid() {
                valid = false;
                record(
                    &mut errors,
                    "search".to_string(),
                    "search tokens diverge from the phrase".to_string(),
                );
            }
        }

        valid
    }

    // -- normalization ---------------------------------------------------

    /// Deterministic canonicalization, then freeze. Refuses (returning the
    /// recipe untouched) when invalid. Frozen recipes cannot re-enter:
    /// normalization is terminal by construction.
    pub fn normalize(mut self) -> Result<FrozenRecipe, NormalizeFailure> {
        let mut errors = RecipeErrors::new();
        if !self.is_valid(Some(&mut errors)) {
            return Err(NormalizeFailure {
                recipe: self,
                errors,
            });
        }

        if self.policy == OrphanSlotPolicy::Lenient {
            for slot in self.slots.iter().filter(|slot| slot.is_orphan()) {
                tracing::warn!(slot = %slot_label(slot), "orphan slot tolerated");
            }
        }

        // Phase one: node-local canonical form.
        for particle in &mut self.particles {
            particle.verbs.sort();
            particle.verbs.dedup();
        }
        for handle in &mut self.handles {
            handle.tags.sort();
            handle.tags.dedup();
        }
        for slot in &mut self.slots {
            slot.tags.sort();
            slot.tags.dedup();
        }
        for connection in &mut self.handle_connections {
            connection.tags.sort();
            connection.tags.dedup();
        }
        for connection in &mut self.slot_connections {
            connection.tags.sort();
            connection.tags.dedup();
        }
        self.verbs.sort();
        self.verbs.dedup();
        self.patterns.sort();
        self.patterns.dedup();
        self.constraints.sort();
        self.obligations.sort();
        if let Some(search) = &mut self.search {
            search.normalize();
        }

        // Phase two: global canonical order.
        let mut hc_order: Vec<HandleConnectionIndex> = (0..self.handle_connections.len())
            .map(HandleConnectionIndex)
            .collect();
        hc_order.sort_by(|a, b| {
            compare_comparables(&self.handle_connection_key(*a), &self.handle_connection_key(*b))
        });

        let mut sc_order: Vec<SlotConnectionIndex> = (0..self.slot_connections.len())
            .map(SlotConnectionIndex)
            .collect();
        sc_order.sort_by(|a, b| {
            compare_comparables(&self.slot_connection_key(*a), &self.slot_connection_key(*b))
        });

        // Particles ordered by first appearance in the sorted connection
        // list; orphans appended by comparator.
        let mut particle_order: Vec<ParticleIndex> = Vec::new();
        for index in &hc_order {
            let particle = self.handle_connections[index.0].particle;
            if !particle_order.contains(&particle) {
                particle_order.push(particle);
            }
        }
        let mut orphan_particles: Vec<ParticleIndex> = (0..self.particles.len())
            .map(ParticleIndex)
            .filter(|index| !particle_order.contains(index))
            .collect();
        orphan_particles
            .sort_by(|a, b| compare_comparables(&self.particle_key(*a), &self.particle_key(*b)));
        particle_order.extend(orphan_particles);

        // Handles analogously.
        let mut handle_order: Vec<HandleIndex> = Vec::new();
        for index in &hc_order {
            if let Some(handle) = self.handle_connections[index.0].handle {
                if !handle_order.contains(&handle) {
                    handle_order.push(handle);
                }
            }
        }
        let mut orphan_handles: Vec<HandleIndex> = (0..self.handles.len())
            .map(HandleIndex)
            .filter(|index| !handle_order.contains(index))
            .collect();
        orphan_handles
            .sort_by(|a, b| compare_comparables(&self.handle_key(*a), &self.handle_key(*b)));
        handle_order.extend(orphan_handles);

        // Slots: consumed targets in slot-connection order, each provided
        // slot directly after its producing connection.
        let mut slot_order: Vec<SlotIndex> = Vec::new();
        for index in &sc_order {
            let connection = &self.slot_connections[index.0];
            if let Some(target) = connection.target_slot {
                if !slot_order.contains(&target) {
                    slot_order.push(target);
                }
            }
            for provided in connection.provided_slots.values() {
                if !slot_order.contains(provided) {
                    slot_order.push(*provided);
                }
            }
        }
        let mut orphan_slots: Vec<SlotIndex> = (0..self.slots.len())
            .map(SlotIndex)
            .filter(|index| !slot_order.contains(index))
            .collect();
        orphan_slots.sort_by(|a, b| compare_comparables(&self.slot_key(*a), &self.slot_key(*b)));
        slot_order.extend(orphan_slots);

        let normalized = self.permuted(
            &particle_order,
            &handle_order,
            &slot_order,
            &hc_order,
            &sc_order,
        );
        Ok(FrozenRecipe { inner: normalized })
    }

    /// Rebuild every arena in the given order and rewrite all indices.
    fn permuted(
        &self,
        particle_order: &[ParticleIndex],
        handle_order: &[HandleIndex],
        slot_order: &[SlotIndex],
        hc_order: &[HandleConnectionIndex],
        sc_order: &[SlotConnectionIndex],
    ) -> Recipe {
        let particle_map = inverse(particle_order.iter().map(|index| index.0));
        let handle_map = inverse(handle_order.iter().map(|index| index.0));
        let slot_map = inverse(slot_order.iter().map(|index| index.0));
        let hc_map = inverse(hc_order.iter().map(|index| index.0));
        let sc_map = inverse(sc_order.iter().map(|index| index.0));

        let particles = particle_order
            .iter()
            .map(|index| {
                let particle = &self.particles[index.0];
                let mut connections: Vec<HandleConnectionIndex> = particle
                    .connections
                    .iter()
                    .map(|c| HandleConnectionIndex(hc_map[&c.0]))
                    .collect();
                connections.sort();
                let mut slot_connections: Vec<SlotConnectionIndex> = particle
                    .slot_connections
                    .iter()
                    .map(|c| SlotConnectionIndex(sc_map[&c.0]))
                    .collect();
                slot_connections.sort();
                Particle {
                    name: particle.name.clone(),
                    local_name: particle.local_name.clone(),
                    verbs: particle.verbs.clone(),
                    connections,
                    slot_connections,
                }
            })
            .collect();

        let handles = handle_order
            .iter()
            .map(|index| {
                let handle = &self.handles[index.0];
                let mut connections: Vec<HandleConnectionIndex> = handle
                    .connections
                    .iter()
                    .map(|c| HandleConnectionIndex(hc_map[&c.0]))
                    .collect();
                connections.sort();
                Handle {
                    id: handle.id.clone(),
                    local_name: handle.local_name.clone(),
                    tags: handle.tags.clone(),
                    fate: handle.fate,
                    ty: handle.ty.clone(),
                    mode: handle.mode,
                    connections,
                }
            })
            .collect();

        let slots = slot_order
            .iter()
            .map(|index| {
                let slot = &self.slots[index.0];
                let mut consumers: Vec<SlotConnectionIndex> = slot
                    .consumers
                    .iter()
                    .map(|c| SlotConnectionIndex(sc_map[&c.0]))
                    .collect();
                consumers.sort();
                Slot {
                    id: slot.id.clone(),
                    name: slot.name.clone(),
                    local_name: slot.local_name.clone(),
                    tags: slot.tags.clone(),
                    source_connection: slot
                        .source_connection
                        .map(|c| SlotConnectionIndex(sc_map[&c.0])),
                    consumers,
                }
            })
            .collect();

        let handle_connections = hc_order
            .iter()
            .map(|index| {
                let connection = &self.handle_connections[index.0];
                HandleConnection {
                    particle: ParticleIndex(particle_map[&connection.particle.0]),
                    name: connection.name.clone(),
                    direction: connection.direction,
                    ty: connection.ty.clone(),
                    tags: connection.tags.clone(),
                    handle: connection.handle.map(|h| HandleIndex(handle_map[&h.0])),
                }
            })
            .collect();

        let slot_connections = sc_order
            .iter()
            .map(|index| {
                let connection = &self.slot_connections[index.0];
                SlotConnection {
                    particle: ParticleIndex(particle_map[&connection.particle.0]),
                    name: connection.name.clone(),
                    tags: connection.tags.clone(),
                    target_slot: connection.target_slot.map(|s| SlotIndex(slot_map[&s.0])),
                    provided_slots: connection
                        .provided_slots
                        .iter()
                        .map(|(name, slot)| (name.clone(), SlotIndex(slot_map[&slot.0])))
                        .collect(),
                }
            })
            .collect();

        Recipe {
            name: self.name.clone(),
            policy: self.policy,
            particles,
            handles,
            slots,
            handle_connections,
            slot_connections,
            constraints: self.constraints.clone(),
            obligations: self.obligations.clone(),
            verbs: self.verbs.clone(),
            patterns: self.patterns.clone(),
            search: self.search.clone(),
        }
    }

    // -- sort keys -------------------------------------------------------

    fn handle_connection_key(&self, index: HandleConnectionIndex) -> Vec<Comparable> {
        let connection = &self.handle_connections[index.0];
        vec![
            // Interface-typed connections sort last.
            Comparable::Flag(connection.is_interface_typed()),
            Comparable::Text(self.particles[connection.particle.0].name.clone()),
            Comparable::Text(connection.name.clone()),
            Comparable::Num(match connection.direction {
                None => 0,
                Some(Direction::Reads) => 1,
                Some(Direction::Writes) => 2,
                Some(Direction::ReadsWrites) => 3,
            }),
        ]
    }

    fn slot_connection_key(&self, index: SlotConnectionIndex) -> Vec<Comparable> {
        let connection = &self.slot_connections[index.0];
        vec![
            Comparable::Text(self.particles[connection.particle.0].name.clone()),
            Comparable::Text(connection.name.clone()),
        ]
    }

    fn particle_key(&self, index: ParticleIndex) -> Vec<Comparable> {
        let particle = &self.particles[index.0];
        vec![
            Comparable::Text(particle.name.clone()),
            Comparable::OptText(particle.local_name.clone()),
        ]
    }

    fn handle_key(&self, index: HandleIndex) -> Vec<Comparable> {
        let handle = &self.handles[index.0];
        vec![
            Comparable::OptText(handle.id.clone()),
            Comparable::OptText(handle.local_name.clone()),
            Comparable::Text(handle.tags.join(" ")),
        ]
    }

    fn slot_key(&self, index: SlotIndex) -> Vec<Comparable> {
        let slot = &self.slots[index.0];
        vec![
            Comparable::OptText(slot.id.clone()),
            Comparable::OptText(slot.name.clone()),
            Comparable::OptText(slot.local_name.clone()),
        ]
    }

    fn handle_label_of(&self, handle: &Handle) -> String {
        match (&handle.id, &handle.local_name) {
            (Some(id), _) => format!("handle:{id}"),
            (None, Some(local)) => format!("handle:{local}"),
            (None, None) => "handle:?".to_string(),
        }
    }

    // -- clone & merge ---------------------------------------------------

    /// Deep copy into `target`, recording old -> new for every node, and
    /// the slices of `target` the copy appended.
    pub fn merge_into(&self, target: &mut Recipe) -> (MergeSlices, CloneMap) {
        let particle_base = target.particles.len();
        let handle_base = target.handles.len();
        let slot_base = target.slots.len();
        let hc_base = target.handle_connections.len();
        let sc_base = target.slot_connections.len();

        let mut map = CloneMap::default();
        for old in 0..self.particles.len() {
            map.particles
                .insert(ParticleIndex(old), ParticleIndex(particle_base + old));
        }
        for old in 0..self.handles.len() {
            map.handles
                .insert(HandleIndex(old), HandleIndex(handle_base + old));
        }
        for old in 0..self.slots.len() {
            map.slots.insert(SlotIndex(old), SlotIndex(slot_base + old));
        }
        for old in 0..self.handle_connections.len() {
            map.handle_connections.insert(
                HandleConnectionIndex(old),
                HandleConnectionIndex(hc_base + old),
            );
        }
        for old in 0..self.slot_connections.len() {
            map.slot_connections.insert(
                SlotConnectionIndex(old),
                SlotConnectionIndex(sc_base + old),
            );
        }

        for particle in &self.particles {
            target.particles.push(Particle {
                name: particle.name.clone(),
                local_name: particle.local_name.clone(),
                verbs: particle.verbs.clone(),
                connections: particle
                    .connections
                    .iter()
                    .map(|c| map.handle_connections[c])
                    .collect(),
                slot_connections: particle
                    .slot_connections
                    .iter()
                    .map(|c| map.slot_connections[c])
                    .collect(),
            });
        }
        for handle in &self.handles {
            target.handles.push(Handle {
                id: handle.id.clone(),
                local_name: handle.local_name.clone(),
                tags: handle.tags.clone(),
                fate: handle.fate,
                ty: handle.ty.clone(),
                mode: handle.mode,
                connections: handle
                    .connections
                    .iter()
                    .map(|c| map.handle_connections[c])
                    .collect(),
            });
        }
        for slot in &self.slots {
            target.slots.push(Slot {
                id: slot.id.clone(),
                name: slot.name.clone(),
                local_name: slot.local_name.clone(),
                tags: slot.tags.clone(),
                source_connection: slot.source_connection.map(|c| map.slot_connections[&c]),
                consumers: slot
                    .consumers
                    .iter()
                    .map(|c| map.slot_connections[c])
                    .collect(),
            });
        }
        for connection in &self.handle_connections {
            target.handle_connections.push(HandleConnection {
                particle: map.particles[&connection.particle],
                name: connection.name.clone(),
                direction: connection.direction,
                ty: connection.ty.clone(),
                tags: connection.tags.clone(),
                handle: connection.handle.map(|h| map.handles[&h]),
            });
        }
        for connection in &self.slot_connections {
            target.slot_connections.push(SlotConnection {
                particle: map.particles[&connection.particle],
                name: connection.name.clone(),
                tags: connection.tags.clone(),
                target_slot: connection.target_slot.map(|s| map.slots[&s]),
                provided_slots: connection
                    .provided_slots
                    .iter()
                    .map(|(name, slot)| (name.clone(), map.slots[slot]))
                    .collect(),
            });
        }

        // Copied by value.
        target.constraints.extend(self.constraints.iter().cloned());
        target.obligations.extend(self.obligations.iter().cloned());
        target.verbs.extend(self.verbs.iter().cloned());
        target.patterns.extend(self.patterns.iter().cloned());
        if target.search.is_none() {
            target.search = self.search.clone();
        }

        let slices = MergeSlices {
            particles: particle_base..target.particles.len(),
            handles: handle_base..target.handles.len(),
            slots: slot_base..target.slots.len(),
            handle_connections: hc_base..target.handle_connections.len(),
            slot_connections: sc_base..target.slot_connections.len(),
        };
        (slices, map)
    }

    /// Deep copy into a fresh mutable recipe.
    pub fn clone_recipe(&self) -> (Recipe, CloneMap) {
        let mut target = Recipe::with_policy(self.name.clone(), self.policy);
        let (_, map) = self.merge_into(&mut target);
        (target, map)
    }
}

fn inverse(order: impl Iterator<Item = usize>) -> BTreeMap<usize, usize> {
    order
        .enumerate()
        .map(|(new, old)| (old, new))
        .collect()
}

fn slot_label(slot: &Slot) -> String {
    match (&slot.id, &slot.name, &slot.local_name) {
        (Some(id), _, _) => format!("slot:{id}"),
        (None, Some(name), _) => format!("slot:{name}"),
        (None, None, Some(local)) => format!("slot:{local}"),
        (None, None, None) => "slot:?".to_string(),
    }
}

/// Old node -> new node, per arena.
#[derive(Clone, Debug, Default)]
pub struct CloneMap {
    pub particles: BTreeMap<ParticleIndex, ParticleIndex>,
    pub handles: BTreeMap<HandleIndex, HandleIndex>,
    pub slots: BTreeMap<SlotIndex, SlotIndex>,
    pub handle_connections: BTreeMap<HandleConnectionIndex, HandleConnectionIndex>,
    pub slot_connections: BTreeMap<SlotConnectionIndex, SlotConnectionIndex>,
}

/// The sub-lists a merge appended to the target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeSlices {
    pub particles: Range<usize>,
    pub handles: Range<usize>,
    pub slots: Range<usize>,
    pub handle_connections: Range<usize>,
    pub slot_connections: Range<usize>,
}

/// A normalized recipe: canonically ordered and sealed. The only form the
/// resolver, digest, and printer accept.
#[derive(Clone, Debug, PartialEq)]
pub struct FrozenRecipe {
    inner: Recipe,
}

impl FrozenRecipe {
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn particles(&self) -> &[Particle] {
        &self.inner.particles
    }

    pub fn handles(&self) -> &[Handle] {
        &self.inner.handles
    }

    pub fn slots(&self) -> &[Slot] {
        &self.inner.slots
    }

    pub fn handle_connections(&self) -> &[HandleConnection] {
        &self.inner.handle_connections
    }

    pub fn slot_connections(&self) -> &[SlotConnection] {
        &self.inner.slot_connections
    }

    pub fn search(&self) -> Option<&Search> {
        self.inner.search.as_ref()
    }

    /// Pure resolvability predicate: frozen, nothing outstanding, every
    /// node individually resolved.
    pub fn is_resolved(&self) -> bool {
        let recipe = &self.inner;
        recipe.obligations.is_empty()
            && recipe.constraints.is_empty()
            && recipe.search.as_ref().is_none_or(Search::is_resolved)
            && recipe.handles.iter().all(Handle::is_resolved)
            && recipe
                .handle_connections
                .iter()
                .all(HandleConnection::is_resolved)
            && recipe
                .slot_connections
                .iter()
                .all(SlotConnection::is_resolved)
            && recipe.slots.iter().all(Slot::is_resolved)
    }

    /// Stable identity: sha256 over the canonical textual form.
    pub fn digest(&self) -> String {
        let digest = Sha256::digest(self.to_string().as_bytes());
        format!("{digest:x}")
    }

    /// Thaw into a fresh mutable deep copy (the frozen original is
    /// untouched; normalization remains terminal for it).
    pub fn clone_recipe(&self) -> (Recipe, CloneMap) {
        self.inner.clone_recipe()
    }

    fn particle_display_name(&self, index: usize) -> String {
        self.inner.particles[index]
            .local_name
            .clone()
            .unwrap_or_else(|| format!("particle{index}"))
    }

    fn handle_display_name(&self, index: usize) -> String {
        self.inner.handles[index]
            .local_name
            .clone()
            .unwrap_or_else(|| format!("handle{index}"))
    }

    fn slot_display_name(&self, index: usize) -> String {
        self.inner.slots[index]
            .local_name
            .clone()
            .unwrap_or_else(|| format!("slot{index}"))
    }
}

impl fmt::Display for FrozenRecipe {
    /// Deterministic textual form. Synthetic names (`particle0`,
    /// `handle0`, `slot0`) go only to nodes without a local name.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let recipe = &self.inner;
        match &recipe.name {
            Some(name) => writeln!(f, "recipe {name}")?,
            None => writeln!(f, "recipe")?,
        }
        if let Some(search) = &recipe.search {
            writeln!(f, "  search `{}`", search.phrase())?;
        }
        if !recipe.verbs.is_empty() {
            writeln!(f, "  verbs {}", recipe.verbs.join(" "))?;
        }

        for (index, handle) in recipe.handles.iter().enumerate() {
            write!(f, "  {}: {}", self.handle_display_name(index), handle.fate)?;
            if let Some(ty) = &handle.ty {
                write!(f, " {ty}")?;
            }
            if let Some(id) = &handle.id {
                write!(f, " '{id}'")?;
            }
            for tag in &handle.tags {
                write!(f, " #{tag}")?;
            }
            writeln!(f)?;
        }

        for (index, slot) in recipe.slots.iter().enumerate() {
            write!(f, "  {}: slot", self.slot_display_name(index))?;
            if let Some(id) = &slot.id {
                write!(f, " '{id}'")?;
            }
            for tag in &slot.tags {
                write!(f, " #{tag}")?;
            }
            writeln!(f)?;
        }

        for (index, particle) in recipe.particles.iter().enumerate() {
            writeln!(
                f,
                "  {} as {}",
                particle.name,
                self.particle_display_name(index)
            )?;
            for connection_index in &particle.connections {
                let connection = &recipe.handle_connections[connection_index.0];
                write!(f, "    {}:", connection.name)?;
                match connection.direction {
                    Some(direction) => write!(f, " {direction}")?,
                    None => write!(f, " ?")?,
                }
                if let Some(ty) = &connection.ty {
                    write!(f, " {ty}")?;
                }
                match connection.handle {
                    Some(handle) => write!(f, " {}", self.handle_display_name(handle.0))?,
                    None => write!(f, " ?")?,
                }
                for tag in &connection.tags {
                    write!(f, " #{tag}")?;
                }
                writeln!(f)?;
            }
            for connection_index in &particle.slot_connections {
                let connection = &recipe.slot_connections[connection_index.0];
                write!(f, "    {}: consumes", connection.name)?;
                match connection.target_slot {
                    Some(slot) => writeln!(f, " {}", self.slot_display_name(slot.0))?,
                    None => writeln!(f, " ?")?,
                }
                for (name, slot) in &connection.provided_slots {
                    writeln!(
                        f,
                        "      {name}: provides {}",
                        self.slot_display_name(slot.0)
                    )?;
                }
            }
        }

        for constraint in &recipe.constraints {
            writeln!(
                f,
                "  constraint {}.{} -> {}.{} ({})",
                constraint.from_particle,
                constraint.from_connection,
                constraint.to_particle,
                constraint.to_connection,
                constraint.direction
            )?;
        }
        for obligation in &recipe.obligations {
            writeln!(f, "  obligation `{}`", obligation.description)?;
        }
        for pattern in &recipe.patterns {
            writeln!(f, "  pattern `{pattern}`")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::node::{Fate, TypeDecl};
    use crate::storage::HandleMode;

    fn person_type() -> TypeDecl {
        TypeDecl::Entity {
            schema: "Person".into(),
        }
    }

    /// Two particles P and Q sharing a handle, Q also carrying an
    /// interface-typed connection.
    fn wired_recipe() -> Recipe {
        let mut recipe = Recipe::new(Some("Wired".into()));
        // Deliberately constructed in a scrambled order.
        let q = recipe.add_particle("Q");
        let p = recipe.add_particle("P");
        let handle = recipe.add_handle();
        {
            let handle = recipe.handle_mut(handle);
            handle.fate = Fate::Create;
            handle.ty = Some(person_type());
        }

        let q_iface = recipe.add_handle_connection(q, "host");
        recipe.handle_connection_mut(q_iface).direction = Some(Direction::Reads);
        recipe.handle_connection_mut(q_iface).ty = Some(TypeDecl::Interface {
            name: "Hosted".into(),
        });
        let iface_handle = recipe.add_handle();
        {
            let handle = recipe.handle_mut(iface_handle);
            handle.fate = Fate::Use;
            handle.id = Some("iface-store".into());
            handle.ty = Some(TypeDecl::Interface {
                name: "Hosted".into(),
            });
        }
        recipe.connect_handle(q_iface, iface_handle);

        let q_in = recipe.add_handle_connection(q, "input");
        recipe.handle_connection_mut(q_in).direction = Some(Direction::Reads);
        recipe.handle_connection_mut(q_in).ty = Some(person_type());
        recipe.connect_handle(q_in, handle);

        let p_out = recipe.add_handle_connection(p, "output");
        recipe.handle_connection_mut(p_out).direction = Some(Direction::Writes);
        recipe.handle_connection_mut(p_out).ty = Some(person_type());
        recipe.connect_handle(p_out, handle);

        recipe
    }

    #[test]
    fn duplicate_handle_ids_invalidate() {
        let mut recipe = Recipe::new(None);
        let a = recipe.add_handle();
        recipe.handle_mut(a).id = Some("dup".into());
        let b = recipe.add_handle();
        recipe.handle_mut(b).id = Some("dup".into());

        let mut errors = RecipeErrors::new();
        assert!(!recipe.is_valid(Some(&mut errors)));
        assert!(errors.values().any(|message| message.contains("duplicate")));
    }

    #[test]
    fn invalid_recipe_normalize_refuses_without_mutation() {
        let mut recipe = Recipe::new(None);
        let a = recipe.add_handle();
        recipe.handle_mut(a).id = Some("dup".into());
        let b = recipe.add_handle();
        recipe.handle_mut(b).id = Some("dup".into());
        let snapshot = recipe.clone();

        let failure = recipe.normalize().unwrap_err();
        assert!(!failure.errors.is_empty());
        assert_eq!(failure.recipe, snapshot);
    }

    #[test]
    fn connection_mode_must_not_exceed_handle_mode() {
        let mut recipe = Recipe::new(None);
        let p = recipe.add_particle("P");
        let handle = recipe.add_handle();
        recipe.handle_mut(handle).mode = HandleMode::Read;
        let connection = recipe.add_handle_connection(p, "output");
        recipe.handle_connection_mut(connection).direction = Some(Direction::Writes);
        recipe.connect_handle(connection, handle);

        let mut errors = RecipeErrors::new();
        assert!(!recipe.is_valid(Some(&mut errors)));
        assert!(errors.values().any(|message| message.contains("exceeds")));
    }

    #[test]
    fn normalize_orders_interface_connections_last() {
        let frozen = wired_recipe().normalize().unwrap();
        // Q's connections: the interface-typed `host` sorts after `input`.
        let q = frozen
            .particles()
            .iter()
            .find(|particle| particle.name == "Q")
            .unwrap();
        let names: Vec<&str> = q
            .connections
            .iter()
            .map(|index| frozen.handle_connections()[index.0].name.as_str())
            .collect();
        assert_eq!(names, ["input", "host"]);
        // Globally, every interface-typed connection trails the plain ones.
        let first_interface = frozen
            .handle_connections()
            .iter()
            .position(HandleConnection::is_interface_typed)
            .unwrap();
        assert!(frozen.handle_connections()[first_interface..]
            .iter()
            .all(HandleConnection::is_interface_typed));
    }

    #[test]
    fn normalize_orders_particles_by_first_connection() {
        let frozen = wired_recipe().normalize().unwrap();
        let names: Vec<&str> = frozen
            .particles()
            .iter()
            .map(|particle| particle.name.as_str())
            .collect();
        // P.output sorts before Q.input, so P leads despite insertion order.
        assert_eq!(names, ["P", "Q"]);
    }

    #[test]
    fn textual_form_is_stable_across_equivalent_builds() {
        let once = wired_recipe().normalize().unwrap();
        let twice = wired_recipe().normalize().unwrap();
        assert_eq!(once.to_string(), twice.to_string());
        assert_eq!(once.digest(), twice.digest());
    }

    #[test]
    fn renormalizing_a_thawed_copy_is_a_no_op() {
        let frozen = wired_recipe().normalize().unwrap();
        let (thawed, _) = frozen.clone_recipe();
        let again = thawed.normalize().unwrap();
        assert_eq!(frozen.to_string(), again.to_string());
        assert_eq!(frozen.digest(), again.digest());
    }

    #[test]
    fn resolution_requires_fates_and_bindings() {
        let frozen = wired_recipe().normalize().unwrap();
        assert!(frozen.is_resolved());

        // A handle without a fate blocks resolution.
        let mut unfated = wired_recipe();
        let dangling = unfated.add_handle();
        unfated.handle_mut(dangling).fate = Fate::Unknown;
        assert!(!unfated.normalize().unwrap().is_resolved());

        // An unbound connection blocks resolution.
        let mut unbound = wired_recipe();
        let p = unbound.add_particle("R");
        let connection = unbound.add_handle_connection(p, "loose");
        unbound.handle_connection_mut(connection).direction = Some(Direction::Reads);
        assert!(!unbound.normalize().unwrap().is_resolved());

        // Outstanding constraints block resolution.
        let mut constrained = wired_recipe();
        constrained.add_constraint(ConnectionConstraint {
            from_particle: "P".into(),
            from_connection: "output".into(),
            to_particle: "Q".into(),
            to_connection: "input".into(),
            direction: Direction::Reads,
        });
        assert!(!constrained.normalize().unwrap().is_resolved());

        // Obligations block resolution.
        let mut obligated = wired_recipe();
        obligated.add_obligation("await plan confirmation");
        assert!(!obligated.normalize().unwrap().is_resolved());
    }

    #[test]
    fn strict_policy_rejects_orphan_slots() {
        let mut strict = Recipe::with_policy(None, OrphanSlotPolicy::Strict);
        strict.add_slot();
        let mut errors = RecipeErrors::new();
        assert!(!strict.is_valid(Some(&mut errors)));
        assert!(errors.values().any(|message| message.contains("orphan")));

        let mut lenient = Recipe::new(None);
        lenient.add_slot();
        assert!(lenient.is_valid(None));
    }

    #[test]
    fn provided_slots_follow_their_producer() {
        let mut recipe = Recipe::new(Some("Slotted".into()));
        let p = recipe.add_particle("P");
        let root = recipe.add_slot();
        recipe.slot_mut(root).id = Some("root-slot".into());
        let detail = recipe.add_slot();

        let consume = recipe.add_slot_connection(p, "root");
        recipe.connect_slot(consume, root);
        recipe.provide_slot(consume, "detail", detail);

        let frozen = recipe.normalize().unwrap();
        // Target slot first, provided slot directly after it.
        assert_eq!(frozen.slots()[0].id.as_deref(), Some("root-slot"));
        assert_eq!(
            frozen.slots()[1].source_connection,
            Some(SlotConnectionIndex(0))
        );
        assert!(frozen.is_resolved());
    }

    #[test]
    fn merge_into_reports_appended_slices_and_map() {
        let source = wired_recipe();
        let mut target = wired_recipe();
        let before_particles = target.particles().len();

        let (slices, map) = source.merge_into(&mut target);
        assert_eq!(slices.particles, before_particles..before_particles + 2);
        assert_eq!(map.particles.len(), 2);

        // The mapped copy of Q keeps its connection shape.
        let q_new = map.particles[&ParticleIndex(0)];
        let copied = target.particle(q_new);
        assert_eq!(copied.name, "Q");
        assert_eq!(copied.connections.len(), 2);
        for connection in &copied.connections {
            assert_eq!(target.handle_connection(*connection).particle, q_new);
        }
    }

    #[test]
    fn clone_preserves_text_after_normalization() {
        let (copy, _) = wired_recipe().clone_recipe();
        let original = wired_recipe().normalize().unwrap();
        let cloned = copy.normalize().unwrap();
        assert_eq!(original.to_string(), cloned.to_string());
    }
}
