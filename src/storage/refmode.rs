//! Reference-mode store.
//!
//! Splits a collection (or singleton) of entities into two layers:
//! - the container: a reference CRDT at the storage key,
//! - the backing family: one entity CRDT per id below the backing key.
//!
//! Container updates may name references whose entity bodies have not
//! arrived yet. Those ids wait in a per-id pending map holding the
//! reference's version threshold; the store emits a proxy-visible model
//! only once every referenced entity has a backing model at or above its
//! reference version, so particles never observe a reference they cannot
//! dereference.

use std::collections::{BTreeMap, BTreeSet};

use crossbeam::channel::{unbounded, Receiver, Sender};
use rand::RngCore;
use uuid::Uuid;

use super::backing::BackingFamily;
use super::direct::DirectStore;
use super::driver::DriverRegistry;
use super::key::ReferenceModeStorageKey;
use super::message::{Existence, ProxyId, ProxyMessage};
use super::{Reference, StoreError};
use crate::config::Limits;
use crate::crdt::{
    Actor, CrdtCollection, CrdtEntity, CrdtModel, CrdtSingleton, Referenceable, SetData,
    SetOperation, SingletonOperation, VersionMap, VersionedValue,
};
use crate::schema::{Entity, ReferenceId};

/// The container side of a reference-mode store, plus the translation from
/// the proxy-facing entity operations to reference operations.
pub trait ContainerModel: CrdtModel<Data = SetData<Reference>> + Default {
    type ProxyModel: CrdtModel<Data = SetData<Entity>> + Default;

    /// Entities this operation writes; they land in the backing family
    /// before the container operation applies.
    fn upserts(op: &<Self::ProxyModel as CrdtModel>::Operation) -> Vec<&Entity>;

    /// Lower the entity operation to the equivalent reference operation.
    /// `make_ref` names the entity's current backing write.
    fn to_container_op(
        op: &<Self::ProxyModel as CrdtModel>::Operation,
        make_ref: &mut dyn FnMut(&Entity) -> Reference,
    ) -> Self::Operation;
}

impl ContainerModel for CrdtCollection<Reference> {
    type ProxyModel = CrdtCollection<Entity>;

    fn upserts(op: &SetOperation<Entity>) -> Vec<&Entity> {
        match op {
            SetOperation::Add { value, .. } => vec![value],
            SetOperation::Remove { .. } => Vec::new(),
        }
    }

    fn to_container_op(
        op: &SetOperation<Entity>,
        make_ref: &mut dyn FnMut(&Entity) -> Reference,
    ) -> SetOperation<Reference> {
        match op {
            SetOperation::Add {
                actor,
                clock,
                value,
            } => SetOperation::Add {
                actor: actor.clone(),
                clock: clock.clone(),
                value: make_ref(value),
            },
            SetOperation::Remove {
                actor,
                clock,
                value,
            } => SetOperation::Remove {
                actor: actor.clone(),
                clock: clock.clone(),
                value: make_ref(value),
            },
        }
    }
}

impl ContainerModel for CrdtSingleton<Reference> {
    type ProxyModel = CrdtSingleton<Entity>;

    fn upserts(op: &SingletonOperation<Entity>) -> Vec<&Entity> {
        match op {
            SingletonOperation::Set { value, .. } => vec![value],
            SingletonOperation::Clear { .. } => Vec::new(),
        }
    }

    fn to_container_op(
        op: &SingletonOperation<Entity>,
        make_ref: &mut dyn FnMut(&Entity) -> Reference,
    ) -> SingletonOperation<Reference> {
        match op {
            SingletonOperation::Set {
                actor,
                clock,
                value,
            } => SingletonOperation::Set {
                actor: actor.clone(),
                clock: clock.clone(),
                value: make_ref(value),
            },
            SingletonOperation::Clear { actor, clock } => SingletonOperation::Clear {
                actor: actor.clone(),
                clock: clock.clone(),
            },
        }
    }
}

/// A container entry waiting for its entity body.
#[derive(Clone, Debug)]
struct PendingEntry {
    reference: Reference,
}

pub struct ReferenceModeStore<C: ContainerModel = CrdtCollection<Reference>> {
    key: ReferenceModeStorageKey,
    /// Stable local actor; every reference and backing write this store
    /// originates carries it.
    crdt_key: Actor,
    container: DirectStore<C>,
    container_proxy: ProxyId,
    container_rx: Receiver<ProxyMessage<C>>,
    backing: BackingFamily,
    proxies: BTreeMap<ProxyId, Sender<ProxyMessage<C::ProxyModel>>>,
    next_proxy: u32,
    entity_versions: BTreeMap<ReferenceId, u64>,
    pending: BTreeMap<ReferenceId, PendingEntry>,
    sync_waiters: BTreeSet<ProxyId>,
    broadcast_held: bool,
    limits: Limits,
}

impl<C: ContainerModel> ReferenceModeStore<C> {
    pub fn open(
        key: ReferenceModeStorageKey,
        registry: DriverRegistry,
        existence: Existence,
    ) -> Result<Self, StoreError> {
        Self::open_with_limits(key, registry, existence, Limits::default())
    }

    pub fn open_with_limits(
        key: ReferenceModeStorageKey,
        registry: DriverRegistry,
        existence: Existence,
        limits: Limits,
    ) -> Result<Self, StoreError> {
        let driver = registry.driver::<SetData<Reference>>(&key.storage, existence)?;
        let mut container = DirectStore::new(key.storage.clone(), Box::new(driver), C::default());
        let (container_proxy, container_rx) = container.register_proxy();
        let backing = BackingFamily::new(key.backing.clone(), registry);
        let store = Self {
            key,
            crdt_key: new_crdt_key(),
            container,
            container_proxy,
            container_rx,
            backing,
            proxies: BTreeMap::new(),
            next_proxy: 0,
            entity_versions: BTreeMap::new(),
            pending: BTreeMap::new(),
            sync_waiters: BTreeSet::new(),
            broadcast_held: false,
            limits,
        };
        tracing::debug!(key = %store.key, actor = %store.crdt_key, "reference-mode store opened");
        Ok(store)
    }

    pub fn key(&self) -> &ReferenceModeStorageKey {
        &self.key
    }

    pub fn crdt_key(&self) -> &Actor {
        &self.crdt_key
    }

    pub fn register_proxy(&mut self) -> (ProxyId, Receiver<ProxyMessage<C::ProxyModel>>) {
        self.next_proxy += 1;
        let id = ProxyId(self.next_proxy);
        let (tx, rx) = unbounded();
        self.proxies.insert(id, tx);
        (id, rx)
    }

    pub fn deregister_proxy(&mut self, id: ProxyId) {
        self.proxies.remove(&id);
        self.sync_waiters.remove(&id);
    }

    /// Handle one particle-facing message.
    pub fn on_proxy_message(
        &mut self,
        message: ProxyMessage<C::ProxyModel>,
    ) -> Result<bool, StoreError> {
        match message {
            ProxyMessage::SyncRequest { id } => {
                let Some(id) = id else {
                    return Err(StoreError::MissingProxyId);
                };
                if self.enqueue_unreachable_references()? {
                    tracing::debug!(proxy = %id, "sync held until backing catches up");
                    self.sync_waiters.insert(id);
                } else {
                    let model = self.materialized_model();
                    self.send_to(id, ProxyMessage::ModelUpdate { model, id: None })?;
                }
                Ok(true)
            }
            ProxyMessage::Operations { operations, id } => {
                if operations.len() > self.limits.max_operations_per_message {
                    return Err(StoreError::LimitExceeded {
                        what: "operations per message",
                        limit: self.limits.max_operations_per_message,
                    });
                }
                for op in &operations {
                    for entity in C::upserts(op) {
                        self.upsert_backing(entity)?;
                    }
                    let container_op = self.lower_op(op);
                    let accepted = self.container.on_proxy_message(ProxyMessage::Operations {
                        operations: vec![container_op],
                        id: Some(self.container_proxy),
                    })?;
                    if !accepted {
                        // Earlier ops in the batch already applied and were
                        // fanned out; only the sender needs a resync.
                        if let Some(id) = id {
                            let model = self.materialized_model();
                            self.send_to(id, ProxyMessage::ModelUpdate { model, id: None })?;
                        }
                        return Ok(false);
                    }
                    // Fan out per accepted op, so a later rejection in the
                    // same batch cannot strand an applied write.
                    self.notify_except(
                        id,
                        ProxyMessage::Operations {
                            operations: vec![op.clone()],
                            id: None,
                        },
                    );
                }
                Ok(true)
            }
            ProxyMessage::ModelUpdate { model, id } => {
                let mut container_data: SetData<Reference> = SetData::new();
                container_data.version = model.version.clone();
                for (element_id, element) in &model.values {
                    let reference = self.upsert_backing(&element.value)?;
                    container_data.values.insert(
                        element_id.clone(),
                        VersionedValue {
                            value: reference,
                            clock: element.clock.clone(),
                        },
                    );
                }
                self.container.on_proxy_message(ProxyMessage::ModelUpdate {
                    model: container_data,
                    id: Some(self.container_proxy),
                })?;
                let merged = self.materialized_model();
                self.notify_except(id, ProxyMessage::ModelUpdate { model: merged, id: None });
                Ok(true)
            }
        }
    }

    /// Adopt another store's model, exactly as a proxy model-update with
    /// the reserved origin id 0.
    pub fn clone_from(&mut self, other: &ReferenceModeStore<C>) -> Result<(), StoreError> {
        let model = other.materialized_model();
        self.on_proxy_message(ProxyMessage::ModelUpdate {
            model,
            id: Some(ProxyId(0)),
        })?;
        Ok(())
    }

    /// Drive all queued work: container and backing pumps, pending-queue
    /// release checks, and held notifications.
    pub fn pump(&mut self) -> Result<(), StoreError> {
        self.container.pump()?;

        let mut container_changed = false;
        while let Ok(message) = self.container_rx.try_recv() {
            match message {
                ProxyMessage::ModelUpdate { .. } | ProxyMessage::Operations { .. } => {
                    container_changed = true;
                }
                ProxyMessage::SyncRequest { .. } => {}
            }
        }
        if container_changed {
            // Owed regardless of whether the enqueue below errors; the
            // container messages are already drained.
            self.broadcast_held = true;
            if self.enqueue_unreachable_references()? {
                tracing::debug!(
                    pending = self.pending.len(),
                    "container update held awaiting backing"
                );
            }
        }

        for muxed in self.backing.pump()? {
            self.release_if_ready(&muxed.mux_id);
        }
        // Backing merges may also have satisfied older thresholds.
        let waiting: Vec<ReferenceId> = self.pending.keys().cloned().collect();
        for id in waiting {
            self.release_if_ready(&id);
        }

        if self.pending.is_empty() {
            if self.broadcast_held {
                self.broadcast_held = false;
                let model = self.materialized_model();
                self.notify_except(None, ProxyMessage::ModelUpdate { model, id: None });
            }
            if !self.sync_waiters.is_empty() {
                let model = self.materialized_model();
                for id in std::mem::take(&mut self.sync_waiters) {
                    self.send_to(id, ProxyMessage::ModelUpdate { model: model.clone(), id: None })?;
                }
            }
        }
        Ok(())
    }

    /// Quiescence: no pending driver writes anywhere, no waiting container
    /// entries, nothing left in the queues.
    pub fn is_idle(&self) -> bool {
        self.container.is_idle()
            && self.backing.is_idle()
            && self.pending.is_empty()
            && self.container_rx.is_empty()
            && !self.broadcast_held
            && self.sync_waiters.is_empty()
    }

    /// Pump until quiescent or no further progress is possible. Returns
    /// whether the store reached the idle state.
    pub fn idle(&mut self) -> Result<bool, StoreError> {
        self.pump()?;
        Ok(self.is_idle())
    }

    /// The materialized particle-facing model: the container's elements
    /// with every reference replaced by its backing entity.
    pub fn materialized_model(&self) -> SetData<Entity> {
        let container = self.container.model().data();
        let mut out: SetData<Entity> = SetData::new();
        out.version = container.version.clone();
        for (element_id, element) in &container.values {
            let Some(entity) = self.dereference(&element.value) else {
                // Unreachable entries are exactly the pending ones; the
                // caller gates on the pending queue before broadcasting.
                continue;
            };
            out.values.insert(
                element_id.clone(),
                VersionedValue {
                    value: entity,
                    clock: element.clock.clone(),
                },
            );
        }
        out
    }

    fn dereference(&self, reference: &Reference) -> Option<Entity> {
        let store = self.backing.store(&reference.id)?;
        let data = store.model().data();
        if !data.version.dominates(&reference.version) {
            return None;
        }
        Some(store.model().materialize(reference.id.clone()))
    }

    /// Write the entity body into its backing store under this store's
    /// actor, returning the reference that names the write.
    fn upsert_backing(&mut self, entity: &Entity) -> Result<Reference, StoreError> {
        let id = ReferenceId::new(entity.unique_id());
        let version = {
            let slot = self.entity_versions.entry(id.clone()).or_insert(0);
            *slot += 1;
            *slot
        };
        let model = CrdtEntity::model_from_entity(entity, &self.crdt_key, version);
        self.backing
            .on_proxy_message(&id, ProxyMessage::ModelUpdate { model, id: None })?;
        Ok(Reference {
            id: id.clone(),
            storage_key: self.key.backing.clone(),
            version: VersionMap::of([(self.crdt_key.clone(), version)]),
        })
    }

    /// Upserts run before lowering, so the per-entity version already
    /// names the write the reference must point at.
    fn lower_op(
        &self,
        op: &<C::ProxyModel as CrdtModel>::Operation,
    ) -> <C as CrdtModel>::Operation {
        let backing_key = self.key.backing.clone();
        let crdt_key = self.crdt_key.clone();
        let entity_versions = &self.entity_versions;
        C::to_container_op(op, &mut |entity| {
            let id = ReferenceId::new(entity.unique_id());
            let version = entity_versions.get(&id).copied().unwrap_or(0);
            Reference {
                id,
                storage_key: backing_key.clone(),
                version: VersionMap::of([(crdt_key.clone(), version)]),
            }
        })
    }

    /// Queue every container reference whose entity body is missing or
    /// behind. Returns whether anything is waiting. A later reference to
    /// an already-waiting id supersedes the stored threshold in place.
    fn enqueue_unreachable_references(&mut self) -> Result<bool, StoreError> {
        let container = self.container.model().data().clone();
        // A reference removed from the container no longer gates anything;
        // prune before counting against the pending limit.
        self.pending
            .retain(|id, _| container.contains_id(id.as_str()));
        for element in container.elements() {
            let reference = &element.value;
            // Subscribe the backing store so the body's arrival is heard.
            self.backing.get_or_create(&reference.id)?;
            if self.dereference(reference).is_some() {
                continue;
            }
            if self.pending.len() >= self.limits.max_pending_entries
                && !self.pending.contains_key(&reference.id)
            {
                return Err(StoreError::LimitExceeded {
                    what: "pending container entries",
                    limit: self.limits.max_pending_entries,
                });
            }
            self.pending
                .entry(reference.id.clone())
                .and_modify(|entry| {
                    if reference
                        .version
                        .total_cmp(&entry.reference.version)
                        .is_gt()
                    {
                        entry.reference = reference.clone();
                    }
                })
                .or_insert_with(|| {
                    tracing::debug!(id = %reference.id, "reference awaiting backing");
                    PendingEntry {
                        reference: reference.clone(),
                    }
                });
        }
        Ok(!self.pending.is_empty())
    }

    fn release_if_ready(&mut self, id: &ReferenceId) {
        let Some(entry) = self.pending.get(id) else {
            return;
        };
        if self.dereference(&entry.reference).is_some() {
            tracing::debug!(id = %id, "backing caught up; reference released");
            self.pending.remove(id);
        }
    }

    fn send_to(
        &self,
        id: ProxyId,
        message: ProxyMessage<C::ProxyModel>,
    ) -> Result<(), StoreError> {
        let sender = self
            .proxies
            .get(&id)
            .ok_or(StoreError::UnregisteredProxy(id))?;
        let _ = sender.send(message);
        Ok(())
    }

    fn notify_except(&self, exclude: Option<ProxyId>, message: ProxyMessage<C::ProxyModel>) {
        for (id, sender) in &self.proxies {
            if Some(*id) == exclude {
                continue;
            }
            let _ = sender.send(message.clone());
        }
    }
}

fn new_crdt_key() -> Actor {
    let mut rng = rand::rng();
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    Actor::new(format!("rm-{}", Uuid::from_bytes(bytes))).expect("generated actor is non-empty")
}
