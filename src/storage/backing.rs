//! Backing family: a multiplexed, keyed set of entity stores.
//!
//! One direct store per entity id, created lazily on first touch at the
//! child key `base/<id>`. The family registers itself as the proxy of each
//! child and re-tags everything it hears with the entity id, so the owner
//! sees one muxed stream.

use std::collections::BTreeMap;

use crossbeam::channel::Receiver;

use super::direct::DirectStore;
use super::driver::DriverRegistry;
use super::key::StorageKey;
use super::message::{Existence, MuxedProxyMessage, ProxyId, ProxyMessage};
use super::StoreError;
use crate::crdt::{CrdtEntity, EntityData};
use crate::schema::ReferenceId;

struct BackingEntry {
    store: DirectStore<CrdtEntity>,
    proxy_id: ProxyId,
    proxy_rx: Receiver<ProxyMessage<CrdtEntity>>,
}

pub struct BackingFamily {
    base_key: StorageKey,
    registry: DriverRegistry,
    entries: BTreeMap<ReferenceId, BackingEntry>,
}

impl BackingFamily {
    pub fn new(base_key: StorageKey, registry: DriverRegistry) -> Self {
        Self {
            base_key,
            registry,
            entries: BTreeMap::new(),
        }
    }

    pub fn base_key(&self) -> &StorageKey {
        &self.base_key
    }

    pub fn contains(&self, id: &ReferenceId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ReferenceId> {
        self.entries.keys()
    }

    /// Lazily create the store for `id` on first touch.
    pub fn get_or_create(&mut self, id: &ReferenceId) -> Result<&mut DirectStore<CrdtEntity>, StoreError> {
        if !self.entries.contains_key(id) {
            let child_key = self.base_key.child_key_with_component(id.as_str());
            let driver = self
                .registry
                .driver::<EntityData>(&child_key, Existence::ShouldCreate)?;
            let mut store =
                DirectStore::new(child_key, Box::new(driver), CrdtEntity::default());
            let (proxy_id, proxy_rx) = store.register_proxy();
            tracing::debug!(id = %id, "backing store created");
            self.entries.insert(
                id.clone(),
                BackingEntry {
                    store,
                    proxy_id,
                    proxy_rx,
                },
            );
        }
        Ok(&mut self.entries.get_mut(id).expect("inserted above").store)
    }

    pub fn store(&self, id: &ReferenceId) -> Option<&DirectStore<CrdtEntity>> {
        self.entries.get(id).map(|entry| &entry.store)
    }

    /// Route a muxed proxy message to the store for `id`, stamping the
    /// family's own proxy registration as the origin.
    pub fn on_proxy_message(
        &mut self,
        id: &ReferenceId,
        message: ProxyMessage<CrdtEntity>,
    ) -> Result<bool, StoreError> {
        let proxy_id = {
            self.get_or_create(id)?;
            self.entries[id].proxy_id
        };
        let entry = self.entries.get_mut(id).expect("created above");
        entry.store.on_proxy_message(message.with_origin(Some(proxy_id)))
    }

    /// Pump every child store and collect the muxed notifications.
    pub fn pump(&mut self) -> Result<Vec<MuxedProxyMessage<CrdtEntity>>, StoreError> {
        let mut out = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            entry.store.pump()?;
            while let Ok(message) = entry.proxy_rx.try_recv() {
                out.push(MuxedProxyMessage {
                    mux_id: id.clone(),
                    message,
                });
            }
        }
        Ok(out)
    }

    pub fn is_idle(&self) -> bool {
        self.entries
            .values()
            .all(|entry| entry.store.is_idle() && entry.proxy_rx.is_empty())
    }
}
