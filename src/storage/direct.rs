//! Direct store: one CRDT model over one driver.
//!
//! Proxy messages mutate the local model and fan out to the other
//! registered proxies; driver updates merge in and fan out to all of them.
//! A failed driver send leaves the model dirty; the retry fires after the
//! next merge with the driver (the stale-send path delivers the newer
//! model, the merge absorbs it, and the resend carries the next version).

use std::collections::BTreeMap;

use crossbeam::channel::{unbounded, Receiver, Sender};

use super::driver::{DriverUpdate, StorageDriver};
use super::key::StorageKey;
use super::message::{ProxyId, ProxyMessage};
use super::StoreError;
use crate::crdt::{CrdtChange, CrdtModel};

pub struct DirectStore<M: CrdtModel> {
    key: StorageKey,
    model: M,
    driver: Box<dyn StorageDriver<M::Data>>,
    driver_rx: Receiver<DriverUpdate<M::Data>>,
    proxies: BTreeMap<ProxyId, Sender<ProxyMessage<M>>>,
    next_proxy: u32,
    driver_version: u64,
    dirty: bool,
}

impl<M: CrdtModel> std::fmt::Debug for DirectStore<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectStore")
            .field("key", &self.key)
            .field("driver_version", &self.driver_version)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl<M: CrdtModel> DirectStore<M> {
    pub fn new(key: StorageKey, driver: Box<dyn StorageDriver<M::Data>>, model: M) -> Self {
        Self::with_version_token(key, driver, model, None)
    }

    /// `version_token` names the last driver state this store has seen;
    /// a driver holding newer state catches the store up on registration.
    pub fn with_version_token(
        key: StorageKey,
        mut driver: Box<dyn StorageDriver<M::Data>>,
        model: M,
        version_token: Option<String>,
    ) -> Self {
        let (tx, rx) = unbounded();
        driver.register_receiver(version_token, tx);
        Self {
            key,
            model,
            driver,
            driver_rx: rx,
            proxies: BTreeMap::new(),
            next_proxy: 0,
            driver_version: 0,
            dirty: false,
        }
    }

    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Register a proxy; messages for it arrive on the returned channel.
    pub fn register_proxy(&mut self) -> (ProxyId, Receiver<ProxyMessage<M>>) {
        self.next_proxy += 1;
        let id = ProxyId(self.next_proxy);
        let (tx, rx) = unbounded();
        self.proxies.insert(id, tx);
        (id, rx)
    }

    pub fn deregister_proxy(&mut self, id: ProxyId) {
        self.proxies.remove(&id);
    }

    /// Handle one incoming proxy message. Returns whether the message was
    /// accepted; a rejected operation batch resyncs the sender instead.
    pub fn on_proxy_message(&mut self, message: ProxyMessage<M>) -> Result<bool, StoreError> {
        match message {
            ProxyMessage::SyncRequest { id } => {
                let Some(id) = id else {
                    return Err(StoreError::MissingProxyId);
                };
                self.send_to(
                    id,
                    ProxyMessage::ModelUpdate {
                        model: self.model.data().clone(),
                        id: None,
                    },
                )?;
                Ok(true)
            }
            ProxyMessage::Operations { operations, id } => {
                for (index, op) in operations.iter().enumerate() {
                    if !self.model.apply_operation(op) {
                        tracing::debug!(
                            key = %self.key,
                            index,
                            "operation does not connect; resyncing sender"
                        );
                        if let Some(id) = id {
                            self.send_to(
                                id,
                                ProxyMessage::ModelUpdate {
                                    model: self.model.data().clone(),
                                    id: None,
                                },
                            )?;
                        }
                        return Ok(false);
                    }
                }
                self.dirty = true;
                self.notify_except(
                    id,
                    ProxyMessage::Operations {
                        operations,
                        id: None,
                    },
                );
                self.flush();
                Ok(true)
            }
            ProxyMessage::ModelUpdate { model, id } => {
                let before = self.model.data().clone();
                let outcome = self.model.merge(&model)?;
                if self.model.data() != &before {
                    self.dirty = true;
                }
                if let Some(message) = change_message(outcome.model_change) {
                    self.notify_except(id, message);
                }
                if let (Some(id), Some(message)) = (id, change_message(outcome.other_change)) {
                    // Only answer the sender when it is actually behind.
                    if model != *self.model.data() {
                        self.send_to(id, message)?;
                    }
                }
                self.flush();
                Ok(true)
            }
        }
    }

    /// Drain pending driver updates, merging each and fanning the result
    /// out to every proxy. Ends with a flush so locally-buffered writes
    /// retry after the merge.
    pub fn pump(&mut self) -> Result<(), StoreError> {
        while let Ok(update) = self.driver_rx.try_recv() {
            self.driver_version = self.driver_version.max(update.version);
            let before = self.model.data().clone();
            let outcome = self.model.merge(&update.data)?;
            if self.model.data() == &update.data {
                // Driver state covers everything local.
                self.dirty = false;
            } else if self.model.data() != &before || self.dirty {
                self.dirty = true;
            }
            if let Some(message) = change_message(outcome.model_change) {
                self.notify_except(None, message);
            }
        }
        self.flush();
        Ok(())
    }

    /// Attempt to persist local state if it is dirty.
    pub fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        let version = self.driver_version + 1;
        if self.driver.send(self.model.data(), version) {
            self.driver_version = version;
            self.dirty = false;
        } else {
            tracing::debug!(key = %self.key, %version, "driver send failed; write retained");
        }
    }

    /// No buffered driver writes and no unprocessed driver updates.
    pub fn is_idle(&self) -> bool {
        !self.dirty && self.driver_rx.is_empty()
    }

    fn send_to(&self, id: ProxyId, message: ProxyMessage<M>) -> Result<(), StoreError> {
        let sender = self
            .proxies
            .get(&id)
            .ok_or(StoreError::UnregisteredProxy(id))?;
        let _ = sender.send(message);
        Ok(())
    }

    fn notify_except(&self, exclude: Option<ProxyId>, message: ProxyMessage<M>) {
        for (id, sender) in &self.proxies {
            if Some(*id) == exclude {
                continue;
            }
            let _ = sender.send(message.clone());
        }
    }
}

fn change_message<M: CrdtModel>(
    change: CrdtChange<M::Operation, M::Data>,
) -> Option<ProxyMessage<M>> {
    match change {
        CrdtChange::Operations(operations) if operations.is_empty() => None,
        CrdtChange::Operations(operations) => Some(ProxyMessage::Operations {
            operations,
            id: None,
        }),
        CrdtChange::Model(model) => Some(ProxyMessage::ModelUpdate { model, id: None }),
    }
}
