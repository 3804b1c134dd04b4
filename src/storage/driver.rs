//! Driver contract and the in-memory driver.
//!
//! A driver owns one storage key. `send` is optimistic: it succeeds only
//! when `version` is exactly one ahead of the persisted version. A stale
//! send returns `false` and the driver delivers the newer persisted model
//! back to the sender, whose store merges it and retries. `false` always
//! means transient failure; writes are never dropped by the store.
//!
//! The in-memory registry is the test transport: drivers on the same key
//! see each other's sends.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crossbeam::channel::Sender;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::key::StorageKey;
use super::message::Existence;
use super::StoreError;

#[derive(Clone, Debug)]
pub struct DriverUpdate<Data> {
    pub data: Data,
    pub version: u64,
}

/// The persistence contract, per key.
pub trait StorageDriver<Data>: Send {
    /// Install the receiving end of this driver. `token` is the last
    /// version token the receiver has seen, if any; a driver holding newer
    /// state delivers it immediately.
    fn register_receiver(&mut self, token: Option<String>, sender: Sender<DriverUpdate<Data>>);

    /// Attempt a write. `false` means transient failure; the caller
    /// retains the write and retries after its next merge with the driver.
    fn send(&mut self, data: &Data, version: u64) -> bool;

    fn token(&self) -> Option<String>;

    fn key(&self) -> &StorageKey;
}

type Receiver = Box<dyn Fn(&serde_json::Value, u64) + Send>;

#[derive(Default)]
struct KeyState {
    data: Option<serde_json::Value>,
    version: u64,
    receivers: Vec<(u64, Receiver)>,
    fail_sends: u32,
}

#[derive(Default)]
struct RegistryInner {
    keys: BTreeMap<String, KeyState>,
    next_driver: u64,
}

/// Shared in-memory transport: one entry per storage key.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate a driver for `key`. `MustExist` fails when the key has
    /// never been written or attached.
    pub fn driver<Data>(
        &self,
        key: &StorageKey,
        existence: Existence,
    ) -> Result<MemoryDriver<Data>, StoreError>
    where
        Data: Serialize + DeserializeOwned + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        let exists = inner.keys.contains_key(key.as_str());
        if existence == Existence::MustExist && !exists {
            return Err(StoreError::DriverUnavailable {
                key: key.as_str().to_string(),
                reason: "key does not exist".to_string(),
            });
        }
        inner.keys.entry(key.as_str().to_string()).or_default();
        inner.next_driver += 1;
        let id = inner.next_driver;
        Ok(MemoryDriver {
            key: key.clone(),
            id,
            token: None,
            registry: self.clone(),
            _marker: PhantomData,
        })
    }

    /// Make the next `count` sends on `key` fail, simulating a transient
    /// outage.
    pub fn fail_next_sends(&self, key: &StorageKey, count: u32) {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        inner
            .keys
            .entry(key.as_str().to_string())
            .or_default()
            .fail_sends = count;
    }

    pub fn persisted_version(&self, key: &StorageKey) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        inner
            .keys
            .get(key.as_str())
            .map(|state| state.version)
            .unwrap_or(0)
    }

    /// Read back the persisted model, for inspection.
    pub fn persisted<Data: DeserializeOwned>(&self, key: &StorageKey) -> Option<Data> {
        let inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        inner
            .keys
            .get(key.as_str())
            .and_then(|state| state.data.as_ref())
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

pub struct MemoryDriver<Data> {
    key: StorageKey,
    id: u64,
    token: Option<String>,
    registry: DriverRegistry,
    _marker: PhantomData<Data>,
}

impl<Data> std::fmt::Debug for MemoryDriver<Data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDriver")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("token", &self.token)
            .finish()
    }
}

impl<Data> StorageDriver<Data> for MemoryDriver<Data>
where
    Data: Serialize + DeserializeOwned + Send + 'static,
{
    fn register_receiver(&mut self, token: Option<String>, sender: Sender<DriverUpdate<Data>>) {
        self.token = token.clone();
        let receiver: Receiver = Box::new(move |value, version| {
            match serde_json::from_value::<Data>(value.clone()) {
                Ok(data) => {
                    let _ = sender.send(DriverUpdate { data, version });
                }
                Err(err) => {
                    tracing::error!(%version, %err, "driver payload failed to decode");
                }
            }
        });

        let mut inner = self
            .registry
            .inner
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        let state = inner.keys.entry(self.key.as_str().to_string()).or_default();
        // A receiver attaching behind the persisted state gets caught up
        // immediately.
        if let Some(data) = &state.data {
            let current = state.version.to_string();
            if token.as_deref() != Some(current.as_str()) {
                receiver(data, state.version);
            }
        }
        state.receivers.push((self.id, receiver));
    }

    fn send(&mut self, data: &Data, version: u64) -> bool {
        let value = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(key = %self.key, %err, "driver payload failed to encode");
                return false;
            }
        };

        let mut inner = self
            .registry
            .inner
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        let state = inner.keys.entry(self.key.as_str().to_string()).or_default();

        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            tracing::debug!(key = %self.key, %version, "driver send failed (injected)");
            return false;
        }

        if version != state.version + 1 {
            // Stale write: hand the sender the newer model so it can merge
            // and retry.
            if let Some(current) = &state.data {
                let persisted = state.version;
                for (id, receiver) in &state.receivers {
                    if *id == self.id {
                        receiver(current, persisted);
                    }
                }
            }
            return false;
        }

        state.data = Some(value.clone());
        state.version = version;
        for (id, receiver) in &state.receivers {
            if *id != self.id {
                receiver(&value, version);
            }
        }
        true
    }

    fn token(&self) -> Option<String> {
        self.token.clone()
    }

    fn key(&self) -> &StorageKey {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    fn key(s: &str) -> StorageKey {
        StorageKey::parse(s).unwrap()
    }

    #[test]
    fn must_exist_requires_prior_attachment() {
        let registry = DriverRegistry::new();
        let missing = registry.driver::<u32>(&key("memory://a"), Existence::MustExist);
        assert!(matches!(
            missing.unwrap_err(),
            StoreError::DriverUnavailable { .. }
        ));

        registry
            .driver::<u32>(&key("memory://a"), Existence::ShouldCreate)
            .unwrap();
        assert!(registry
            .driver::<u32>(&key("memory://a"), Existence::MustExist)
            .is_ok());
    }

    #[test]
    fn send_fans_out_to_other_receivers_only() {
        let registry = DriverRegistry::new();
        let mut a = registry
            .driver::<u32>(&key("memory://k"), Existence::ShouldCreate)
            .unwrap();
        let mut b = registry
            .driver::<u32>(&key("memory://k"), Existence::MayExist)
            .unwrap();

        let (tx_a, rx_a) = unbounded();
        let (tx_b, rx_b) = unbounded();
        a.register_receiver(None, tx_a);
        b.register_receiver(None, tx_b);

        assert!(a.send(&7, 1));
        let update = rx_b.try_recv().unwrap();
        assert_eq!(update.data, 7);
        assert_eq!(update.version, 1);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn stale_send_returns_false_and_catches_sender_up() {
        let registry = DriverRegistry::new();
        let mut a = registry
            .driver::<u32>(&key("memory://k"), Existence::ShouldCreate)
            .unwrap();
        let mut b = registry
            .driver::<u32>(&key("memory://k"), Existence::MayExist)
            .unwrap();
        let (tx_a, rx_a) = unbounded();
        a.register_receiver(None, tx_a);
        let (tx_b, _rx_b) = unbounded();
        b.register_receiver(None, tx_b);

        assert!(b.send(&1, 1));
        // a never saw version 1, so its optimistic send at version 1 is
        // stale.
        rx_a.try_recv().unwrap();
        assert!(!a.send(&2, 1));
        let update = rx_a.try_recv().unwrap();
        assert_eq!(update.version, 1);
        assert_eq!(update.data, 1);
        // After "merging", version 2 goes through.
        assert!(a.send(&3, 2));
    }

    #[test]
    fn injected_failures_are_transient() {
        let registry = DriverRegistry::new();
        let mut a = registry
            .driver::<u32>(&key("memory://k"), Existence::ShouldCreate)
            .unwrap();
        let (tx, _rx) = unbounded();
        a.register_receiver(None, tx);

        registry.fail_next_sends(&key("memory://k"), 1);
        assert!(!a.send(&1, 1));
        assert!(a.send(&1, 1));
        assert_eq!(registry.persisted::<u32>(&key("memory://k")), Some(1));
    }

    #[test]
    fn late_receiver_is_caught_up_on_registration() {
        let registry = DriverRegistry::new();
        let mut a = registry
            .driver::<u32>(&key("memory://k"), Existence::ShouldCreate)
            .unwrap();
        let (tx_a, _rx_a) = unbounded();
        a.register_receiver(None, tx_a);
        assert!(a.send(&9, 1));

        let mut late = registry
            .driver::<u32>(&key("memory://k"), Existence::MayExist)
            .unwrap();
        let (tx, rx) = unbounded();
        late.register_receiver(None, tx);
        let update = rx.try_recv().unwrap();
        assert_eq!(update.data, 9);
        assert_eq!(update.version, 1);
    }
}
