//! Process context.
//!
//! A [`Runtime`] bundles the pieces every store needs: configuration, the
//! driver registry, and the host exception channel. Inject it explicitly;
//! [`Runtime::single_process`] is the convenience constructor for tests
//! and one-process embedding.

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::config::Config;
use crate::crdt::CrdtModel;
use crate::error::Error;
use crate::storage::{
    ContainerModel, DirectStore, DriverRegistry, Existence, ReferenceModeStorageKey,
    ReferenceModeStore, StoreError, StoreMode, StoreOptions,
};

/// An error crossing the host boundary, tagged with where it surfaced.
#[derive(Debug)]
pub struct PropagatedException {
    pub method: &'static str,
    pub error: Error,
}

pub struct Runtime {
    config: Config,
    registry: DriverRegistry,
    exceptions_tx: Sender<PropagatedException>,
    exceptions_rx: Receiver<PropagatedException>,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        let (exceptions_tx, exceptions_rx) = unbounded();
        Self {
            config,
            registry: DriverRegistry::new(),
            exceptions_tx,
            exceptions_rx,
        }
    }

    /// Defaults everywhere; a fresh in-memory driver registry.
    pub fn single_process() -> Self {
        Self::new(Config::default())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// Open a direct (or backing-leaf) store from its options.
    pub fn direct_store<M>(
        &self,
        options: StoreOptions,
        model: M,
    ) -> Result<DirectStore<M>, StoreError>
    where
        M: CrdtModel,
        M::Data: Send + 'static,
    {
        if options.mode == StoreMode::ReferenceMode {
            return Err(StoreError::UnsupportedMode {
                requested: options.mode,
                supported: StoreMode::Direct,
            });
        }
        let driver = self
            .registry
            .driver::<M::Data>(&options.storage_key, options.existence)?;
        Ok(DirectStore::with_version_token(
            options.storage_key,
            Box::new(driver),
            model,
            options.version_token,
        ))
    }

    /// Open a reference-mode store wired to this runtime's registry and
    /// limits.
    pub fn reference_mode_store<C: ContainerModel>(
        &self,
        key: ReferenceModeStorageKey,
        existence: Existence,
    ) -> Result<ReferenceModeStore<C>, StoreError> {
        ReferenceModeStore::open_with_limits(
            key,
            self.registry.clone(),
            existence,
            self.config.limits,
        )
    }

    /// Report a fatal error to the host. Store- and CRDT-layer failures
    /// are never swallowed; whoever owns the runtime drains this channel.
    pub fn report_exception_in_host(&self, method: &'static str, error: Error) {
        tracing::error!(method, %error, "exception propagated to host");
        let _ = self.exceptions_tx.send(PropagatedException { method, error });
    }

    /// Drain everything reported so far.
    pub fn take_exceptions(&self) -> Vec<PropagatedException> {
        self.exceptions_rx.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{CrdtCount, CrdtError};
    use crate::storage::StorageKey;

    #[test]
    fn direct_store_honors_store_options() {
        let runtime = Runtime::single_process();
        let options = StoreOptions::new(
            StorageKey::parse("memory://counts").unwrap(),
            StoreMode::Direct,
        );
        let store = runtime.direct_store(options, CrdtCount::new()).unwrap();
        assert!(store.is_idle());

        let refmode_options = StoreOptions::new(
            StorageKey::parse("memory://counts").unwrap(),
            StoreMode::ReferenceMode,
        );
        assert!(matches!(
            runtime
                .direct_store(refmode_options, CrdtCount::new())
                .unwrap_err(),
            StoreError::UnsupportedMode { .. }
        ));
    }

    #[test]
    fn exceptions_are_delivered_in_order() {
        let runtime = Runtime::single_process();
        runtime.report_exception_in_host(
            "merge",
            Error::Crdt(CrdtError::Divergence {
                detail: "first".to_string(),
            }),
        );
        runtime.report_exception_in_host(
            "apply",
            Error::Crdt(CrdtError::Divergence {
                detail: "second".to_string(),
            }),
        );

        let drained = runtime.take_exceptions();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].method, "merge");
        assert_eq!(drained[1].method, "apply");
        assert!(runtime.take_exceptions().is_empty());
    }
}
