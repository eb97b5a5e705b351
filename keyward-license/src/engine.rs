//! The licensing engine context object.
//!
//! One [`LicenseEngine`] holds all configuration and license state for a
//! process. Clones share the same state. All mutable state sits behind a
//! single lock that is never held across a backend call.

use crate::activation::{ActivationRecord, PendingDeactivation};
use crate::backend::{HttpBackend, LicenseBackend};
use crate::config::{
    ConfigStore, DescriptorSource, EngineConfig, NetworkSettings, ProductDescriptor,
    StorageScope, normalize_host_url, normalize_proxy,
};
use crate::device::DeviceFingerprint;
use crate::error::{LicenseError, LicenseResult};
use crate::local_trial::LocalTrialState;
use crate::offline::PendingRequest;
use crate::status::StatusCode;
use crate::storage::{FileStore, MemoryStore, RecordKey, RecordStore, SecureStore};
use crate::sync::{StatusSink, SyncScheduler, ensure_sync_task};
use crate::token::TokenVerifier;
use crate::trial::TrialRecord;
use keyward_crypto::VerifyingKey;
use keyward_types::{Clock, ProductId, SystemClock, Timestamp};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Everything persisted for one product.
#[derive(Debug, Default)]
pub(crate) struct LicenseState {
    pub activation: Option<ActivationRecord>,
    pub trial: Option<TrialRecord>,
    pub local_trial: Option<LocalTrialState>,
    pub pending_request: Option<PendingRequest>,
    pub pending_deactivation: Option<PendingDeactivation>,
    /// An online activation is waiting on the backend.
    pub activating: bool,
    /// The last activation was deactivated in this process.
    pub deactivated: bool,
}

impl LicenseState {
    fn load(store: &SecureStore) -> LicenseResult<Self> {
        Ok(Self {
            activation: store.load(RecordKey::Activation)?,
            trial: store.load(RecordKey::Trial)?,
            local_trial: store.load(RecordKey::LocalTrial)?,
            pending_request: store.load(RecordKey::PendingRequest)?,
            pending_deactivation: store.load(RecordKey::PendingDeactivation)?,
            activating: false,
            deactivated: false,
        })
    }
}

/// Configuration plus license state, guarded by one lock.
#[derive(Debug, Default)]
pub(crate) struct EngineState {
    pub config: ConfigStore,
    pub store: Option<SecureStore>,
    pub license: LicenseState,
}

impl EngineState {
    pub fn store(&self) -> LicenseResult<&SecureStore> {
        self.store.as_ref().ok_or(LicenseError::ProductIdNotSet)
    }

    pub fn save_activation(&self) -> LicenseResult<()> {
        self.store()?
            .put(RecordKey::Activation, self.license.activation.as_ref())
    }

    pub fn save_trial(&self) -> LicenseResult<()> {
        self.store()?.put(RecordKey::Trial, self.license.trial.as_ref())
    }

    pub fn save_local_trial(&self) -> LicenseResult<()> {
        self.store()?
            .put(RecordKey::LocalTrial, self.license.local_trial.as_ref())
    }

    pub fn save_pending_request(&self) -> LicenseResult<()> {
        self.store()?
            .put(RecordKey::PendingRequest, self.license.pending_request.as_ref())
    }

    pub fn save_pending_deactivation(&self) -> LicenseResult<()> {
        self.store()?.put(
            RecordKey::PendingDeactivation,
            self.license.pending_deactivation.as_ref(),
        )
    }
}

pub(crate) struct EngineInner {
    pub settings: EngineConfig,
    pub clock: Arc<dyn Clock>,
    pub backend: Arc<dyn LicenseBackend>,
    pub fingerprint: DeviceFingerprint,
    fallback_key: Option<VerifyingKey>,
    state: RwLock<EngineState>,
    pub scheduler: SyncScheduler,
    pub events: StatusSink,
}

impl EngineInner {
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn read_state(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn write_state(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn verifier(&self, config: &ConfigStore) -> LicenseResult<TokenVerifier> {
        let product = config.product()?;
        Ok(TokenVerifier::new(product.public_key, product.product_id))
    }

    fn open_store(&self, product_id: &ProductId, scope: StorageScope) -> LicenseResult<SecureStore> {
        let backend: Box<dyn RecordStore> = match scope {
            StorageScope::InMemory => Box::new(MemoryStore::new()),
            StorageScope::User | StorageScope::System => {
                let store =
                    FileStore::for_scope(scope, product_id, self.settings.storage_dir.as_deref())?;
                debug!("license store at {}", store.dir().display());
                Box::new(store)
            }
        };
        SecureStore::new(
            backend,
            product_id,
            self.fingerprint.as_str(),
            &self.settings.kdf,
        )
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        self.events.shutdown();
    }
}

/// Builder for [`LicenseEngine`].
#[derive(Default)]
pub struct LicenseEngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    backend: Option<Arc<dyn LicenseBackend>>,
    fingerprint: Option<DeviceFingerprint>,
    public_key: Option<VerifyingKey>,
}

impl LicenseEngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn LicenseBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Overrides the machine fingerprint (defaults to [`DeviceFingerprint::generate`]).
    #[must_use]
    pub fn fingerprint(mut self, fingerprint: DeviceFingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    /// Public key used when no product descriptor is loaded.
    #[must_use]
    pub fn public_key(mut self, key: VerifyingKey) -> Self {
        self.public_key = Some(key);
        self
    }

    pub fn build(self) -> LicenseResult<LicenseEngine> {
        let backend: Arc<dyn LicenseBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(HttpBackend::new(&self.config)?),
        };
        let inner = EngineInner {
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>),
            backend,
            fingerprint: self.fingerprint.unwrap_or_else(DeviceFingerprint::generate),
            fallback_key: self.public_key,
            state: RwLock::new(EngineState::default()),
            scheduler: SyncScheduler::default(),
            events: StatusSink::new(),
            settings: self.config,
        };
        Ok(LicenseEngine {
            inner: Arc::new(inner),
        })
    }
}

/// Licensing engine for one product.
#[derive(Clone)]
pub struct LicenseEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl std::fmt::Debug for LicenseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseEngine")
            .field("fingerprint", &self.inner.fingerprint)
            .finish_non_exhaustive()
    }
}

impl LicenseEngine {
    pub fn builder() -> LicenseEngineBuilder {
        LicenseEngineBuilder::default()
    }

    /// Machine fingerprint activations are bound to.
    pub fn fingerprint(&self) -> &DeviceFingerprint {
        &self.inner.fingerprint
    }

    // ── Product identity ────────────────────────────────────────

    /// Loads the product descriptor from a JSON file.
    pub fn set_product_file(&self, path: impl AsRef<Path>) -> LicenseResult<()> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| LicenseError::ProductFile(format!("{}: {e}", path.display())))?;
        let descriptor = ProductDescriptor::parse(&data).map_err(|e| match e {
            LicenseError::ProductData(msg) => LicenseError::ProductFile(msg),
            other => other,
        })?;
        self.inner
            .write_state()
            .config
            .set_descriptor(DescriptorSource::File, descriptor)
    }

    /// Loads the product descriptor from embedded JSON.
    pub fn set_product_data(&self, data: &str) -> LicenseResult<()> {
        let descriptor = ProductDescriptor::parse(data)?;
        self.inner
            .write_state()
            .config
            .set_descriptor(DescriptorSource::Data, descriptor)
    }

    /// Fixes the product id and storage scope, loading any persisted state.
    pub fn set_product_id(&self, product_id: &str, scope: StorageScope) -> LicenseResult<()> {
        let parsed = ProductId::parse(product_id)
            .map_err(|e| LicenseError::InvalidProductId(e.to_string()))?;
        {
            let mut guard = self.inner.write_state();
            let state = &mut *guard;

            let store = match state.store {
                Some(_) => None,
                None => Some(self.inner.open_store(&parsed, scope)?),
            };
            state
                .config
                .set_product(product_id, scope, self.inner.fallback_key)?;

            if let Some(store) = store {
                state.license = LicenseState::load(&store)?;
                state.store = Some(store);
                info!(
                    "product {parsed} configured ({scope:?}); activation present: {}",
                    state.license.activation.is_some()
                );
            }
        }
        ensure_sync_task(&self.inner);
        Ok(())
    }

    // ── License identity ────────────────────────────────────────

    pub fn set_license_key(&self, license_key: &str) -> LicenseResult<()> {
        self.inner.write_state().config.set_license_key(license_key)
    }

    pub fn set_license_user_credential(&self, email: &str, password: &str) -> LicenseResult<()> {
        self.inner
            .write_state()
            .config
            .set_credentials(email, password)
    }

    /// Registers the callback that receives background sync outcomes.
    pub fn set_license_callback<F>(&self, callback: F)
    where
        F: Fn(StatusCode) + Send + Sync + 'static,
    {
        self.inner.events.set_callback(Arc::new(callback));
    }

    pub fn set_activation_metadata(&self, key: &str, value: &str) -> LicenseResult<()> {
        self.inner
            .write_state()
            .config
            .set_activation_metadata(key, value)
    }

    pub fn set_trial_activation_metadata(&self, key: &str, value: &str) -> LicenseResult<()> {
        self.inner
            .write_state()
            .config
            .set_trial_activation_metadata(key, value)
    }

    pub fn set_app_version(&self, version: &str) -> LicenseResult<()> {
        self.inner.write_state().config.set_app_version(version)
    }

    /// Declares meter uses to embed in the next offline activation request.
    pub fn set_offline_activation_request_meter_attribute_uses(
        &self,
        name: &str,
        uses: u64,
    ) -> LicenseResult<()> {
        self.inner
            .write_state()
            .config
            .set_offline_meter_uses(name, uses)
    }

    // ── Network ─────────────────────────────────────────────────

    /// Sets the proxy (`[protocol://][user:pass@]host[:port]`); empty clears it.
    pub fn set_network_proxy(&self, proxy: &str) -> LicenseResult<()> {
        let proxy = proxy.trim();
        let normalized = if proxy.is_empty() {
            None
        } else {
            Some(normalize_proxy(proxy)?)
        };
        self.update_network(|settings| settings.proxy = normalized, |config| {
            config.set_proxy(proxy)
        })
        .map_err(|e| match e {
            LicenseError::Network(msg) => LicenseError::NetProxy(msg),
            other => other,
        })
    }

    /// Overrides the backend host; empty restores the default.
    pub fn set_host_url(&self, host: &str) -> LicenseResult<()> {
        let host = host.trim();
        let normalized = if host.is_empty() {
            None
        } else {
            Some(normalize_host_url(host)?)
        };
        self.update_network(|settings| settings.host_url = normalized, |config| {
            config.set_host_url(host)
        })
        .map_err(|e| match e {
            LicenseError::Network(msg) => LicenseError::HostUrl(msg),
            other => other,
        })
    }

    fn update_network(
        &self,
        change: impl FnOnce(&mut NetworkSettings),
        commit: impl FnOnce(&mut ConfigStore) -> LicenseResult<()>,
    ) -> LicenseResult<()> {
        let mut state = self.inner.write_state();
        let mut settings = state.config.network().clone();
        change(&mut settings);
        self.inner.backend.apply_network_settings(&settings)?;
        commit(&mut state.config)?;
        debug!("network settings updated: {settings:?}");
        Ok(())
    }

    // ── Product facts ───────────────────────────────────────────

    pub fn get_product_metadata(&self, key: &str) -> LicenseResult<String> {
        let state = self.inner.read_state();
        state
            .config
            .product()?
            .metadata
            .get(key)
            .cloned()
            .ok_or_else(|| LicenseError::MetadataKeyNotFound(key.to_string()))
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Clears activation and verified-trial state. The local trial and the
    /// device key survive.
    pub fn reset(&self) -> LicenseResult<()> {
        let mut guard = self.inner.write_state();
        let state = &mut *guard;
        state.store()?;

        state.license.activation = None;
        state.license.trial = None;
        state.license.pending_request = None;
        state.license.pending_deactivation = None;
        state.license.deactivated = false;

        state.save_activation()?;
        state.save_trial()?;
        state.save_pending_request()?;
        state.save_pending_deactivation()?;
        info!("license state reset");
        Ok(())
    }

    /// Stops background sync and callback dispatch.
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
        self.inner.events.shutdown();
        debug!("license engine shut down");
    }
}
