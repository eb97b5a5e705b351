//! Paid license activation.
//!
//! ```text
//! Unactivated ─► Activating ─► Activated ─► Expired | Suspended | Revoked | GracePeriodOver | Restricted
//!                                  │
//!                                  ├─ deactivate (online) ──────────────► Deactivated
//!                                  └─ offline deactivation request ─► DeactivatedPendingSubmission ─► Deactivated
//! ```
//!
//! Online and offline activation both end in [`EngineInner::install_activation`],
//! which verifies the token and replaces any trial token.

use crate::backend::{ActivationRequest, BackendError, DeactivationRequest, MeterUsesReport, Rejection};
use crate::device::DeviceInfo;
use crate::engine::{EngineInner, EngineState, LicenseEngine};
use crate::error::{LicenseError, LicenseResult};
use crate::meter::{MeterAttribute, MeterLedger};
use crate::offline::{
    self, DeactivationProof, OfflineRequest, PendingRequest, RequestBody, ResponseBody,
};
use crate::status::StatusCode;
use crate::storage::RecordKey;
use crate::sync::{SyncState, ensure_sync_task, trigger_sync};
use crate::token::{ActivationToken, LicenseType};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use keyward_crypto::{KeyPair, SigningKey};
use keyward_types::{RequestNonce, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// How the stored activation was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMode {
    Online,
    Offline,
}

/// Observable activation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Unactivated,
    Activating,
    Activated,
    Expired,
    Suspended,
    Revoked,
    GracePeriodOver,
    /// The backend refused the last sync for the credentials or network origin.
    Restricted,
    /// A token is stored but fails local verification.
    Invalid,
    /// An offline deactivation request was generated; the backend has not confirmed it.
    DeactivatedPendingSubmission,
    Deactivated,
}

/// Persisted activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ActivationRecord {
    /// Raw signed token.
    pub token: String,
    pub activation_id: String,
    pub license_key: String,
    pub mode: ActivationMode,
    pub sync_interval_secs: i64,
    pub grace_period_secs: i64,
    pub ledger: MeterLedger,
    pub sync: SyncState,
    /// Terminal status pushed by the backend.
    #[serde(default)]
    pub terminal: Option<StatusCode>,
    /// Refusal from the last sync; cleared by the next successful one.
    #[serde(default)]
    pub restriction: Option<StatusCode>,
}

/// Offline deactivation awaiting the backend's proof.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PendingDeactivation {
    pub request: PendingRequest,
    pub activation_id: String,
    /// The request file, re-emitted if generation is repeated.
    pub file_b64: String,
}

/// Clears the activating flag when dropped, including when the activation
/// future is cancelled mid-request.
struct Activating<'a>(&'a EngineInner);

impl Drop for Activating<'_> {
    fn drop(&mut self) {
        self.0.write_state().license.activating = false;
    }
}

#[derive(Serialize, Deserialize)]
struct DeviceKeyRecord {
    secret_b64: String,
}

impl EngineInner {
    /// Verifies `raw` and stores it as the current activation.
    ///
    /// An expired token is stored, then reported as [`LicenseError::Expired`].
    pub(crate) fn install_activation(
        &self,
        state: &mut EngineState,
        raw: String,
        mode: ActivationMode,
    ) -> LicenseResult<()> {
        let now = self.now();
        let verifier = self.verifier(&state.config)?;
        let token: ActivationToken = verifier.verify_for_machine(&raw, self.fingerprint.as_str())?;
        if now.plus_secs(self.settings.clock_tolerance_secs) < token.issued_at {
            return Err(LicenseError::TimeModified);
        }

        let ledger = MeterLedger::from_snapshot(token.meter_attributes.clone());
        debug!("activation carries {} meter attributes", ledger.len());
        let mut sync = SyncState::new(now);
        sync.observe(token.issued_at);
        state.license.activation = Some(ActivationRecord {
            activation_id: token.activation_id.clone(),
            license_key: token.license_key.clone(),
            mode,
            sync_interval_secs: token.server_sync_interval_secs,
            grace_period_secs: token.grace_period_secs,
            ledger,
            sync,
            terminal: None,
            restriction: None,
            token: raw,
        });
        state.license.trial = None;
        state.license.pending_deactivation = None;
        state.license.deactivated = false;
        state.save_activation()?;
        state.save_trial()?;
        state.save_pending_deactivation()?;

        if let Some(expires_at) = token.expires_at.filter(|_| token.is_expired_at(now)) {
            warn!("activation {} installed but expired", token.activation_id);
            return Err(LicenseError::Expired(expires_at.to_rfc3339()));
        }
        info!(
            "license activated ({mode:?}), activation {}",
            token.activation_id
        );
        Ok(())
    }

    /// Local validity check shared by `is_license_valid` and `is_license_genuine`.
    pub(crate) fn check_license(&self) -> LicenseResult<ActivationToken> {
        let now = self.now();
        let tolerance = self.settings.clock_tolerance_secs;
        let mut guard = self.write_state();
        let state = &mut *guard;

        let verifier = self.verifier(&state.config)?;
        let record = state
            .license
            .activation
            .as_mut()
            .ok_or(LicenseError::NotActivated)?;
        let token: ActivationToken =
            verifier.verify_for_machine(&record.token, self.fingerprint.as_str())?;

        if let Some(err) = record.terminal.and_then(StatusCode::into_error) {
            return Err(err);
        }
        if let Some(err) = record.restriction.and_then(StatusCode::into_error) {
            return Err(err);
        }
        if now.plus_secs(tolerance) < token.issued_at || record.sync.rolled_back(now, tolerance) {
            warn!("system clock is behind the last observed time");
            return Err(LicenseError::TimeModified);
        }
        if let Some(expires_at) = token.expires_at.filter(|_| token.is_expired_at(now)) {
            return Err(LicenseError::Expired(expires_at.to_rfc3339()));
        }
        if record.mode == ActivationMode::Online
            && token.server_sync_interval_secs > 0
            && record.sync.grace_lapsed(now, record.grace_period_secs)
        {
            return Err(LicenseError::GracePeriodOver);
        }

        if record.sync.observe(now) {
            if let Err(e) = state.save_activation() {
                warn!("failed to persist activation watermark: {e}");
            }
        }
        Ok(token)
    }

    /// Verified stored token, regardless of expiry or sync state.
    pub(crate) fn current_token(&self) -> LicenseResult<ActivationToken> {
        let state = self.read_state();
        let verifier = self.verifier(&state.config)?;
        let record = state
            .license
            .activation
            .as_ref()
            .ok_or(LicenseError::NotActivated)?;
        verifier.verify_for_machine(&record.token, self.fingerprint.as_str())
    }

    /// Loads the device signing key, creating it on first use.
    pub(crate) fn device_key(&self, state: &EngineState) -> LicenseResult<SigningKey> {
        let store = state.store()?;
        if let Some(record) = store.load::<DeviceKeyRecord>(RecordKey::DeviceKey)? {
            let secret: Option<[u8; 32]> = URL_SAFE_NO_PAD
                .decode(&record.secret_b64)
                .ok()
                .and_then(|bytes| bytes.try_into().ok());
            match secret {
                Some(secret) => return Ok(SigningKey::from_bytes(&secret)),
                None => warn!("stored device key is malformed; generating a new one"),
            }
        }

        let pair = KeyPair::generate();
        store.save(
            RecordKey::DeviceKey,
            &DeviceKeyRecord {
                secret_b64: URL_SAFE_NO_PAD.encode(pair.signing_key.to_bytes()),
            },
        )?;
        debug!("generated device key");
        Ok(pair.signing_key)
    }

    /// Signs `body` into an offline request and records it as outstanding.
    pub(crate) fn emit_offline_request(
        &self,
        state: &mut EngineState,
        body: RequestBody,
    ) -> LicenseResult<(OfflineRequest, Vec<u8>)> {
        let device_key = self.device_key(state)?;
        let request = OfflineRequest {
            nonce: RequestNonce::new(),
            created_at: self.now(),
            device_key: device_key.verifying_key().to_base64(),
            body,
        };
        let bytes = offline::encode_request(&request, &device_key)?;
        Ok((request, bytes))
    }
}

impl LicenseEngine {
    // ── Activation ──────────────────────────────────────────────

    /// Activates the configured license key against the backend.
    pub async fn activate_license(&self) -> LicenseResult<()> {
        let device = DeviceInfo::collect();
        let request = {
            let mut state = self.inner.write_state();
            let product_id = state.config.product()?.product_id;
            let license_key = state.config.license_key()?.to_string();
            let identity = state.config.identity();
            let request = ActivationRequest {
                product_id,
                license_key,
                fingerprint: self.inner.fingerprint.as_str().to_string(),
                email: identity.credentials.as_ref().map(|c| c.email.clone()),
                password: identity.credentials.as_ref().map(|c| c.password.clone()),
                metadata: identity.activation_metadata.clone(),
                meter_attribute_uses: BTreeMap::new(),
                app_version: state.config.app_version().map(str::to_string),
                device,
            };
            state.license.activating = true;
            request
        };
        let activating = Activating(self.inner.as_ref());

        info!("activating license for product {}", request.product_id);
        let result = self.inner.backend.activate(&request).await;

        let outcome = {
            let mut guard = self.inner.write_state();
            match result {
                Ok(raw) => self
                    .inner
                    .install_activation(&mut guard, raw, ActivationMode::Online),
                Err(e) => {
                    warn!("activation failed: {e}");
                    Err(e.into())
                }
            }
        };
        drop(activating);
        if outcome.is_ok() {
            ensure_sync_task(&self.inner);
        }
        outcome
    }

    /// Writes an offline activation request for the configured license key.
    pub fn generate_offline_activation_request(&self, path: impl AsRef<Path>) -> LicenseResult<()> {
        let device = DeviceInfo::collect();
        let bytes = {
            let mut guard = self.inner.write_state();
            let state = &mut *guard;
            let body = RequestBody::Activation(ActivationRequest {
                product_id: state.config.product()?.product_id,
                license_key: state.config.license_key()?.to_string(),
                fingerprint: self.inner.fingerprint.as_str().to_string(),
                email: None,
                password: None,
                metadata: state.config.identity().activation_metadata.clone(),
                meter_attribute_uses: state.config.offline_meter_uses().clone(),
                app_version: state.config.app_version().map(str::to_string),
                device,
            });
            let (request, bytes) = self.inner.emit_offline_request(state, body)?;
            state.license.pending_request = Some(PendingRequest::for_request(&request));
            state.save_pending_request()?;
            bytes
        };
        offline::write_file(path.as_ref(), &bytes)?;
        info!("offline activation request written to {}", path.as_ref().display());
        Ok(())
    }

    /// Activates from the backend's offline response file.
    pub fn activate_license_offline(&self, path: impl AsRef<Path>) -> LicenseResult<()> {
        let bytes = offline::read_file(path.as_ref())?;
        let now = self.inner.now();
        let mut guard = self.inner.write_state();
        let state = &mut *guard;

        let response = offline::decode_response(&bytes, &state.config.product()?.public_key)?;
        offline::match_response(
            &response,
            state.license.pending_request.as_ref(),
            now,
            self.inner.settings.offline_response_max_age_secs,
        )?;
        let ResponseBody::Activation { token } = response.body else {
            return Err(LicenseError::OfflineResponseFile(
                "not an activation response".to_string(),
            ));
        };

        let outcome = self
            .inner
            .install_activation(state, token, ActivationMode::Offline);
        if matches!(outcome, Ok(()) | Err(LicenseError::Expired(_))) {
            state.license.pending_request = None;
            state.save_pending_request()?;
        }
        outcome
    }

    // ── Deactivation ────────────────────────────────────────────

    /// Frees the activation slot on the backend and removes the local token.
    ///
    /// Succeeds without contacting the backend when nothing is activated.
    pub async fn deactivate_license(&self) -> LicenseResult<()> {
        let request = {
            let state = self.inner.read_state();
            let product_id = state.config.product()?.product_id;
            let Some(record) = &state.license.activation else {
                debug!("no activation to deactivate");
                return Ok(());
            };
            DeactivationRequest {
                product_id,
                activation_id: record.activation_id.clone(),
                license_key: record.license_key.clone(),
                fingerprint: self.inner.fingerprint.as_str().to_string(),
            }
        };

        match self.inner.backend.deactivate(&request).await {
            Ok(()) => {}
            Err(BackendError::Rejected(Rejection::ActivationNotFound)) => {
                debug!("backend no longer knows activation {}", request.activation_id);
            }
            Err(e) => {
                warn!("deactivation failed: {e}");
                return Err(e.into());
            }
        }

        let mut state = self.inner.write_state();
        let same = state
            .license
            .activation
            .as_ref()
            .is_some_and(|r| r.activation_id == request.activation_id);
        if same {
            state.license.activation = None;
            state.license.deactivated = true;
            state.save_activation()?;
        }
        info!("activation {} deactivated", request.activation_id);
        Ok(())
    }

    /// Writes an offline deactivation request and invalidates the local
    /// activation immediately.
    ///
    /// Repeating the call after the activation is gone re-emits the same request.
    pub fn generate_offline_deactivation_request(
        &self,
        path: impl AsRef<Path>,
    ) -> LicenseResult<()> {
        let bytes = {
            let mut guard = self.inner.write_state();
            let state = &mut *guard;
            let product_id = state.config.product()?.product_id;

            match state.license.activation.clone() {
                Some(record) => {
                    let body = RequestBody::Deactivation(DeactivationRequest {
                        product_id,
                        activation_id: record.activation_id.clone(),
                        license_key: record.license_key.clone(),
                        fingerprint: self.inner.fingerprint.as_str().to_string(),
                    });
                    let (request, bytes) = self.inner.emit_offline_request(state, body)?;
                    state.license.pending_deactivation = Some(PendingDeactivation {
                        request: PendingRequest::for_request(&request),
                        activation_id: record.activation_id.clone(),
                        file_b64: URL_SAFE_NO_PAD.encode(&bytes),
                    });
                    state.license.activation = None;
                    state.save_pending_deactivation()?;
                    state.save_activation()?;
                    info!(
                        "activation {} deactivated locally; awaiting backend proof",
                        record.activation_id
                    );
                    bytes
                }
                None => {
                    let pending = state
                        .license
                        .pending_deactivation
                        .as_ref()
                        .ok_or(LicenseError::NotActivated)?;
                    URL_SAFE_NO_PAD.decode(&pending.file_b64).map_err(|e| {
                        LicenseError::Storage(format!("pending deactivation request: {e}"))
                    })?
                }
            }
        };
        offline::write_file(path.as_ref(), &bytes)
    }

    /// Consumes the backend's proof for the outstanding offline deactivation.
    pub fn complete_offline_deactivation(
        &self,
        path: impl AsRef<Path>,
    ) -> LicenseResult<DeactivationProof> {
        let bytes = offline::read_file(path.as_ref())?;
        let now = self.inner.now();
        let mut guard = self.inner.write_state();
        let state = &mut *guard;

        let response = offline::decode_response(&bytes, &state.config.product()?.public_key)?;
        let pending = state.license.pending_deactivation.as_ref();
        offline::match_response(
            &response,
            pending.map(|p| &p.request),
            now,
            self.inner.settings.offline_response_max_age_secs,
        )?;
        let ResponseBody::Deactivation { activation_id } = response.body else {
            return Err(LicenseError::OfflineResponseFile(
                "not a deactivation response".to_string(),
            ));
        };
        if pending.is_none_or(|p| p.activation_id != activation_id) {
            return Err(LicenseError::OfflineResponseFile(format!(
                "proof is for activation {activation_id}"
            )));
        }

        state.license.pending_deactivation = None;
        state.license.deactivated = true;
        state.save_pending_deactivation()?;
        info!("offline deactivation of {activation_id} confirmed");
        Ok(DeactivationProof {
            activation_id,
            nonce: response.nonce,
            issued_at: response.issued_at,
        })
    }

    // ── Validation ──────────────────────────────────────────────

    /// Local check of the stored activation, then a background sync when
    /// the activation still stands. The result never waits on the sync.
    pub fn is_license_genuine(&self) -> LicenseResult<()> {
        let result = self.inner.check_license().map(|_| ());
        let wants_sync = match &result {
            Ok(()) | Err(LicenseError::GracePeriodOver) => true,
            Err(e) => StatusCode::from(e).is_restriction(),
        };
        if wants_sync {
            trigger_sync(&self.inner);
        }
        result
    }

    /// Local check of the stored activation. Never touches the network.
    pub fn is_license_valid(&self) -> LicenseResult<()> {
        self.inner.check_license().map(|_| ())
    }

    /// Runs one sync now and returns its status. `None` if another sync is
    /// in flight or there is no online activation.
    pub async fn sync_now(&self) -> Option<StatusCode> {
        self.inner.sync_once().await
    }

    pub fn activation_state(&self) -> ActivationState {
        {
            let state = self.inner.read_state();
            if state.license.activating {
                return ActivationState::Activating;
            }
        }
        match self.inner.check_license() {
            Ok(_) => ActivationState::Activated,
            Err(LicenseError::Expired(_)) => ActivationState::Expired,
            Err(LicenseError::Suspended) => ActivationState::Suspended,
            Err(LicenseError::Revoked) => ActivationState::Revoked,
            Err(LicenseError::GracePeriodOver) => ActivationState::GracePeriodOver,
            Err(
                LicenseError::AuthenticationFailed
                | LicenseError::CountryRestricted
                | LicenseError::IpRestricted,
            ) => ActivationState::Restricted,
            Err(LicenseError::NotActivated) => {
                let state = self.inner.read_state();
                if state.license.pending_deactivation.is_some() {
                    ActivationState::DeactivatedPendingSubmission
                } else if state.license.deactivated {
                    ActivationState::Deactivated
                } else {
                    ActivationState::Unactivated
                }
            }
            Err(LicenseError::ProductIdNotSet) => ActivationState::Unactivated,
            Err(_) => ActivationState::Invalid,
        }
    }

    // ── Meter attributes ────────────────────────────────────────

    pub async fn increment_activation_meter_attribute_uses(
        &self,
        name: &str,
        uses: u64,
    ) -> LicenseResult<()> {
        self.update_meter(name, |ledger| ledger.increment(name, uses))
            .await
    }

    pub async fn decrement_activation_meter_attribute_uses(
        &self,
        name: &str,
        uses: u64,
    ) -> LicenseResult<()> {
        self.update_meter(name, |ledger| ledger.decrement(name, uses))
            .await
    }

    pub async fn reset_activation_meter_attribute_uses(&self, name: &str) -> LicenseResult<()> {
        self.update_meter(name, |ledger| ledger.reset(name)).await
    }

    /// Commits a ledger change locally, then reports it to the backend.
    ///
    /// The local value stands even if the report fails; the next sync
    /// carries it.
    async fn update_meter(
        &self,
        name: &str,
        op: impl FnOnce(&mut MeterLedger) -> LicenseResult<MeterAttribute>,
    ) -> LicenseResult<()> {
        self.inner.check_license()?;
        let report = {
            let mut guard = self.inner.write_state();
            let state = &mut *guard;
            let product_id = state.config.product()?.product_id;
            let record = state
                .license
                .activation
                .as_mut()
                .ok_or(LicenseError::NotActivated)?;
            let attribute = op(&mut record.ledger)?;
            let report = (record.mode == ActivationMode::Online).then(|| MeterUsesReport {
                product_id,
                activation_id: record.activation_id.clone(),
                fingerprint: self.inner.fingerprint.as_str().to_string(),
                attribute,
            });
            state.save_activation()?;
            report
        };

        let Some(report) = report else {
            return Ok(());
        };
        self.inner
            .backend
            .report_meter_uses(&report)
            .await
            .map_err(|e| {
                warn!("meter report for {name} failed: {e}");
                e.into_license_error(Some(name))
            })
    }

    // ── Licensed facts ──────────────────────────────────────────

    /// Allowed, total and per-activation uses of a meter attribute.
    pub fn get_license_meter_attribute(&self, name: &str) -> LicenseResult<MeterAttribute> {
        let state = self.inner.read_state();
        let record = state
            .license
            .activation
            .as_ref()
            .ok_or(LicenseError::NotActivated)?;
        record.ledger.get(name).cloned()
    }

    pub fn get_activation_meter_attribute_uses(&self, name: &str) -> LicenseResult<u64> {
        Ok(self.get_license_meter_attribute(name)?.uses)
    }

    pub fn get_license_key(&self) -> LicenseResult<String> {
        Ok(self.inner.current_token()?.license_key)
    }

    /// Expiry of the license; `None` for perpetual licenses.
    pub fn get_license_expiry_date(&self) -> LicenseResult<Option<Timestamp>> {
        Ok(self.inner.current_token()?.expires_at)
    }

    pub fn get_license_type(&self) -> LicenseResult<LicenseType> {
        Ok(self.inner.current_token()?.license_type)
    }

    pub fn get_license_user_email(&self) -> LicenseResult<String> {
        Ok(self.inner.current_token()?.user.email)
    }

    pub fn get_license_user_name(&self) -> LicenseResult<String> {
        Ok(self.inner.current_token()?.user.name)
    }

    pub fn get_license_user_company(&self) -> LicenseResult<String> {
        Ok(self.inner.current_token()?.user.company)
    }

    pub fn get_license_user_metadata(&self, key: &str) -> LicenseResult<String> {
        lookup(self.inner.current_token()?.user.metadata, key)
    }

    pub fn get_license_metadata(&self, key: &str) -> LicenseResult<String> {
        lookup(self.inner.current_token()?.license_metadata, key)
    }

    pub fn get_activation_metadata(&self, key: &str) -> LicenseResult<String> {
        lookup(self.inner.current_token()?.activation_metadata, key)
    }

    /// End of the server sync grace period; `None` when the license has none.
    pub fn get_server_sync_grace_period_expiry_date(&self) -> LicenseResult<Option<Timestamp>> {
        let state = self.inner.read_state();
        let record = state
            .license
            .activation
            .as_ref()
            .ok_or(LicenseError::NotActivated)?;
        Ok(record.sync.grace_expires_at(record.grace_period_secs))
    }
}

pub(crate) fn lookup(mut map: BTreeMap<String, String>, key: &str) -> LicenseResult<String> {
    map.remove(key)
        .ok_or_else(|| LicenseError::MetadataKeyNotFound(key.to_string()))
}
