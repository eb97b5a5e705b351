//! Verified trials.
//!
//! A verified trial is backed by a server-signed [`TrialToken`] with a fixed
//! expiry. It is obtained online or through an offline request/response
//! exchange, and never while a paid license is active.

use crate::activation::lookup;
use crate::backend::TrialActivationRequest;
use crate::device::DeviceInfo;
use crate::engine::{EngineInner, EngineState, LicenseEngine};
use crate::error::{LicenseError, LicenseResult};
use crate::offline::{self, PendingRequest, RequestBody, ResponseBody};
use crate::token::TrialToken;
use keyward_types::Timestamp;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Persisted verified trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TrialRecord {
    /// Raw signed token.
    pub token: String,
    /// Latest wall-clock time observed while checking the trial.
    pub watermark: Timestamp,
}

impl EngineInner {
    fn install_trial(&self, state: &mut EngineState, raw: String) -> LicenseResult<()> {
        let now = self.now();
        let verifier = self.verifier(&state.config)?;
        let token: TrialToken = verifier.verify_for_machine(&raw, self.fingerprint.as_str())?;
        if now.plus_secs(self.settings.clock_tolerance_secs) < token.issued_at {
            return Err(LicenseError::TimeModified);
        }

        state.license.trial = Some(TrialRecord {
            token: raw,
            watermark: now.max(token.issued_at),
        });
        state.save_trial()?;

        if token.is_expired_at(now) {
            warn!("trial {} installed but expired", token.trial_id);
            return Err(LicenseError::TrialExpired);
        }
        info!("trial {} activated until {}", token.trial_id, token.expires_at);
        Ok(())
    }

    fn ensure_no_license(&self) -> LicenseResult<()> {
        match self.check_license() {
            Ok(_) => Err(LicenseError::AlreadyActivated),
            Err(_) => Ok(()),
        }
    }

    fn current_trial(&self) -> LicenseResult<TrialToken> {
        let state = self.read_state();
        let verifier = self.verifier(&state.config)?;
        let record = state
            .license
            .trial
            .as_ref()
            .ok_or(LicenseError::TrialNotActivated)?;
        verifier.verify_for_machine(&record.token, self.fingerprint.as_str())
    }
}

impl LicenseEngine {
    /// Starts a verified trial through the backend.
    pub async fn activate_trial(&self) -> LicenseResult<()> {
        self.inner.ensure_no_license()?;
        let device = DeviceInfo::collect();
        let request = {
            let state = self.inner.read_state();
            TrialActivationRequest {
                product_id: state.config.product()?.product_id,
                fingerprint: self.inner.fingerprint.as_str().to_string(),
                metadata: state.config.identity().trial_activation_metadata.clone(),
                app_version: state.config.app_version().map(str::to_string),
                device,
            }
        };

        info!("activating trial for product {}", request.product_id);
        let raw = self.inner.backend.activate_trial(&request).await.map_err(|e| {
            warn!("trial activation failed: {e}");
            LicenseError::from(e)
        })?;

        let mut state = self.inner.write_state();
        self.inner.install_trial(&mut state, raw)
    }

    /// Writes an offline trial activation request.
    pub fn generate_offline_trial_activation_request(
        &self,
        path: impl AsRef<Path>,
    ) -> LicenseResult<()> {
        self.inner.ensure_no_license()?;
        let device = DeviceInfo::collect();
        let bytes = {
            let mut guard = self.inner.write_state();
            let state = &mut *guard;
            let body = RequestBody::TrialActivation(TrialActivationRequest {
                product_id: state.config.product()?.product_id,
                fingerprint: self.inner.fingerprint.as_str().to_string(),
                metadata: state.config.identity().trial_activation_metadata.clone(),
                app_version: state.config.app_version().map(str::to_string),
                device,
            });
            let (request, bytes) = self.inner.emit_offline_request(state, body)?;
            state.license.pending_request = Some(PendingRequest::for_request(&request));
            state.save_pending_request()?;
            bytes
        };
        offline::write_file(path.as_ref(), &bytes)
    }

    /// Starts a verified trial from the backend's offline response file.
    pub fn activate_trial_offline(&self, path: impl AsRef<Path>) -> LicenseResult<()> {
        self.inner.ensure_no_license()?;
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
        let ResponseBody::TrialActivation { token } = response.body else {
            return Err(LicenseError::OfflineResponseFile(
                "not a trial activation response".to_string(),
            ));
        };

        let outcome = self.inner.install_trial(state, token);
        if matches!(outcome, Ok(()) | Err(LicenseError::TrialExpired)) {
            state.license.pending_request = None;
            state.save_pending_request()?;
        }
        outcome
    }

    /// Checks the stored trial token against the clock.
    pub fn is_trial_genuine(&self) -> LicenseResult<()> {
        let now = self.inner.now();
        let tolerance = self.inner.settings.clock_tolerance_secs;
        let mut guard = self.inner.write_state();
        let state = &mut *guard;

        let verifier = self.inner.verifier(&state.config)?;
        let record = state
            .license
            .trial
            .as_mut()
            .ok_or(LicenseError::TrialNotActivated)?;
        let token: TrialToken =
            verifier.verify_for_machine(&record.token, self.inner.fingerprint.as_str())?;

        if now.plus_secs(tolerance) < token.issued_at.max(record.watermark) {
            return Err(LicenseError::TimeModified);
        }
        if token.is_expired_at(now) {
            return Err(LicenseError::TrialExpired);
        }
        if now > record.watermark {
            record.watermark = now;
            if let Err(e) = state.save_trial() {
                warn!("failed to persist trial watermark: {e}");
            }
        }
        Ok(())
    }

    pub fn get_trial_expiry_date(&self) -> LicenseResult<Timestamp> {
        Ok(self.inner.current_trial()?.expires_at)
    }

    pub fn get_trial_id(&self) -> LicenseResult<String> {
        Ok(self.inner.current_trial()?.trial_id)
    }

    pub fn get_trial_activation_metadata(&self, key: &str) -> LicenseResult<String> {
        lookup(self.inner.current_trial()?.metadata, key)
    }
}
