//! Licensing backend abstraction.
//!
//! The engine talks to the backend only through [`LicenseBackend`]. The
//! default implementation is [`HttpBackend`]; tests substitute their own.

mod http;

pub use http::HttpBackend;

use crate::config::NetworkSettings;
use crate::device::DeviceInfo;
use crate::error::LicenseError;
use crate::meter::MeterAttribute;
use async_trait::async_trait;
use keyward_types::ProductId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Explicit refusals the backend can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rejection {
    LicenseKeyInvalid,
    Expired,
    Suspended,
    Revoked,
    ActivationLimitReached,
    DeactivationLimitReached,
    TrialActivationLimitReached,
    TrialExpired,
    ActivationNotFound,
    MachineFingerprint,
    AuthenticationFailed,
    CountryRestricted,
    IpRestricted,
    MeterAttributeNotFound,
    MeterAttributeUsesLimitReached,
}

/// Errors produced by a [`LicenseBackend`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("rate limited")]
    RateLimited,

    #[error("rejected: {0:?}")]
    Rejected(Rejection),
}

impl BackendError {
    /// Maps the error to the engine error, naming `attribute` for meter rejections.
    pub(crate) fn into_license_error(self, attribute: Option<&str>) -> LicenseError {
        let name = attribute.unwrap_or_default().to_string();
        match self {
            Self::Network(msg) => LicenseError::Network(msg),
            Self::Server(msg) => LicenseError::Server(msg),
            Self::RateLimited => LicenseError::RateLimited,
            Self::Rejected(rejection) => match rejection {
                Rejection::LicenseKeyInvalid => {
                    LicenseError::LicenseKey("rejected by server".to_string())
                }
                Rejection::Expired => LicenseError::Expired("server".to_string()),
                Rejection::Suspended => LicenseError::Suspended,
                Rejection::Revoked => LicenseError::Revoked,
                Rejection::ActivationLimitReached => LicenseError::ActivationLimit,
                Rejection::DeactivationLimitReached => LicenseError::DeactivationLimit,
                Rejection::TrialActivationLimitReached => LicenseError::TrialActivationLimit,
                Rejection::TrialExpired => LicenseError::TrialExpired,
                Rejection::ActivationNotFound => LicenseError::ActivationNotFound,
                Rejection::MachineFingerprint => LicenseError::MachineFingerprint,
                Rejection::AuthenticationFailed => LicenseError::AuthenticationFailed,
                Rejection::CountryRestricted => LicenseError::CountryRestricted,
                Rejection::IpRestricted => LicenseError::IpRestricted,
                Rejection::MeterAttributeNotFound => LicenseError::MeterAttributeNotFound(name),
                Rejection::MeterAttributeUsesLimitReached => {
                    LicenseError::MeterAttributeUsesLimitReached(name)
                }
            },
        }
    }
}

impl From<BackendError> for LicenseError {
    fn from(err: BackendError) -> Self {
        err.into_license_error(None)
    }
}

/// Result type for backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// License activation request, sent online or embedded in an offline request file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub product_id: ProductId,
    pub license_key: String,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Uses declared ahead of activation (offline requests only).
    #[serde(default)]
    pub meter_attribute_uses: BTreeMap<String, u64>,
    #[serde(default)]
    pub app_version: Option<String>,
    pub device: DeviceInfo,
}

/// Request to free an activation slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivationRequest {
    pub product_id: ProductId,
    pub activation_id: String,
    pub license_key: String,
    pub fingerprint: String,
}

/// Periodic re-validation of an activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub product_id: ProductId,
    pub activation_id: String,
    pub license_key: String,
    pub fingerprint: String,
    /// Local ledger, authoritative between syncs.
    pub meter_attributes: Vec<MeterAttribute>,
    #[serde(default)]
    pub app_version: Option<String>,
}

/// Verified trial activation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialActivationRequest {
    pub product_id: ProductId,
    pub fingerprint: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub app_version: Option<String>,
    pub device: DeviceInfo,
}

/// Report of a meter attribute's local value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterUsesReport {
    pub product_id: ProductId,
    pub activation_id: String,
    pub fingerprint: String,
    pub attribute: MeterAttribute,
}

/// Release update query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseQuery {
    pub product_id: ProductId,
    pub platform: String,
    pub version: String,
    pub channel: String,
    #[serde(default)]
    pub license_key: Option<String>,
}

/// Release update answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub update_available: bool,
    #[serde(default)]
    pub latest_version: Option<String>,
}

/// Licensing backend.
///
/// Token-returning calls return the raw signed envelope; the engine verifies it.
#[async_trait]
pub trait LicenseBackend: Send + Sync {
    /// Activates a license key on this machine.
    async fn activate(&self, request: &ActivationRequest) -> BackendResult<String>;

    /// Frees the activation slot.
    async fn deactivate(&self, request: &DeactivationRequest) -> BackendResult<()>;

    /// Re-validates an activation and returns a fresh token.
    async fn sync_activation(&self, request: &SyncRequest) -> BackendResult<String>;

    /// Starts a verified trial on this machine.
    async fn activate_trial(&self, request: &TrialActivationRequest) -> BackendResult<String>;

    /// Reports a meter attribute's local value.
    async fn report_meter_uses(&self, report: &MeterUsesReport) -> BackendResult<()>;

    /// Checks whether a newer release exists.
    async fn check_release(&self, query: &ReleaseQuery) -> BackendResult<ReleaseInfo>;

    /// Applies proxy and host changes. Backends without a transport ignore them.
    fn apply_network_settings(&self, _settings: &NetworkSettings) -> BackendResult<()> {
        Ok(())
    }
}
