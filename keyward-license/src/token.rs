//! Signed activation and trial tokens.
//!
//! Tokens are Ed25519 envelopes issued by the licensing backend:
//! `base64url(payload_json).base64url(signature)`. [`TokenVerifier`] checks
//! the signature against the product's public key and only then decodes the
//! payload and compares its product id with the configured one.

use crate::error::{LicenseError, LicenseResult};
use crate::meter::MeterAttribute;
use keyward_crypto::{VerifyingKey, open_envelope};
use keyward_types::{ProductId, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the activation is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LicenseType {
    NodeLocked,
    HostedFloating,
}

impl std::fmt::Display for LicenseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NodeLocked => write!(f, "node-locked"),
            Self::HostedFloating => write!(f, "hosted-floating"),
        }
    }
}

/// Licensee details carried by an activation token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseUser {
    pub email: String,
    pub name: String,
    pub company: String,
    pub metadata: BTreeMap<String, String>,
}

/// Payload of a signed activation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationToken {
    pub activation_id: String,
    pub product_id: ProductId,
    pub license_key: String,
    pub license_type: LicenseType,
    /// Machine the token is bound to.
    pub fingerprint: String,
    pub issued_at: Timestamp,
    /// `None` for perpetual licenses.
    #[serde(default)]
    pub expires_at: Option<Timestamp>,
    /// Seconds between background syncs; 0 disables sync.
    #[serde(default)]
    pub server_sync_interval_secs: i64,
    /// Seconds a license stays valid without a successful sync; 0 disables the check.
    #[serde(default)]
    pub grace_period_secs: i64,
    #[serde(default)]
    pub user: LicenseUser,
    #[serde(default)]
    pub license_metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub activation_metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub meter_attributes: Vec<MeterAttribute>,
}

impl ActivationToken {
    /// True once `now` is past the expiry. The expiry second itself is still valid.
    #[must_use]
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }
}

/// Payload of a signed trial token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialToken {
    pub trial_id: String,
    pub product_id: ProductId,
    pub fingerprint: String,
    pub issued_at: Timestamp,
    pub expires_at: Timestamp,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl TrialToken {
    #[must_use]
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }
}

/// A token payload that names the product it was issued for.
pub trait ProductBound {
    fn product_id(&self) -> ProductId;
    fn fingerprint(&self) -> &str;
}

impl ProductBound for ActivationToken {
    fn product_id(&self) -> ProductId {
        self.product_id
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl ProductBound for TrialToken {
    fn product_id(&self) -> ProductId {
        self.product_id
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Verifies tokens for one product. Side-effect free.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    key: VerifyingKey,
    product_id: ProductId,
}

impl TokenVerifier {
    pub fn new(key: VerifyingKey, product_id: ProductId) -> Self {
        Self { key, product_id }
    }

    /// Verifies the signature, decodes the payload and checks the product id.
    pub fn verify<T>(&self, raw: &str) -> LicenseResult<T>
    where
        T: DeserializeOwned + ProductBound,
    {
        let token: T = open_envelope(raw, &self.key)?;
        if token.product_id() != self.product_id {
            return Err(LicenseError::ProductMismatch {
                expected: self.product_id.to_string(),
                actual: token.product_id().to_string(),
            });
        }
        Ok(token)
    }

    /// Like [`verify`](Self::verify), additionally requiring the token to be
    /// bound to `fingerprint`.
    pub fn verify_for_machine<T>(&self, raw: &str, fingerprint: &str) -> LicenseResult<T>
    where
        T: DeserializeOwned + ProductBound,
    {
        let token: T = self.verify(raw)?;
        if token.fingerprint() != fingerprint {
            return Err(LicenseError::MachineFingerprint);
        }
        Ok(token)
    }
}
