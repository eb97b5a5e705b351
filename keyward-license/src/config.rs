//! Engine configuration and the identity/configuration store.
//!
//! [`EngineConfig`] holds process-level tunables fixed at engine build time.
//! [`ConfigStore`] holds what the host application sets at runtime: product
//! identity, license key, credentials, metadata and network settings. Every
//! setter validates first and mutates only on success.

use crate::error::{LicenseError, LicenseResult};
use keyward_crypto::{KdfParams, VerifyingKey};
use keyward_types::ProductId;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default backend host.
pub const DEFAULT_HOST_URL: &str = "https://api.keyward.dev";

/// Maximum length in bytes of a metadata key or value.
pub const MAX_METADATA_LEN: usize = 256;

/// Maximum number of activation or trial activation metadata entries.
pub const MAX_METADATA_ENTRIES: usize = 21;

/// Maximum length in bytes of the app version string.
pub const MAX_APP_VERSION_LEN: usize = 256;

/// Maximum length in bytes of a license key.
pub const MAX_LICENSE_KEY_LEN: usize = 256;

/// Process-level engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backend host used until `set_host_url` overrides it.
    pub host_url: String,
    /// Per-request timeout for backend calls.
    pub request_timeout_secs: u64,
    /// Offline response files signed longer ago than this are rejected.
    pub offline_response_max_age_secs: i64,
    /// Backward clock movement tolerated before reporting tampering.
    pub clock_tolerance_secs: i64,
    /// The same for the local trial watermark. Any rollback counts by default.
    pub local_trial_clock_tolerance_secs: i64,
    /// Lower bound on the server sync interval a token may request.
    pub min_sync_interval_secs: i64,
    /// Overrides the platform directory for user and system scoped stores.
    pub storage_dir: Option<PathBuf>,
    /// Cost parameters for the store key derivation.
    pub kdf: KdfParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host_url: DEFAULT_HOST_URL.to_string(),
            request_timeout_secs: 30,
            offline_response_max_age_secs: 30 * 86_400,
            clock_tolerance_secs: 300,
            local_trial_clock_tolerance_secs: 0,
            min_sync_interval_secs: 60,
            storage_dir: None,
            kdf: KdfParams::default(),
        }
    }
}

/// Where activation state persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageScope {
    /// Per-user data directory.
    User,
    /// Machine-wide directory; requires write permission to it.
    System,
    /// Nothing is persisted beyond the process lifetime.
    InMemory,
}

/// Product descriptor as shipped with the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDescriptor {
    pub product_id: ProductId,
    /// Standard-base64 Ed25519 public key that signs this product's tokens.
    pub public_key: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ProductDescriptor {
    /// Parses and validates descriptor JSON.
    pub fn parse(data: &str) -> LicenseResult<Self> {
        let descriptor: Self = serde_json::from_str(data.trim())
            .map_err(|e| LicenseError::ProductData(e.to_string()))?;
        descriptor.verifying_key()?;
        for (key, value) in &descriptor.metadata {
            validate_metadata_entry(key, value)?;
        }
        Ok(descriptor)
    }

    /// Decodes the embedded public key.
    pub fn verifying_key(&self) -> LicenseResult<VerifyingKey> {
        VerifyingKey::from_base64(&self.public_key)
            .map_err(|e| LicenseError::ProductData(e.to_string()))
    }
}

/// Where the product descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DescriptorSource {
    File,
    Data,
}

/// Product identity, fixed once set.
#[derive(Debug, Clone)]
pub struct ProductConfig {
    pub product_id: ProductId,
    pub scope: StorageScope,
    pub public_key: VerifyingKey,
    pub metadata: BTreeMap<String, String>,
}

/// Email and password for licenses that require user authentication.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCredentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// License-side identity supplied by the host application.
#[derive(Debug, Clone, Default)]
pub struct LicenseIdentity {
    pub license_key: Option<String>,
    pub credentials: Option<UserCredentials>,
    pub activation_metadata: BTreeMap<String, String>,
    pub trial_activation_metadata: BTreeMap<String, String>,
}

/// Proxy and host overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSettings {
    /// Proxy URL, normalized to carry a scheme.
    pub proxy: Option<String>,
    /// Backend host override.
    pub host_url: Option<String>,
}

/// Runtime configuration set by the host application.
#[derive(Debug, Default)]
pub struct ConfigStore {
    descriptor: Option<(DescriptorSource, ProductDescriptor)>,
    product: Option<ProductConfig>,
    identity: LicenseIdentity,
    network: NetworkSettings,
    app_version: Option<String>,
    offline_meter_uses: BTreeMap<String, u64>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_descriptor(
        &mut self,
        source: DescriptorSource,
        descriptor: ProductDescriptor,
    ) -> LicenseResult<()> {
        if self.product.is_some() {
            return Err(LicenseError::ProductAlreadySet);
        }
        if let Some((existing, _)) = &self.descriptor {
            if *existing != source {
                let msg = "product file and product data are mutually exclusive".to_string();
                return Err(match source {
                    DescriptorSource::File => LicenseError::ProductFile(msg),
                    DescriptorSource::Data => LicenseError::ProductData(msg),
                });
            }
        }
        self.descriptor = Some((source, descriptor));
        Ok(())
    }

    /// Fixes the product identity. `fallback_key` is used when no
    /// descriptor was loaded.
    pub(crate) fn set_product(
        &mut self,
        product_id: &str,
        scope: StorageScope,
        fallback_key: Option<VerifyingKey>,
    ) -> LicenseResult<()> {
        let product_id = ProductId::parse(product_id)
            .map_err(|e| LicenseError::InvalidProductId(e.to_string()))?;

        if let Some(existing) = &self.product {
            if existing.product_id == product_id && existing.scope == scope {
                return Ok(());
            }
            return Err(LicenseError::ProductAlreadySet);
        }

        let (public_key, metadata) = match &self.descriptor {
            Some((_, descriptor)) => {
                if descriptor.product_id != product_id {
                    return Err(LicenseError::InvalidProductId(format!(
                        "{product_id} does not match descriptor product {}",
                        descriptor.product_id
                    )));
                }
                (descriptor.verifying_key()?, descriptor.metadata.clone())
            }
            None => match fallback_key {
                Some(key) => (key, BTreeMap::new()),
                None => {
                    return Err(LicenseError::ProductData(
                        "no product descriptor or public key configured".to_string(),
                    ));
                }
            },
        };

        self.product = Some(ProductConfig {
            product_id,
            scope,
            public_key,
            metadata,
        });
        Ok(())
    }

    pub fn product(&self) -> LicenseResult<&ProductConfig> {
        self.product.as_ref().ok_or(LicenseError::ProductIdNotSet)
    }

    pub fn identity(&self) -> &LicenseIdentity {
        &self.identity
    }

    pub fn network(&self) -> &NetworkSettings {
        &self.network
    }

    pub fn app_version(&self) -> Option<&str> {
        self.app_version.as_deref()
    }

    pub fn offline_meter_uses(&self) -> &BTreeMap<String, u64> {
        &self.offline_meter_uses
    }

    pub fn license_key(&self) -> LicenseResult<&str> {
        self.identity
            .license_key
            .as_deref()
            .ok_or_else(|| LicenseError::LicenseKey("license key not set".to_string()))
    }

    pub fn set_license_key(&mut self, key: &str) -> LicenseResult<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(LicenseError::LicenseKey("license key is empty".to_string()));
        }
        if key.len() > MAX_LICENSE_KEY_LEN {
            return Err(LicenseError::LicenseKey(format!(
                "license key longer than {MAX_LICENSE_KEY_LEN} bytes"
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(LicenseError::LicenseKey(
                "license key contains control characters".to_string(),
            ));
        }
        self.identity.license_key = Some(key.to_string());
        Ok(())
    }

    pub fn set_credentials(&mut self, email: &str, password: &str) -> LicenseResult<()> {
        let email = email.trim();
        let well_formed = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !well_formed || email.len() > MAX_METADATA_LEN {
            return Err(LicenseError::Credentials(format!("malformed email: {email}")));
        }
        if password.is_empty() || password.len() > MAX_METADATA_LEN {
            return Err(LicenseError::Credentials(
                "password must be 1 to 256 bytes".to_string(),
            ));
        }
        self.identity.credentials = Some(UserCredentials {
            email: email.to_string(),
            password: password.to_string(),
        });
        Ok(())
    }

    pub fn set_activation_metadata(&mut self, key: &str, value: &str) -> LicenseResult<()> {
        insert_metadata(
            &mut self.identity.activation_metadata,
            key,
            value,
            LicenseError::ActivationMetadataLimit(MAX_METADATA_ENTRIES),
        )
    }

    pub fn set_trial_activation_metadata(&mut self, key: &str, value: &str) -> LicenseResult<()> {
        insert_metadata(
            &mut self.identity.trial_activation_metadata,
            key,
            value,
            LicenseError::TrialActivationMetadataLimit(MAX_METADATA_ENTRIES),
        )
    }

    pub fn set_app_version(&mut self, version: &str) -> LicenseResult<()> {
        if version.len() > MAX_APP_VERSION_LEN {
            return Err(LicenseError::AppVersionLength {
                max: MAX_APP_VERSION_LEN,
                actual: version.len(),
            });
        }
        self.app_version = Some(version.to_string());
        Ok(())
    }

    /// Pre-declares meter uses embedded in the next offline activation request.
    pub fn set_offline_meter_uses(&mut self, name: &str, uses: u64) -> LicenseResult<()> {
        validate_metadata_key(name)?;
        self.offline_meter_uses.insert(name.to_string(), uses);
        Ok(())
    }

    /// Sets or clears (empty string) the network proxy.
    pub fn set_proxy(&mut self, proxy: &str) -> LicenseResult<()> {
        let proxy = proxy.trim();
        self.network.proxy = if proxy.is_empty() {
            None
        } else {
            Some(normalize_proxy(proxy)?)
        };
        Ok(())
    }

    /// Sets or clears (empty string) the backend host override.
    pub fn set_host_url(&mut self, host: &str) -> LicenseResult<()> {
        let host = host.trim();
        self.network.host_url = if host.is_empty() {
            None
        } else {
            Some(normalize_host_url(host)?)
        };
        Ok(())
    }
}

fn insert_metadata(
    map: &mut BTreeMap<String, String>,
    key: &str,
    value: &str,
    limit_error: LicenseError,
) -> LicenseResult<()> {
    validate_metadata_entry(key, value)?;
    if !map.contains_key(key) && map.len() >= MAX_METADATA_ENTRIES {
        return Err(limit_error);
    }
    map.insert(key.to_string(), value.to_string());
    Ok(())
}

fn validate_metadata_key(key: &str) -> LicenseResult<()> {
    if key.is_empty() || key.len() > MAX_METADATA_LEN {
        return Err(LicenseError::MetadataKeyLength {
            max: MAX_METADATA_LEN,
            actual: key.len(),
        });
    }
    Ok(())
}

/// Validates one metadata key/value pair against the length limits.
pub fn validate_metadata_entry(key: &str, value: &str) -> LicenseResult<()> {
    validate_metadata_key(key)?;
    if value.len() > MAX_METADATA_LEN {
        return Err(LicenseError::MetadataValueLength {
            max: MAX_METADATA_LEN,
            actual: value.len(),
        });
    }
    Ok(())
}

/// Normalizes `[protocol://][user:pass@]host[:port]` to a full proxy URL.
pub fn normalize_proxy(proxy: &str) -> LicenseResult<String> {
    let with_scheme = if proxy.contains("://") {
        proxy.to_string()
    } else {
        format!("http://{proxy}")
    };
    let url = Url::parse(&with_scheme).map_err(|e| LicenseError::NetProxy(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https" | "socks5" | "socks5h") {
        return Err(LicenseError::NetProxy(format!(
            "unsupported scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(LicenseError::NetProxy("missing host".to_string()));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(LicenseError::NetProxy("proxy must not carry a path".to_string()));
    }
    Ok(with_scheme)
}

/// Validates an http(s) host URL and strips any trailing slash.
pub fn normalize_host_url(host: &str) -> LicenseResult<String> {
    let url = Url::parse(host).map_err(|e| LicenseError::HostUrl(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LicenseError::HostUrl(format!(
            "unsupported scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(LicenseError::HostUrl("missing host".to_string()));
    }
    Ok(host.trim_end_matches('/').to_string())
}
