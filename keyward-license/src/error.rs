//! Error types for the licensing engine.
//!
//! Every public operation resolves to exactly one outcome: `Ok` or one of
//! the variants below. Variants group into configuration, entitlement,
//! transient and integrity failures; see [`LicenseError::is_transient`].

use thiserror::Error;

/// Licensing-specific errors.
#[derive(Debug, Error)]
pub enum LicenseError {
    // ── Configuration ────────────────────────────────────────────
    /// No product id has been configured yet.
    #[error("product id not set")]
    ProductIdNotSet,

    /// Product id is malformed or disagrees with the product descriptor.
    #[error("invalid product id: {0}")]
    InvalidProductId(String),

    /// Product identity was already set for this process.
    #[error("product identity already set")]
    ProductAlreadySet,

    /// Embedded product data is malformed.
    #[error("invalid product data: {0}")]
    ProductData(String),

    /// Product file could not be read or parsed.
    #[error("invalid product file: {0}")]
    ProductFile(String),

    /// Path is missing or unusable.
    #[error("invalid file path: {0}")]
    FilePath(String),

    /// File could not be written.
    #[error("file permission denied: {0}")]
    FilePermission(String),

    /// The system-wide store cannot be written by this process.
    #[error("insufficient system permission: {0}")]
    SystemPermission(String),

    /// License key missing or malformed.
    #[error("invalid license key: {0}")]
    LicenseKey(String),

    /// User credentials malformed.
    #[error("invalid user credentials: {0}")]
    Credentials(String),

    /// Metadata key exceeds the length limit.
    #[error("metadata key too long (max {max} bytes, got {actual})")]
    MetadataKeyLength { max: usize, actual: usize },

    /// Metadata value exceeds the length limit.
    #[error("metadata value too long (max {max} bytes, got {actual})")]
    MetadataValueLength { max: usize, actual: usize },

    /// Too many activation metadata entries.
    #[error("activation metadata limit reached (max {0})")]
    ActivationMetadataLimit(usize),

    /// Too many trial activation metadata entries.
    #[error("trial activation metadata limit reached (max {0})")]
    TrialActivationMetadataLimit(usize),

    /// App version exceeds the length limit.
    #[error("app version too long (max {max} bytes, got {actual})")]
    AppVersionLength { max: usize, actual: usize },

    /// Proxy string is malformed.
    #[error("invalid network proxy: {0}")]
    NetProxy(String),

    /// Host URL is malformed.
    #[error("invalid host url: {0}")]
    HostUrl(String),

    /// Release version string is malformed.
    #[error("invalid release version format: {0}")]
    ReleaseVersionFormat(String),

    // ── Entitlement ──────────────────────────────────────────────
    /// License has expired.
    #[error("license expired on {0}")]
    Expired(String),

    /// License is suspended.
    #[error("license suspended")]
    Suspended,

    /// License has been revoked.
    #[error("license has been revoked")]
    Revoked,

    /// Server sync failed for longer than the grace period.
    #[error("server sync grace period is over")]
    GracePeriodOver,

    /// Verified trial has expired.
    #[error("trial expired")]
    TrialExpired,

    /// Local trial has expired.
    #[error("local trial expired")]
    LocalTrialExpired,

    /// License not activated.
    #[error("license not activated")]
    NotActivated,

    /// Trial not activated.
    #[error("trial not activated")]
    TrialNotActivated,

    /// A paid license is already active; trials are not started over it.
    #[error("license already activated")]
    AlreadyActivated,

    /// Activation limit of the license is reached.
    #[error("activation limit reached")]
    ActivationLimit,

    /// Deactivation limit of the license is reached.
    #[error("deactivation limit reached")]
    DeactivationLimit,

    /// Trial activation limit for the product is reached.
    #[error("trial activation limit reached")]
    TrialActivationLimit,

    /// The backend no longer knows this activation.
    #[error("activation not found")]
    ActivationNotFound,

    /// Meter attribute would exceed its allowed uses.
    #[error("meter attribute uses limit reached: {0}")]
    MeterAttributeUsesLimitReached(String),

    /// Meter attribute does not exist in the current activation.
    #[error("meter attribute not found: {0}")]
    MeterAttributeNotFound(String),

    /// Metadata key does not exist.
    #[error("metadata key not found: {0}")]
    MetadataKeyNotFound(String),

    // ── Policy rejections ────────────────────────────────────────
    /// Backend rejected the user credentials.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Request came from a restricted country.
    #[error("country restricted")]
    CountryRestricted,

    /// Request came from a restricted IP address.
    #[error("ip address restricted")]
    IpRestricted,

    // ── Transient ────────────────────────────────────────────────
    /// Network error while contacting the backend.
    #[error("network error: {0}")]
    Network(String),

    /// Backend failed to process the request.
    #[error("server error: {0}")]
    Server(String),

    /// Backend rate limit hit.
    #[error("rate limited")]
    RateLimited,

    // ── Integrity ────────────────────────────────────────────────
    /// Token signature verification failed.
    #[error("token signature invalid")]
    InvalidSignature,

    /// Token or offline file names a different product.
    #[error("product mismatch: expected {expected}, got {actual}")]
    ProductMismatch { expected: String, actual: String },

    /// System clock moved backward relative to a stored watermark.
    #[error("system time modified")]
    TimeModified,

    /// Token was issued for a different machine.
    #[error("machine fingerprint mismatch")]
    MachineFingerprint,

    /// Offline response file is malformed or does not answer the outstanding request.
    #[error("invalid offline response file: {0}")]
    OfflineResponseFile(String),

    /// Offline response file is older than the freshness bound.
    #[error("offline response file expired")]
    OfflineResponseExpired,

    // ── Plumbing ─────────────────────────────────────────────────
    /// Local store error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Cryptographic failure outside of signature verification.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// No async runtime to run background work on.
    #[error("runtime unavailable: {0}")]
    Runtime(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LicenseError {
    /// True for failures that leave persisted state untouched and may succeed
    /// on a later attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Server(_) | Self::RateLimited)
    }

    /// True for signature, clock, fingerprint and offline-file failures.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignature
                | Self::ProductMismatch { .. }
                | Self::TimeModified
                | Self::MachineFingerprint
                | Self::OfflineResponseFile(_)
                | Self::OfflineResponseExpired
        )
    }
}

impl From<keyward_crypto::CryptoError> for LicenseError {
    fn from(err: keyward_crypto::CryptoError) -> Self {
        use keyward_crypto::CryptoError;
        match err {
            CryptoError::InvalidSignature | CryptoError::MalformedEnvelope(_) => {
                Self::InvalidSignature
            }
            CryptoError::Serialization(e) => Self::Serialization(e),
            other => Self::Crypto(other.to_string()),
        }
    }
}

/// Result type for license operations.
pub type LicenseResult<T> = Result<T, LicenseError>;
