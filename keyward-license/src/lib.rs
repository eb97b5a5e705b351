//! License activation and validation for keyward.
//!
//! This crate handles:
//! - Online and offline activation of license keys, bound to a machine fingerprint
//! - Verified trials (server-signed) and local trials (machine-only)
//! - Meter attributes with a local ledger reconciled on sync
//! - Background server sync with a grace period for network outages
//! - Encrypted persistence of all licensing state
//! - Release update checks
//!
//! # Design Principles
//!
//! - **One context object**: a [`LicenseEngine`] owns configuration and state; clones share it
//! - **Verify before trust**: every token is signature-checked against the product key before use
//! - **Offline-capable**: request/response files replace the network for air-gapped machines
//! - **Tamper-evident time**: a watermark of the latest observed time catches clock rollback
//!
//! # Token Format
//!
//! Tokens and offline files carry `base64url(payload).base64url(signature)`
//! envelopes signed with Ed25519. The payload is JSON.

mod activation;
pub mod backend;
mod config;
mod device;
mod engine;
mod error;
mod local_trial;
mod meter;
pub mod offline;
mod release;
mod status;
mod storage;
mod sync;
mod token;
mod trial;

pub use activation::{ActivationMode, ActivationState};
pub use config::{
    ConfigStore, DEFAULT_HOST_URL, EngineConfig, LicenseIdentity, MAX_APP_VERSION_LEN,
    MAX_LICENSE_KEY_LEN, MAX_METADATA_ENTRIES, MAX_METADATA_LEN, NetworkSettings, ProductConfig,
    ProductDescriptor, StorageScope, UserCredentials, normalize_host_url, normalize_proxy,
    validate_metadata_entry,
};
pub use device::{DeviceFingerprint, DeviceInfo};
pub use engine::{LicenseEngine, LicenseEngineBuilder};
pub use error::{LicenseError, LicenseResult};
pub use local_trial::LocalTrialState;
pub use meter::{MeterAttribute, MeterLedger};
pub use offline::DeactivationProof;
pub use release::validate_release_version;
pub use status::StatusCode;
pub use storage::{FileStore, MemoryStore, RecordKey, RecordStore, SecureStore};
pub use sync::{StatusCallback, SyncState};
pub use token::{ActivationToken, LicenseType, LicenseUser, ProductBound, TokenVerifier, TrialToken};

pub use keyward_types::{Clock, ManualClock, ProductId, SystemClock, Timestamp};
