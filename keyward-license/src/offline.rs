//! Offline request/response files.
//!
//! File layout: `b"KWOF" || version || kind || envelope`, where kind is
//! `b'Q'` for requests and `b'R'` for responses, and envelope is a signed
//! compact envelope. Requests are signed with this machine's device key
//! (its public half travels inside the request); responses are signed with
//! the product key. A response is only accepted for the request that is
//! currently outstanding: same product, same nonce, same kind.

use crate::backend::{ActivationRequest, DeactivationRequest, TrialActivationRequest};
use crate::error::{LicenseError, LicenseResult};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use keyward_crypto::{SigningKey, VerifyingKey, open_envelope, seal_envelope};
use keyward_types::{ProductId, RequestNonce, Timestamp};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Leading bytes of every offline file.
pub const OFFLINE_MAGIC: &[u8; 4] = b"KWOF";

/// Current offline file format version.
pub const OFFLINE_FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = OFFLINE_MAGIC.len() + 2;
const KIND_REQUEST: u8 = b'Q';
const KIND_RESPONSE: u8 = b'R';

/// What an offline request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Activation,
    Deactivation,
    TrialActivation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum RequestBody {
    Activation(ActivationRequest),
    Deactivation(DeactivationRequest),
    TrialActivation(TrialActivationRequest),
}

impl RequestBody {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Activation(_) => RequestKind::Activation,
            Self::Deactivation(_) => RequestKind::Deactivation,
            Self::TrialActivation(_) => RequestKind::TrialActivation,
        }
    }

    pub fn product_id(&self) -> ProductId {
        match self {
            Self::Activation(r) => r.product_id,
            Self::Deactivation(r) => r.product_id,
            Self::TrialActivation(r) => r.product_id,
        }
    }
}

/// Signed request handed to the backend out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineRequest {
    pub nonce: RequestNonce,
    pub created_at: Timestamp,
    /// Standard-base64 public key of the device key that signed the request.
    pub device_key: String,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ResponseBody {
    Activation { token: String },
    Deactivation { activation_id: String },
    TrialActivation { token: String },
}

impl ResponseBody {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Activation { .. } => RequestKind::Activation,
            Self::Deactivation { .. } => RequestKind::Deactivation,
            Self::TrialActivation { .. } => RequestKind::TrialActivation,
        }
    }
}

/// Backend answer to an [`OfflineRequest`], signed with the product key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineResponse {
    pub product_id: ProductId,
    pub nonce: RequestNonce,
    pub issued_at: Timestamp,
    pub body: ResponseBody,
}

/// Backend acknowledgement that an offline deactivation was processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivationProof {
    pub activation_id: String,
    pub nonce: RequestNonce,
    pub issued_at: Timestamp,
}

/// The request a response is expected for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub nonce: RequestNonce,
    pub kind: RequestKind,
    pub product_id: ProductId,
    pub created_at: Timestamp,
}

impl PendingRequest {
    pub fn for_request(request: &OfflineRequest) -> Self {
        Self {
            nonce: request.nonce,
            kind: request.body.kind(),
            product_id: request.body.product_id(),
            created_at: request.created_at,
        }
    }
}

/// Signs and frames a request.
pub fn encode_request(request: &OfflineRequest, device_key: &SigningKey) -> LicenseResult<Vec<u8>> {
    let envelope = seal_envelope(device_key, request)?;
    Ok(frame(KIND_REQUEST, &envelope))
}

/// Unframes a request and verifies it against the device key it carries.
pub fn decode_request(bytes: &[u8]) -> LicenseResult<OfflineRequest> {
    let envelope = unframe(KIND_REQUEST, bytes)
        .map_err(|e| LicenseError::FilePath(format!("not an offline request file: {e}")))?;
    let claimed: OfflineRequest = decode_unverified(envelope)?;
    let device_key = VerifyingKey::from_base64(&claimed.device_key)?;
    Ok(open_envelope(envelope, &device_key)?)
}

/// Signs and frames a response.
pub fn encode_response(response: &OfflineResponse, product_key: &SigningKey) -> LicenseResult<Vec<u8>> {
    let envelope = seal_envelope(product_key, response)?;
    Ok(frame(KIND_RESPONSE, &envelope))
}

/// Unframes a response and verifies the product signature.
pub fn decode_response(bytes: &[u8], product_key: &VerifyingKey) -> LicenseResult<OfflineResponse> {
    let envelope = unframe(KIND_RESPONSE, bytes).map_err(LicenseError::OfflineResponseFile)?;
    open_envelope(envelope, product_key).map_err(|e| match LicenseError::from(e) {
        LicenseError::Serialization(e) => LicenseError::OfflineResponseFile(e.to_string()),
        other => other,
    })
}

/// Checks that `response` answers `pending` and is still fresh.
pub fn match_response(
    response: &OfflineResponse,
    pending: Option<&PendingRequest>,
    now: Timestamp,
    max_age_secs: i64,
) -> LicenseResult<()> {
    let pending = pending.ok_or_else(|| {
        LicenseError::OfflineResponseFile("no offline request outstanding".to_string())
    })?;
    if response.product_id != pending.product_id {
        return Err(LicenseError::OfflineResponseFile(format!(
            "response is for product {}",
            response.product_id
        )));
    }
    if response.nonce != pending.nonce {
        return Err(LicenseError::OfflineResponseFile(
            "response does not answer the outstanding request".to_string(),
        ));
    }
    if response.body.kind() != pending.kind {
        return Err(LicenseError::OfflineResponseFile(format!(
            "expected {:?} response, got {:?}",
            pending.kind,
            response.body.kind()
        )));
    }
    if now.secs_since(response.issued_at) > max_age_secs {
        return Err(LicenseError::OfflineResponseExpired);
    }
    Ok(())
}

/// Reads an offline file.
pub fn read_file(path: &Path) -> LicenseResult<Vec<u8>> {
    fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => {
            LicenseError::FilePermission(format!("{}: {e}", path.display()))
        }
        _ => LicenseError::FilePath(format!("{}: {e}", path.display())),
    })
}

/// Writes an offline file.
pub fn write_file(path: &Path, bytes: &[u8]) -> LicenseResult<()> {
    fs::write(path, bytes).map_err(|e| match e.kind() {
        ErrorKind::NotFound => LicenseError::FilePath(format!("{}: {e}", path.display())),
        _ => LicenseError::FilePermission(format!("{}: {e}", path.display())),
    })
}

fn frame(kind: u8, envelope: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + envelope.len());
    bytes.extend_from_slice(OFFLINE_MAGIC);
    bytes.push(OFFLINE_FORMAT_VERSION);
    bytes.push(kind);
    bytes.extend_from_slice(envelope.as_bytes());
    bytes
}

fn unframe(kind: u8, bytes: &[u8]) -> Result<&str, String> {
    if bytes.len() <= HEADER_LEN || &bytes[..OFFLINE_MAGIC.len()] != OFFLINE_MAGIC {
        return Err("missing offline file header".to_string());
    }
    let version = bytes[OFFLINE_MAGIC.len()];
    if version != OFFLINE_FORMAT_VERSION {
        return Err(format!("unsupported format version {version}"));
    }
    if bytes[OFFLINE_MAGIC.len() + 1] != kind {
        return Err("wrong offline file kind".to_string());
    }
    std::str::from_utf8(&bytes[HEADER_LEN..]).map_err(|e| e.to_string())
}

fn decode_unverified(envelope: &str) -> LicenseResult<OfflineRequest> {
    let payload_b64 = envelope
        .split_once('.')
        .map(|(payload, _)| payload)
        .ok_or(LicenseError::InvalidSignature)?;
    let json = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| LicenseError::InvalidSignature)?;
    Ok(serde_json::from_slice(&json)?)
}
