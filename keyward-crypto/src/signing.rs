//! Ed25519 signed envelopes.
//!
//! Envelope format: `base64url(payload_json).base64url(signature)`.
//!
//! The signature covers `payload_b64.as_bytes()` (the base64url-encoded
//! payload string, not the decoded JSON), so an envelope can be verified
//! without re-serializing anything.

use crate::error::{CryptoError, CryptoResult};
use base64::{engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{
    Signature as DalekSignature, Signer as _, SigningKey as DalekSigningKey, Verifier as _,
    VerifyingKey as DalekVerifyingKey,
};
use rand::rngs::OsRng;
use serde::{de::DeserializeOwned, Serialize};

/// Ed25519 signing key (secret).
pub struct SigningKey(DalekSigningKey);

/// Ed25519 verifying key (public).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VerifyingKey(DalekVerifyingKey);

/// A keypair for signing and verification.
pub struct KeyPair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generates a new random Ed25519 keypair.
    pub fn generate() -> Self {
        let signing = DalekSigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        Self {
            signing_key: SigningKey(signing),
            verifying_key: VerifyingKey(verifying),
        }
    }
}

impl SigningKey {
    /// Creates a signing key from a raw 32-byte secret.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(DalekSigningKey::from_bytes(bytes))
    }

    /// Returns the raw 32-byte secret key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Signs a message and returns the raw 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.0.sign(message).to_bytes()
    }

    /// Returns the corresponding verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.0.verifying_key())
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl VerifyingKey {
    /// Creates a verifying key from a raw 32-byte public key.
    pub fn from_bytes(bytes: &[u8; 32]) -> CryptoResult<Self> {
        DalekVerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    /// Parses a standard-base64 public key (as shipped in product descriptors).
    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidPublicKey(format!("invalid base64: {e}")))?;
        let array: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidPublicKey(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Self::from_bytes(&array)
    }

    /// Returns the raw 32-byte public key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Encodes the public key as standard base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    /// Verifies a raw signature against a message.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> CryptoResult<()> {
        let signature =
            DalekSignature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        self.0
            .verify(message, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl std::fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("VerifyingKey").field(&self.to_base64()).finish()
    }
}

/// Serializes `payload` to JSON and signs it into a compact envelope.
pub fn seal_envelope<T: Serialize>(key: &SigningKey, payload: &T) -> CryptoResult<String> {
    let json = serde_json::to_vec(payload)?;
    let payload_b64 = URL_SAFE_NO_PAD.encode(json);
    let signature = key.sign(payload_b64.as_bytes());
    let sig_b64 = URL_SAFE_NO_PAD.encode(signature);
    Ok(format!("{payload_b64}.{sig_b64}"))
}

/// Verifies a compact envelope and decodes its payload.
///
/// The payload is only decoded after the signature checks out.
pub fn open_envelope<T: DeserializeOwned>(envelope: &str, key: &VerifyingKey) -> CryptoResult<T> {
    let envelope = envelope.trim();

    let (payload_b64, signature_b64) = envelope.split_once('.').ok_or_else(|| {
        CryptoError::MalformedEnvelope("expected two parts separated by a dot".to_string())
    })?;
    if payload_b64.is_empty() || signature_b64.is_empty() || signature_b64.contains('.') {
        return Err(CryptoError::MalformedEnvelope(
            "expected exactly two non-empty parts".to_string(),
        ));
    }

    let sig_bytes = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("invalid signature base64: {e}")))?;
    if sig_bytes.len() != 64 {
        return Err(CryptoError::MalformedEnvelope(format!(
            "signature truncated: {} bytes",
            sig_bytes.len()
        )));
    }

    key.verify(payload_b64.as_bytes(), &sig_bytes)?;

    let payload_json = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("invalid payload base64: {e}")))?;

    Ok(serde_json::from_slice(&payload_json)?)
}
