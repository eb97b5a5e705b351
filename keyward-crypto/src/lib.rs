//! Cryptographic primitives for keyward.
//!
//! Two concerns live here:
//!
//! - **Signed envelopes**: activation tokens, trial tokens and offline
//!   request/response files are `base64url(payload).base64url(signature)`
//!   strings signed with Ed25519. The signature covers the base64url-encoded
//!   payload bytes, not the decoded JSON.
//! - **Local store encryption**: persisted licensing state is sealed with
//!   ChaCha20-Poly1305 under a key derived with Argon2id from the product id
//!   and the device fingerprint, so a copied store does not open on another
//!   machine.

mod cipher;
mod error;
mod key;
mod signing;

pub use cipher::{decrypt, encrypt, open_bytes, seal_bytes, EncryptedData, NONCE_SIZE, TAG_SIZE};
pub use error::{CryptoError, CryptoResult};
pub use key::{
    derive_key, derive_store_key, generate_random_key, DerivedKey, KdfParams, Salt, KEY_SIZE,
    SALT_SIZE,
};
pub use signing::{open_envelope, seal_envelope, KeyPair, SigningKey, VerifyingKey};
