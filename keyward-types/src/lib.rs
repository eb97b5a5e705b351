//! Core type definitions for keyward.
//!
//! This crate defines the leaf types shared by the crypto and licensing
//! crates:
//! - Product identifiers and offline request nonces (UUID)
//! - Unix-second timestamps
//! - The `Clock` abstraction used for every expiry and tamper check

mod clock;
mod ids;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp, SECS_PER_DAY};
pub use ids::{ProductId, RequestNonce};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
