//! Label encryption for the wire.
//!
//! This module provides:
//! - Per-wallet key/IV derivation from the wallet fingerprint
//! - AES-256-CBC label encoding with base64 text framing

pub mod codec;

pub use codec::{decode, derive_credentials, encode, SyncCredentials};

use thiserror::Error;

/// Errors that can occur while encoding or decoding labels
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Wallet fingerprint is empty")]
    InvalidFingerprint,

    #[error("Invalid base64: {0}")]
    InvalidBase64(String),

    #[error("Decryption failed - bad padding or wrong key")]
    DecryptionFailed,

    #[error("Decoded label is not a valid JSON string: {0}")]
    InvalidLabel(String),
}

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;
