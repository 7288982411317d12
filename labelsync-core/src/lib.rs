//! Label Sync Core Library
//!
//! Keeps a per-wallet key→label mapping consistent with a remote label
//! service. Labels are encrypted with key material derived from the wallet
//! fingerprint before they leave the process, so the server only ever sees
//! opaque ciphertexts.

pub mod crypto;
pub mod database;
pub mod platform;
pub mod sync;
pub mod wallet;

pub use crypto::{CodecError, SyncCredentials};
pub use database::SqliteStorage;
pub use platform::{get_config_dir, get_data_dir, get_default_config_path, get_default_wallet_path};
pub use sync::{
    LabelSyncConfig, PullOutcome, SessionRegistry, SessionStatus, ShutdownReport, SyncClient,
    SyncObserver,
};
pub use wallet::{LocalWallet, MemoryStorage, Storage, Wallet, WalletIdentity, WalletState};

use thiserror::Error;

/// Result type for label sync operations
pub type Result<T> = std::result::Result<T, LabelSyncError>;

/// General error type for label sync operations
#[derive(Error, Debug)]
pub enum LabelSyncError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Request timed out")]
    NetworkTimeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Label server returned {status}: {body}")]
    RemoteStatus { status: u16, body: String },

    #[error("Label server error: {0}")]
    Remote(String),

    #[error("Wallet nonce is behind the server")]
    NonceConflict,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Broad category of a [`LabelSyncError`], used to pick a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The server is ahead of the local nonce; a forced resync is needed.
    NonceConflict,
    /// Network or server trouble; retrying on the next trigger is fine.
    Transient,
    /// Ciphertext that could not be turned back into a label.
    Decode,
    /// A programming error.
    Invariant,
    /// Local storage, locking or configuration failure.
    Local,
}

impl LabelSyncError {
    /// Classify this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NonceConflict => FailureKind::NonceConflict,
            Self::NetworkTimeout
            | Self::Network(_)
            | Self::RemoteStatus { .. }
            | Self::Remote(_)
            | Self::InvalidResponse(_) => FailureKind::Transient,
            Self::Codec(CodecError::InvalidFingerprint) => FailureKind::Local,
            Self::Codec(_) => FailureKind::Decode,
            Self::InvariantViolation(_) => FailureKind::Invariant,
            Self::Storage(_) | Self::LockPoisoned(_) | Self::Config(_) => FailureKind::Local,
        }
    }
}

impl From<rusqlite::Error> for LabelSyncError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
