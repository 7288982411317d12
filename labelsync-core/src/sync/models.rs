//! Label service wire format and sync outcome types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One encrypted label as it travels to and from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLabel {
    /// Encrypted label key (address, txid, ...).
    pub external_id: String,
    pub encrypted_label: String,
}

/// Body of `POST /label`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelRequest {
    pub wallet_id: String,
    pub wallet_nonce: u64,
    pub external_id: String,
    pub encrypted_label: String,
}

/// Body of `POST /labels`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelBatchRequest {
    pub labels: Vec<WireLabel>,
    pub wallet_id: String,
    pub wallet_nonce: u64,
}

/// Response of `GET /labels/since/{nonce}/for/{walletId}`.
///
/// Entries stay untyped so a malformed one can be dropped on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// `null` when nothing changed since the requested nonce.
    #[serde(default)]
    pub labels: Option<Vec<Value>>,
    /// Only meaningful alongside `labels`.
    #[serde(default)]
    pub nonce: Option<u64>,
}

/// Result of a pull from the label server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The server had nothing new; local state untouched.
    Unchanged,
    /// Remote labels were merged into the wallet.
    Merged {
        /// Labels in the server response.
        received: usize,
        /// Labels written to the local mapping.
        applied: usize,
        /// Labels that could not be decoded.
        dropped: usize,
        /// Local nonce after the merge.
        nonce: u64,
    },
    /// The wallet has no active session.
    Inactive,
    /// A background pull failed; it will be retried on the next trigger.
    Deferred,
}

/// Current sync status summary for one wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub wallet_id: String,
    pub nonce: u64,
    pub label_count: usize,
    pub last_pull_at: Option<i64>,
}
