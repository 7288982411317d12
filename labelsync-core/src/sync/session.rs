//! Per-wallet sync session: push, pull and single-label uploads.

use crate::crypto::{decode, derive_credentials, encode, SyncCredentials};
use crate::sync::client::SyncClient;
use crate::sync::models::{
    LabelBatchRequest, LabelRequest, PullOutcome, SessionStatus, WireLabel,
};
use crate::sync::nonce::{get_nonce, read_nonce, write_nonce};
use crate::wallet::{LabelMap, Wallet, WalletIdentity};
use crate::{LabelSyncError, Result};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Sync state for one active wallet.
///
/// Holds the wallet's credentials for as long as the wallet is registered.
/// Labels and the nonce are always accessed through the wallet lock, and the
/// lock is never held across a network call.
pub struct WalletSyncSession {
    wallet: Arc<dyn Wallet>,
    credentials: SyncCredentials,
    last_pull_at: Mutex<Option<i64>>,
}

impl WalletSyncSession {
    /// Derive credentials and initialize the nonce for `wallet`.
    ///
    /// Returns `None` when the wallet has no fingerprint to derive from.
    pub fn open(wallet: Arc<dyn Wallet>) -> Result<Option<Self>> {
        let fingerprint = match wallet.fingerprint() {
            Some(fp) if !fp.is_empty() => fp,
            _ => return Ok(None),
        };
        let credentials = derive_credentials(&fingerprint)?;

        let nonce = get_nonce(&*wallet)?;
        info!("wallet {} nonce is {}", wallet.name(), nonce);

        Ok(Some(Self {
            wallet,
            credentials,
            last_pull_at: Mutex::new(None),
        }))
    }

    pub fn wallet(&self) -> &Arc<dyn Wallet> {
        &self.wallet
    }

    pub fn identity(&self) -> WalletIdentity {
        self.wallet.identity()
    }

    /// Server-side wallet identifier.
    pub fn wallet_id(&self) -> &str {
        self.credentials.wallet_id()
    }

    pub fn credentials(&self) -> &SyncCredentials {
        &self.credentials
    }

    /// Encrypt every local label into one batch at the current nonce.
    pub fn push_bundle(&self) -> Result<LabelBatchRequest> {
        let (nonce, labels) = {
            let mut state = self.wallet.lock_state()?;
            (read_nonce(&mut state)?, state.labels.clone())
        };

        let labels = labels
            .iter()
            .map(|(key, value)| WireLabel {
                external_id: encode(&self.credentials, key),
                encrypted_label: encode(&self.credentials, value),
            })
            .collect();

        Ok(LabelBatchRequest {
            labels,
            wallet_id: self.wallet_id().to_string(),
            wallet_nonce: nonce,
        })
    }

    /// Upload all local labels. Returns the number of labels sent.
    pub async fn push(&self, client: &SyncClient) -> Result<usize> {
        let bundle = self.push_bundle()?;
        let count = bundle.labels.len();
        debug!("pushing {} labels for {}", count, self.wallet.name());
        client.post_labels(&bundle).await?;
        Ok(count)
    }

    /// Build the upload for one edited label and advance the nonce past it.
    ///
    /// The nonce moves forward before the upload is sent; a lost upload is
    /// reconciled later through the nonce-conflict path. Returns `None` for
    /// an empty key.
    pub fn stage_label(&self, key: &str, label: &str) -> Result<Option<LabelRequest>> {
        if key.is_empty() {
            return Ok(None);
        }

        let external_id = encode(&self.credentials, key);
        let encrypted_label = encode(&self.credentials, label);

        let mut state = self.wallet.lock_state()?;
        let nonce = read_nonce(&mut state)?;
        let next = nonce
            .checked_add(1)
            .ok_or_else(|| LabelSyncError::InvariantViolation("nonce overflow".to_string()))?;
        write_nonce(&mut state, next)?;
        debug!("set {} nonce to {}", self.wallet.name(), next);

        Ok(Some(LabelRequest {
            wallet_id: self.wallet_id().to_string(),
            wallet_nonce: nonce,
            external_id,
            encrypted_label,
        }))
    }

    /// Download labels from the server and merge them into the wallet.
    ///
    /// A forced pull starts from nonce 1 and overwrites local labels; a
    /// normal pull re-requests from one before the current nonce and only
    /// fills keys that have no local label.
    pub async fn pull(&self, client: &SyncClient, force: bool) -> Result<PullOutcome> {
        let since = if force {
            1
        } else {
            get_nonce(self.wallet.as_ref())?.saturating_sub(1)
        };
        info!("{}: asking for labels since nonce {}", self.wallet.name(), since);

        let response = client.labels_since(since, self.wallet_id()).await?;
        let Some(remote) = response.labels else {
            debug!("{}: no new labels", self.wallet.name());
            return Ok(PullOutcome::Unchanged);
        };

        let Some(server_nonce) = response.nonce else {
            return Err(LabelSyncError::InvalidResponse(
                "pull response has labels but no nonce".to_string(),
            ));
        };

        let received = remote.len();
        let (decoded, dropped) = self.decode_labels(remote);

        let mut state = self.wallet.lock_state()?;
        let mut applied = 0;
        for (key, value) in decoded {
            let has_local = state.labels.get(&key).is_some_and(|v| !v.is_empty());
            if force || !has_local {
                state.labels.insert(key, value);
                applied += 1;
            }
        }
        state.persist_labels()?;

        let current = read_nonce(&mut state)?;
        let nonce = current.max(server_nonce.saturating_add(1));
        write_nonce(&mut state, nonce)?;
        drop(state);

        if let Ok(mut last) = self.last_pull_at.lock() {
            *last = Some(chrono::Utc::now().timestamp());
        }

        info!(
            "{}: received {} labels, applied {}, nonce now {}",
            self.wallet.name(),
            received,
            applied,
            nonce
        );

        Ok(PullOutcome::Merged {
            received,
            applied,
            dropped,
            nonce,
        })
    }

    /// Decode remote labels, dropping the ones that fail individually.
    fn decode_labels(&self, remote: Vec<Value>) -> (LabelMap, usize) {
        let mut result = LabelMap::new();
        let mut dropped = 0;
        for entry in remote {
            let label = match serde_json::from_value::<WireLabel>(entry) {
                Ok(label) => label,
                Err(e) => {
                    warn!("{}: dropping malformed label entry: {}", self.wallet.name(), e);
                    dropped += 1;
                    continue;
                }
            };
            let key = decode(&self.credentials, &label.external_id);
            let value = decode(&self.credentials, &label.encrypted_label);
            match (key, value) {
                (Ok(key), Ok(value)) => {
                    result.insert(key, value);
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!("{}: dropping undecodable label: {}", self.wallet.name(), e);
                    dropped += 1;
                }
            }
        }
        (result, dropped)
    }

    /// Current sync status summary.
    pub fn status(&self) -> Result<SessionStatus> {
        let (nonce, label_count) = {
            let mut state = self.wallet.lock_state()?;
            (read_nonce(&mut state)?, state.labels.len())
        };
        let last_pull_at = self.last_pull_at.lock().map(|v| *v).unwrap_or(None);

        Ok(SessionStatus {
            wallet_id: self.wallet_id().to_string(),
            nonce,
            label_count,
            last_pull_at,
        })
    }
}
