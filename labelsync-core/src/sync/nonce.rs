//! Per-wallet sync nonce persisted through wallet storage.
//!
//! The nonce is the value to send with the next change. It starts at 1 and
//! only moves forward under normal operation.

use crate::wallet::{Wallet, WalletState};
use crate::{LabelSyncError, Result};
use serde_json::Value;
use tracing::debug;

/// Storage key holding the nonce.
pub const NONCE_KEY: &str = "wallet_nonce";

/// Read the wallet nonce under the wallet lock, initializing it to 1.
pub fn get_nonce(wallet: &dyn Wallet) -> Result<u64> {
    let mut state = wallet.lock_state()?;
    read_nonce(&mut state)
}

/// Persist `value` as the wallet nonce under the wallet lock.
///
/// No monotonicity check happens here; callers only move it forward.
pub fn set_nonce(wallet: &dyn Wallet, value: u64) -> Result<()> {
    let mut state = wallet.lock_state()?;
    debug!("set {} nonce to {}", wallet.name(), value);
    write_nonce(&mut state, value)
}

/// Same as [`get_nonce`] for a caller already holding the lock.
pub(crate) fn read_nonce(state: &mut WalletState) -> Result<u64> {
    match state.storage.get(NONCE_KEY)? {
        Some(value) => match value.as_u64() {
            Some(nonce) if nonce >= 1 => Ok(nonce),
            Some(_) => {
                write_nonce(state, 1)?;
                Ok(1)
            }
            None => Err(LabelSyncError::Storage(format!(
                "stored nonce is not an integer: {}",
                value
            ))),
        },
        None => {
            write_nonce(state, 1)?;
            Ok(1)
        }
    }
}

pub(crate) fn write_nonce(state: &mut WalletState, value: u64) -> Result<()> {
    state.storage.put(NONCE_KEY, Value::from(value))
}
