//! Wallet-side collaborators: identity, guarded label state and storage.

use crate::{LabelSyncError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Storage key holding the full label mapping.
pub const LABELS_KEY: &str = "labels";

/// Key→label mapping of a wallet.
pub type LabelMap = HashMap<String, String>;

/// Key-value persistence for a single wallet.
pub trait Storage: Send {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn put(&mut self, key: &str, value: Value) -> Result<()>;
}

/// In-process storage, for tests and throwaway wallets.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    values: HashMap<String, Value>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: Value) -> Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

/// Opaque token identifying a wallet for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WalletIdentity(u64);

impl WalletIdentity {
    /// Allocate a fresh identity, distinct from every other one handed out.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WalletIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wallet#{}", self.0)
    }
}

/// Everything guarded by the wallet lock: labels and the backing storage.
pub struct WalletState {
    pub labels: LabelMap,
    pub storage: Box<dyn Storage>,
}

impl WalletState {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        Self {
            labels: LabelMap::new(),
            storage,
        }
    }

    /// Write the current label mapping through to storage.
    pub fn persist_labels(&mut self) -> Result<()> {
        let value = serde_json::to_value(&self.labels)
            .map_err(|e| LabelSyncError::Storage(e.to_string()))?;
        self.storage.put(LABELS_KEY, value)
    }
}

impl fmt::Debug for WalletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletState")
            .field("labels", &self.labels.len())
            .finish_non_exhaustive()
    }
}

/// A wallet as seen by the label sync engine.
pub trait Wallet: Send + Sync + 'static {
    fn identity(&self) -> WalletIdentity;

    /// Human-readable name, for logs.
    fn name(&self) -> &str;

    /// Stable fingerprint the sync credentials are derived from, if the
    /// wallet type has one.
    fn fingerprint(&self) -> Option<Vec<u8>>;

    /// The wallet lock.
    fn state(&self) -> &Mutex<WalletState>;

    /// Acquire the wallet lock.
    fn lock_state(&self) -> Result<MutexGuard<'_, WalletState>> {
        self.state()
            .lock()
            .map_err(|_| LabelSyncError::LockPoisoned(self.name().to_string()))
    }
}

/// Plain wallet backed by any [`Storage`].
pub struct LocalWallet {
    identity: WalletIdentity,
    name: String,
    fingerprint: Option<Vec<u8>>,
    state: Mutex<WalletState>,
}

impl LocalWallet {
    /// Open a wallet, loading any labels already persisted in `storage`.
    pub fn open(
        name: impl Into<String>,
        fingerprint: Option<Vec<u8>>,
        storage: Box<dyn Storage>,
    ) -> Result<Self> {
        let name = name.into();
        let mut state = WalletState::new(storage);

        if let Some(value) = state.storage.get(LABELS_KEY)? {
            match serde_json::from_value::<LabelMap>(value) {
                Ok(labels) => state.labels = labels,
                Err(e) => warn!("{}: ignoring unreadable stored labels: {}", name, e),
            }
        }

        Ok(Self {
            identity: WalletIdentity::next(),
            name,
            fingerprint,
            state: Mutex::new(state),
        })
    }

    /// Open a wallet with empty in-memory storage.
    pub fn in_memory(name: impl Into<String>, fingerprint: Option<Vec<u8>>) -> Self {
        Self {
            identity: WalletIdentity::next(),
            name: name.into(),
            fingerprint,
            state: Mutex::new(WalletState::new(Box::new(MemoryStorage::new()))),
        }
    }

    /// Snapshot of the current labels.
    pub fn labels(&self) -> Result<LabelMap> {
        Ok(self.lock_state()?.labels.clone())
    }
}

impl Wallet for LocalWallet {
    fn identity(&self) -> WalletIdentity {
        self.identity
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn fingerprint(&self) -> Option<Vec<u8>> {
        self.fingerprint.clone()
    }

    fn state(&self) -> &Mutex<WalletState> {
        &self.state
    }
}
