//! Label sync configuration loaded from TOML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{LabelSyncError, Result};

/// Sync configuration for this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelSyncConfig {
    /// Base URL of the label service, without a trailing slash.
    pub server_url: String,
    pub request_timeout_secs: u64,
    /// Wallet database used by the command-line client.
    pub storage_path: Option<PathBuf>,
}

impl Default for LabelSyncConfig {
    fn default() -> Self {
        Self {
            server_url: "https://labels.electrum.org".to_string(),
            request_timeout_secs: 5,
            storage_path: None,
        }
    }
}

impl LabelSyncConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LabelSyncError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| LabelSyncError::Config(e.to_string()))?;
        if config.request_timeout_secs == 0 {
            return Err(LabelSyncError::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
