//! Platform-specific default locations

use std::path::PathBuf;

const APP_DIR: &str = "labelsync";

/// First available base directory, with `fallback` under the home directory
/// as a last resort.
fn app_dir(candidates: &[fn() -> Option<PathBuf>], fallback: &str) -> PathBuf {
    candidates
        .iter()
        .find_map(|dir| dir())
        .or_else(|| dirs::home_dir().map(|home| home.join(fallback)))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Directory holding wallet databases, e.g. `~/.local/share/labelsync`.
pub fn get_data_dir() -> PathBuf {
    app_dir(&[dirs::data_local_dir, dirs::data_dir], ".data")
}

/// Directory holding `labelsync.toml`, e.g. `~/.config/labelsync`.
pub fn get_config_dir() -> PathBuf {
    app_dir(&[dirs::config_dir, dirs::data_dir], ".config")
}

/// Get the default wallet database path
pub fn get_default_wallet_path() -> PathBuf {
    get_data_dir().join("wallet.db")
}

/// Get the default config file path
pub fn get_default_config_path() -> PathBuf {
    get_config_dir().join("labelsync.toml")
}
