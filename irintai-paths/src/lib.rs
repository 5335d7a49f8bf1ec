//! Where irintai keeps its files.
//!
//! Follows the XDG base directory layout. The engine's model store lives
//! under the data directory so the supervisor, the installer and the CLI
//! agree on one location.
//!
//! ```
//! let config = irintai_paths::config_dir().join("config.toml");
//! assert!(config.ends_with("irintai/config.toml"));
//! ```

use std::path::PathBuf;

const APP: &str = "irintai";

/// Resolve `$<var>/irintai`, else `~/<fallback>/irintai`.
fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    let base = match std::env::var_os(var) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir().unwrap_or_default().join(fallback),
    };
    base.join(APP)
}

/// `$XDG_CONFIG_HOME/irintai`, or `~/.config/irintai`.
pub fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
}

/// `$XDG_DATA_HOME/irintai`, or `~/.local/share/irintai`.
pub fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
}

/// Default model store handed to the engine as `OLLAMA_MODELS`.
pub fn models_dir() -> PathBuf {
    data_dir().join("models")
}
