//! Configuration for the engine supervisor, installer and exchange channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Environment variable pointing the engine at its model store.
pub const MODELS_ENV: &str = "OLLAMA_MODELS";

/// Environment variable pointing the engine at its home directory.
pub const HOME_ENV: &str = "OLLAMA_HOME";

/// Configuration for the engine subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path or name of the engine binary.
    #[serde(default = "default_binary_path")]
    pub binary_path: PathBuf,

    /// Directory where the engine stores models.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Request 8-bit quantization when the engine supports it.
    #[serde(default)]
    pub use_8bit: bool,

    /// Context size passed as `--context` when a start does not set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u32>,

    /// Time allowed for graceful termination before a forced kill.
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,

    /// Default timeout for a synchronous exchange.
    #[serde(default = "default_exchange_timeout", with = "humantime_serde")]
    pub exchange_timeout: Duration,

    /// Timeout for the version probe used in quantization negotiation.
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Crash recovery settings.
    #[serde(default)]
    pub restart: RestartConfig,

    /// Retry settings for catalog listing.
    #[serde(default)]
    pub list: ListConfig,
}

/// Crash recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Maximum respawn attempts before giving up.
    #[serde(default = "default_max_restart_attempts")]
    pub max_attempts: u32,

    /// Fixed delay before each respawn.
    #[serde(default = "default_restart_backoff", with = "humantime_serde")]
    pub backoff: Duration,

    /// Uptime after which a respawned process counts as recovered.
    #[serde(default = "default_stable_after", with = "humantime_serde")]
    pub stable_after: Duration,
}

/// Retry settings for `list` queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListConfig {
    #[serde(default = "default_list_attempts")]
    pub attempts: u32,

    #[serde(default = "default_list_backoff", with = "humantime_serde")]
    pub backoff: Duration,

    /// Per-attempt timeout.
    #[serde(default = "default_list_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_binary_path() -> PathBuf {
    PathBuf::from("ollama")
}

fn default_models_dir() -> PathBuf {
    irintai_paths::models_dir()
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_exchange_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_restart_attempts() -> u32 {
    3
}

fn default_restart_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_stable_after() -> Duration {
    Duration::from_secs(10)
}

fn default_list_attempts() -> u32 {
    3
}

fn default_list_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_list_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
            models_dir: default_models_dir(),
            use_8bit: false,
            context_size: None,
            grace_period: default_grace_period(),
            exchange_timeout: default_exchange_timeout(),
            probe_timeout: default_probe_timeout(),
            restart: RestartConfig::default(),
            list: ListConfig::default(),
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_restart_attempts(),
            backoff: default_restart_backoff(),
            stable_after: default_stable_after(),
        }
    }
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            attempts: default_list_attempts(),
            backoff: default_list_backoff(),
            timeout: default_list_timeout(),
        }
    }
}

impl EngineConfig {
    /// Create a new config with a custom binary path.
    #[must_use]
    pub fn with_binary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = path.into();
        self
    }

    /// Create a new config with a custom model store.
    #[must_use]
    pub fn with_models_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.models_dir = path.into();
        self
    }

    #[must_use]
    pub fn with_8bit(mut self, enabled: bool) -> Self {
        self.use_8bit = enabled;
        self
    }

    #[must_use]
    pub fn with_context_size(mut self, size: u32) -> Self {
        self.context_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Override the crash recovery timings.
    #[must_use]
    pub fn with_restart(mut self, backoff: Duration, stable_after: Duration) -> Self {
        self.restart.backoff = backoff;
        self.restart.stable_after = stable_after;
        self
    }

    #[must_use]
    pub fn with_list_backoff(mut self, backoff: Duration) -> Self {
        self.list.backoff = backoff;
        self
    }

    /// Resolve the engine binary.
    ///
    /// Absolute or relative paths are used as-is when they exist; bare names
    /// are looked up in `PATH`.
    pub fn find_binary(&self) -> Result<PathBuf> {
        if self.binary_path.components().count() > 1 {
            if self.binary_path.exists() {
                return Ok(self.binary_path.clone());
            }
            return Err(EngineError::ExecutableNotFound);
        }
        which::which(&self.binary_path).map_err(|_| EngineError::ExecutableNotFound)
    }

    /// Environment applied to every engine command.
    ///
    /// Keeps the engine's model lookup consistent with `models_dir`.
    pub fn env_vars(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        let home = self
            .models_dir
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_string_lossy()
            .to_string();
        env.insert(HOME_ENV.to_string(), home);
        env.insert(
            MODELS_ENV.to_string(),
            self.models_dir.to_string_lossy().to_string(),
        );
        env
    }
}
