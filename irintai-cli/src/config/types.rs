use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use irintai_engine::{EngineConfig, ListConfig, PromptFormat, RestartConfig};
use serde::{Deserialize, Serialize};

/// Configuration as stored in TOML files (with optional fields for merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawIrintaiConfig {
    #[serde(default)]
    pub engine: RawEngineConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

/// Engine settings as stored in TOML (optional fields for proper merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawEngineConfig {
    /// Engine binary name or path
    pub binary_path: Option<PathBuf>,

    /// Model store directory
    pub models_dir: Option<PathBuf>,

    /// Request 8-bit quantization
    pub use_8bit: Option<bool>,

    pub context_size: Option<u32>,

    #[serde(default, with = "humantime_serde::option")]
    pub grace_period: Option<Duration>,

    #[serde(default, with = "humantime_serde::option")]
    pub exchange_timeout: Option<Duration>,

    /// Crash recovery; a section replaces the lower layer's as a whole
    pub restart: Option<RestartConfig>,

    pub list: Option<ListConfig>,
}

/// Final configuration with defaults applied
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IrintaiConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionConfig {
    /// Model used by `irintai run` when none is given
    pub default_model: Option<String>,

    /// Prompt template; guessed from the model name when unset
    pub format: Option<PromptFormat>,

    /// Parameters passed to the engine's `run`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}
