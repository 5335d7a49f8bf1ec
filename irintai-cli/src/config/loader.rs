use super::types::{IrintaiConfig, RawEngineConfig, RawIrintaiConfig, SessionConfig};
use anyhow::{Context, Result};
use irintai_engine::EngineConfig;
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user + project)
    pub fn load() -> Result<IrintaiConfig> {
        Self::load_from(&Self::user_config_path(), &Self::project_config_path())
    }

    /// Load and merge the given layers, skipping files that don't exist
    pub fn load_from(user_path: &Path, project_path: &Path) -> Result<IrintaiConfig> {
        let mut raw = RawIrintaiConfig::default();

        // Layer 1: User config
        if let Some(user_config) = Self::read_layer(user_path)? {
            raw = Self::merge_raw(raw, user_config);
        }

        // Layer 2: Project config
        if let Some(project_config) = Self::read_layer(project_path)? {
            raw = Self::merge_raw(raw, project_config);
        }

        Ok(Self::finalize(raw))
    }

    fn read_layer(path: &Path) -> Result<Option<RawIrintaiConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = toml::from_str(&contents)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(Some(config))
    }

    /// Get user config path
    pub fn user_config_path() -> PathBuf {
        irintai_paths::config_dir().join("config.toml")
    }

    /// Get project config path
    /// Can be overridden with IRINTAI_PROJECT_CONFIG_DIR env var
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("IRINTAI_PROJECT_CONFIG_DIR") {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".irintai/config.toml")
        }
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    fn merge_raw(base: RawIrintaiConfig, overlay: RawIrintaiConfig) -> RawIrintaiConfig {
        RawIrintaiConfig {
            engine: RawEngineConfig {
                binary_path: overlay.engine.binary_path.or(base.engine.binary_path),
                models_dir: overlay.engine.models_dir.or(base.engine.models_dir),
                use_8bit: overlay.engine.use_8bit.or(base.engine.use_8bit),
                context_size: overlay.engine.context_size.or(base.engine.context_size),
                grace_period: overlay.engine.grace_period.or(base.engine.grace_period),
                exchange_timeout: overlay
                    .engine
                    .exchange_timeout
                    .or(base.engine.exchange_timeout),
                restart: overlay.engine.restart.or(base.engine.restart),
                list: overlay.engine.list.or(base.engine.list),
            },
            session: SessionConfig {
                default_model: overlay.session.default_model.or(base.session.default_model),
                format: overlay.session.format.or(base.session.format),
                params: if overlay.session.params.is_empty() {
                    base.session.params
                } else {
                    overlay.session.params
                },
            },
        }
    }

    /// Convert raw config to final config with defaults applied
    fn finalize(raw: RawIrintaiConfig) -> IrintaiConfig {
        let defaults = EngineConfig::default();
        let engine = raw.engine;
        IrintaiConfig {
            engine: EngineConfig {
                binary_path: engine.binary_path.unwrap_or(defaults.binary_path),
                models_dir: engine.models_dir.unwrap_or(defaults.models_dir),
                use_8bit: engine.use_8bit.unwrap_or(defaults.use_8bit),
                context_size: engine.context_size.or(defaults.context_size),
                grace_period: engine.grace_period.unwrap_or(defaults.grace_period),
                exchange_timeout: engine.exchange_timeout.unwrap_or(defaults.exchange_timeout),
                probe_timeout: defaults.probe_timeout,
                restart: engine.restart.unwrap_or(defaults.restart),
                list: engine.list.unwrap_or(defaults.list),
            },
            session: raw.session,
        }
    }
}
