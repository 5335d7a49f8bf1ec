//! Engine CLI wrapper
//!
//! Every engine invocation goes through [`engine_command`] so the model
//! store environment is applied consistently.

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// Build a command for the engine with piped output and the store environment.
pub(crate) fn engine_command(binary: &Path, config: &EngineConfig) -> Command {
    let mut cmd = Command::new(binary);
    cmd.envs(config.env_vars())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Run an engine subcommand to completion and capture its output.
pub(crate) async fn run_captured(
    binary: &Path,
    config: &EngineConfig,
    args: &[&str],
    timeout: Duration,
) -> Result<Output> {
    let mut cmd = engine_command(binary, config);
    cmd.args(args);

    let child = cmd.spawn().map_err(EngineError::from_spawn)?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("engine {} timed out after {:?}", args.join(" "), timeout),
        ))),
    }
}

/// Ask the engine for its version string.
///
/// Tries `--version` first and falls back to the `version` subcommand.
/// Returns `None` when neither produces output.
pub(crate) async fn probe_version(binary: &Path, config: &EngineConfig) -> Option<String> {
    for args in [["--version"], ["version"]] {
        match run_captured(binary, config, &args, config.probe_timeout).await {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !text.is_empty() {
                    return Some(text);
                }
            }
            Ok(output) => {
                debug!(args = ?args, status = ?output.status, "Version probe failed");
            }
            Err(e) => {
                debug!(args = ?args, error = %e, "Version probe failed");
            }
        }
    }
    None
}
