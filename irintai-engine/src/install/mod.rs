//! Model installation, removal and discovery.
//!
//! Install and uninstall run the engine's `pull`/`rm` subcommands on their
//! own tasks and report through the registry. Listing runs `list` with a
//! bounded retry.

mod parse;

pub use parse::{ListedModel, parse_list, parse_percent};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::command::{engine_command, run_captured};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::pump::{clean_line, merged_lines};
use crate::registry::{ModelRegistry, ModelStatus};

/// Sentinel for "no progress reported yet" in [`InstallJob::last_percent`].
const NO_PERCENT: u64 = u64::MAX;

/// A running install or uninstall.
///
/// There is no way to cancel a job; dropping it detaches the task.
#[derive(Debug)]
pub struct InstallJob {
    model: String,
    action: &'static str,
    last_percent: Arc<AtomicU64>,
    task: JoinHandle<Result<()>>,
}

impl InstallJob {
    pub fn model(&self) -> &str {
        &self.model
    }

    /// `"install"` or `"uninstall"`.
    pub fn action(&self) -> &'static str {
        self.action
    }

    /// Last progress percentage parsed from the engine output.
    pub fn last_percent(&self) -> Option<f64> {
        match self.last_percent.load(Ordering::Relaxed) {
            NO_PERCENT => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the job to end.
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::InstallFailure {
                action: self.action,
                model: self.model,
                reason: e.to_string(),
            }),
        }
    }
}

/// Runs install, uninstall and list commands against the engine.
#[derive(Debug, Clone)]
pub struct InstallCoordinator {
    config: EngineConfig,
    registry: Arc<ModelRegistry>,
}

impl InstallCoordinator {
    pub fn new(config: EngineConfig, registry: Arc<ModelRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Pull `model`, reporting every parsed percentage to `on_progress`.
    ///
    /// Returns once the engine command is running; the pull itself continues
    /// on a background task owned by the returned [`InstallJob`].
    pub async fn install<F>(&self, model: &str, on_progress: F) -> Result<InstallJob>
    where
        F: FnMut(f64) + Send + 'static,
    {
        self.spawn_job(
            "install",
            model,
            &["pull", model],
            ModelStatus::Installing,
            ModelStatus::Installed,
            on_progress,
        )
    }

    /// Remove `model` from the engine's store.
    pub async fn uninstall(&self, model: &str) -> Result<InstallJob> {
        self.spawn_job(
            "uninstall",
            model,
            &["rm", model],
            ModelStatus::Uninstalling,
            ModelStatus::NotInstalled,
            |_| {},
        )
    }

    fn spawn_job<F>(
        &self,
        action: &'static str,
        model: &str,
        args: &[&str],
        busy: ModelStatus,
        done: ModelStatus,
        mut on_progress: F,
    ) -> Result<InstallJob>
    where
        F: FnMut(f64) + Send + 'static,
    {
        self.registry.transition(model, busy)?;

        let failed = |e: EngineError| {
            warn!(model, action, error = %e, "Could not start engine command");
            self.registry.set_status(model, ModelStatus::Error);
            e
        };

        let binary = self.config.find_binary().map_err(failed)?;
        let mut cmd = engine_command(&binary, &self.config);
        cmd.args(args);
        let mut child = cmd.spawn().map_err(|e| failed(EngineError::from_spawn(e)))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(failed(EngineError::Io(std::io::Error::other(
                "engine output was not captured",
            ))));
        };

        info!(model, action, "Starting {}", action);

        let last_percent = Arc::new(AtomicU64::new(NO_PERCENT));
        let progress = Arc::clone(&last_percent);
        let registry = Arc::clone(&self.registry);
        let name = model.to_string();

        let task = tokio::spawn(async move {
            let mut lines = merged_lines(stdout, stderr);
            let mut last_line = String::new();

            while let Some(segment) = lines.next().await {
                let raw = match segment {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(model = %name, error = %e, "Failed to read {} output", action);
                        break;
                    }
                };
                let line = clean_line(&raw);
                if line.is_empty() {
                    continue;
                }
                info!(target: "irintai::install", model = %name, "{}", line);
                if let Some(percent) = parse_percent(&line) {
                    progress.store(percent.to_bits(), Ordering::Relaxed);
                    on_progress(percent);
                }
                last_line = line;
            }

            let status = child.wait().await;
            match status {
                Ok(status) if status.success() => {
                    registry.set_status(&name, done);
                    info!(model = %name, action, "Finished {}", action);
                    Ok(())
                }
                Ok(status) => {
                    registry.set_status(&name, ModelStatus::Error);
                    let reason = if last_line.is_empty() {
                        format!("engine exited with code {:?}", status.code())
                    } else {
                        last_line
                    };
                    warn!(model = %name, action, code = ?status.code(), reason = %reason, "Engine command failed");
                    Err(EngineError::InstallFailure {
                        action,
                        model: name,
                        reason,
                    })
                }
                Err(e) => {
                    registry.set_status(&name, ModelStatus::Error);
                    Err(EngineError::InstallFailure {
                        action,
                        model: name,
                        reason: e.to_string(),
                    })
                }
            }
        });

        Ok(InstallJob {
            model: model.to_string(),
            action,
            last_percent,
            task,
        })
    }

    /// List installed models, or the remote catalog when `remote` is set.
    ///
    /// Installed models are marked `Installed` in the registry, with size.
    pub async fn list_models(&self, remote: bool) -> Result<Vec<ListedModel>> {
        let binary = self.config.find_binary()?;
        let args: &[&str] = if remote { &["list", "remote"] } else { &["list"] };
        let attempts = self.config.list.attempts.max(1);
        let mut reason = String::new();

        for attempt in 1..=attempts {
            match run_captured(&binary, &self.config, args, self.config.list.timeout).await {
                Ok(output) if output.status.success() => {
                    let models = parse_list(&String::from_utf8_lossy(&output.stdout));
                    debug!(count = models.len(), remote, attempt, "Listed models");
                    if !remote {
                        self.record_installed(&models);
                    }
                    return Ok(models);
                }
                Ok(output) => {
                    let stderr = clean_line(&String::from_utf8_lossy(&output.stderr));
                    reason = if stderr.is_empty() {
                        format!("engine exited with code {:?}", output.status.code())
                    } else {
                        stderr
                    };
                }
                Err(EngineError::ExecutableNotFound) => return Err(EngineError::ExecutableNotFound),
                Err(e) => reason = e.to_string(),
            }

            warn!(attempt, attempts, reason = %reason, "Listing models failed");
            if attempt < attempts {
                tokio::time::sleep(self.config.list.backoff).await;
            }
        }

        Err(EngineError::ListFailure { attempts, reason })
    }

    fn record_installed(&self, models: &[ListedModel]) {
        for model in models {
            let status = self.registry.status(&model.name);
            if !(status.is_active() || status.is_busy()) {
                self.registry.set_status(&model.name, ModelStatus::Installed);
            }
            self.registry
                .set_installed_size(&model.name, model.size.clone());
        }
    }

    /// Check whether `model` is installed and update the registry.
    ///
    /// A directory named after the model in the store counts as installed
    /// without asking the engine. Models that are loaded or mid-install keep
    /// their status.
    pub async fn verify(&self, model: &str) -> Result<bool> {
        let installed = if self.model_path(model).is_dir() {
            true
        } else {
            let binary = self.config.find_binary()?;
            let output = run_captured(&binary, &self.config, &["list"], self.config.probe_timeout).await?;
            output.status.success()
                && String::from_utf8_lossy(&output.stdout).contains(model)
        };

        let status = self.registry.status(model);
        if !(status.is_active() || status.is_busy()) {
            let target = if installed {
                ModelStatus::Installed
            } else {
                ModelStatus::NotInstalled
            };
            self.registry.set_status(model, target);
        }
        debug!(model, installed, "Verified model");
        Ok(installed)
    }

    fn model_path(&self, model: &str) -> PathBuf {
        self.config.models_dir.join(model)
    }
}
