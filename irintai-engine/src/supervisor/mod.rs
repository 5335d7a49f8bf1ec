//! Model process supervision.
//!
//! [`ProcessSupervisor`] owns the single active session slot. Each spawn gets
//! a new generation number and cancellation token; a per-generation monitor
//! task waits for the process to exit and either tears it down (on `stop`)
//! or drives crash recovery.

mod args;
mod events;
mod handle;
mod restart;

pub use args::{
    ALLOWED_RUN_PARAMS, QUANTIZATION_MIN_VERSION, QuantizationFlag, RunParams, build_run_args,
    negotiate_quantization, parse_version,
};
pub use events::ProcessEvent;
pub use handle::{ExitState, ProcessHandle};
pub use restart::RestartPolicy;

pub(crate) use handle::SessionIo;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::process::Child;
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::{engine_command, probe_version};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::pump::{OutputPump, PumpLine};
use crate::registry::{ModelRegistry, ModelStatus};

use handle::{LINE_QUEUE_CAPACITY, line_queue};

const EVENT_CAPACITY: usize = 256;

/// The running model, its spawn arguments and its restart budget.
struct ActiveSession {
    model: String,
    binary: PathBuf,
    args: Vec<String>,
    handle: Arc<ProcessHandle>,
    restart: RestartPolicy,
}

struct Shared {
    config: EngineConfig,
    registry: Arc<ModelRegistry>,
    slot: Mutex<Option<ActiveSession>>,
    generation: AtomicU64,
    events: broadcast::Sender<ProcessEvent>,
}

/// Starts, stops and restarts the engine's model process.
///
/// Cloning is cheap; all clones share the same session slot.
#[derive(Clone)]
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    pub fn new(config: EngineConfig, registry: Arc<ModelRegistry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                slot: Mutex::new(None),
                generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.shared.registry
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.shared.events.subscribe()
    }

    /// Name of the model in the active session, if any.
    pub async fn active_model(&self) -> Option<String> {
        self.shared
            .slot
            .lock()
            .await
            .as_ref()
            .map(|s| s.model.clone())
    }

    pub async fn is_running(&self) -> bool {
        self.shared.slot.lock().await.is_some()
    }

    /// Handle of the current generation, if a session is active.
    pub async fn active_handle(&self) -> Option<Arc<ProcessHandle>> {
        self.shared
            .slot
            .lock()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.handle))
    }

    /// Spawn `model` with `params`.
    ///
    /// Returns once the OS has accepted the spawn; readiness is signalled by
    /// the engine's prompt, not by this call. The quantization probe runs
    /// before the session slot is locked, so the checks are repeated once
    /// it is held.
    pub async fn start(&self, model: &str, params: &RunParams) -> Result<()> {
        let shared = &self.shared;
        shared.check_startable(&*shared.slot.lock().await, model)?;

        let quantization = if shared.config.use_8bit {
            shared.negotiate(model).await
        } else {
            None
        };

        let mut slot = shared.slot.lock().await;
        shared.check_startable(&slot, model)?;

        let registry = &shared.registry;
        registry.set_current(Some(model));
        registry.set_status(model, ModelStatus::Loading);

        let binary = match shared.config.find_binary() {
            Ok(binary) => binary,
            Err(e) => {
                shared.fail(model, &e);
                return Err(e);
            }
        };

        let mut args = build_run_args(model, &shared.run_params(params));
        if let Some(flag) = quantization {
            debug!(model, flag = %flag, "Requesting reduced precision");
            args.push(flag.as_arg().to_string());
        }

        info!(model, binary = %binary.display(), "Starting model");
        let handle = match shared.spawn_generation(model, &binary, &args) {
            Ok(handle) => handle,
            Err(e) => {
                error!(model, error = %e, "Failed to start model");
                shared.fail(model, &e);
                return Err(e);
            }
        };

        let generation = handle.generation();
        let pid = handle.pid();
        *slot = Some(ActiveSession {
            model: model.to_string(),
            binary,
            args,
            handle,
            restart: RestartPolicy::from_config(&shared.config.restart),
        });
        registry.set_status(model, ModelStatus::Running);
        shared.emit(ProcessEvent::Started {
            model: model.to_string(),
            generation,
            pid,
        });
        info!(model, generation, pid = ?pid, "Model process started");

        Ok(())
    }

    /// Stop the active model.
    ///
    /// The session is taken out of the slot and its generation cancelled in
    /// one critical section, so a concurrent crash recovery sees an empty
    /// slot and backs off.
    pub async fn stop(&self) -> Result<()> {
        let session = {
            let mut slot = self.shared.slot.lock().await;
            let Some(session) = slot.take() else {
                warn!("Stop requested but no model is running");
                return Err(EngineError::NotRunning);
            };
            session.handle.cancel_token().cancel();
            session
        };

        let model = session.model;
        info!(model = %model, generation = session.handle.generation(), "Stopping model");

        if let Some(monitor) = session.handle.take_monitor()
            && let Err(e) = monitor.await
        {
            warn!(model = %model, error = %e, "Monitor task ended abnormally");
        }

        self.shared.registry.set_status(&model, ModelStatus::Installed);
        self.shared.emit(ProcessEvent::Stopped {
            model: model.clone(),
        });
        info!(model = %model, "Model stopped");
        Ok(())
    }

    /// Stop the active model if there is one.
    pub async fn shutdown(&self) {
        match self.stop().await {
            Ok(()) | Err(EngineError::NotRunning) => {}
            Err(e) => warn!(error = %e, "Error during shutdown"),
        }
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("config", &self.shared.config)
            .field("generation", &self.shared.generation.load(Ordering::SeqCst))
            .finish()
    }
}

impl Shared {
    /// Reject a start without touching any state.
    fn check_startable(&self, slot: &Option<ActiveSession>, model: &str) -> Result<()> {
        if let Some(active) = slot {
            warn!(model, active = %active.model, "Start rejected, a model is already running");
            return Err(EngineError::AlreadyRunning(active.model.clone()));
        }

        let status = self.registry.status(model);
        if status == ModelStatus::NotInstalled {
            return Err(EngineError::ModelNotInstalled(model.to_string()));
        }
        if !status.can_transition_to(ModelStatus::Loading) {
            return Err(EngineError::InvalidTransition {
                model: model.to_string(),
                from: status,
                to: ModelStatus::Loading,
            });
        }
        Ok(())
    }

    /// Probe the engine version and pick a reduced-precision flag.
    async fn negotiate(&self, model: &str) -> Option<QuantizationFlag> {
        let binary = self.config.find_binary().ok()?;
        let version = probe_version(&binary, &self.config).await;
        let flag = negotiate_quantization(version.as_deref());
        debug!(model, version = ?version, flag = ?flag, "Quantization negotiated");
        flag
    }

    /// Caller parameters, with the configured context size as a fallback.
    fn run_params(&self, params: &RunParams) -> RunParams {
        let mut params = params.clone();
        if let Some(context) = self.config.context_size {
            params
                .entry("context".to_string())
                .or_insert_with(|| context.to_string());
        }
        params
    }

    fn emit(&self, event: ProcessEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, model: &str, error: &EngineError) {
        self.registry.set_status(model, ModelStatus::Error);
        self.emit(ProcessEvent::Error {
            model: model.to_string(),
            message: error.to_string(),
        });
    }

    /// Spawn one generation and its pump and monitor tasks.
    ///
    /// Callers hold the slot lock, so the monitor cannot act on the new
    /// generation before it is installed in the slot.
    fn spawn_generation(
        self: &Arc<Self>,
        model: &str,
        binary: &Path,
        args: &[String],
    ) -> Result<Arc<ProcessHandle>> {
        let mut cmd = engine_command(binary, &self.config);
        cmd.args(args).stdin(Stdio::piped());

        let mut child = cmd.spawn().map_err(EngineError::from_spawn)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();

        let (sink, lines) = line_queue(LINE_QUEUE_CAPACITY);
        let events = self.events.clone();
        OutputPump::attach(
            &mut child,
            generation,
            cancel.clone(),
            move |line| {
                if let PumpLine::Content(ref text) = line {
                    let _ = events.send(ProcessEvent::Output {
                        generation,
                        line: text.clone(),
                    });
                }
                sink.push(line);
            },
            move |exit| debug!(generation, exit = ?exit, "Output closed"),
        )?;

        let stdin = child.stdin.take().ok_or_else(|| {
            EngineError::Io(std::io::Error::other("engine stdin was not captured"))
        })?;

        let (exit_tx, exit_rx) = watch::channel(ExitState::Running);
        let handle = Arc::new(ProcessHandle::new(
            model,
            generation,
            child.id(),
            cancel,
            SessionIo { stdin, lines },
            exit_rx,
        ));

        let monitor = tokio::spawn(monitor(
            Arc::clone(self),
            Arc::clone(&handle),
            child,
            exit_tx,
        ));
        handle.set_monitor(monitor);

        Ok(handle)
    }
}

/// Wait for one generation to end and act on it.
async fn monitor(
    shared: Arc<Shared>,
    handle: Arc<ProcessHandle>,
    mut child: Child,
    exit_tx: watch::Sender<ExitState>,
) {
    let generation = handle.generation();
    let exited = tokio::select! {
        biased;
        _ = handle.cancel_token().cancelled() => None,
        status = child.wait() => Some(status),
    };

    let code = match exited {
        None => {
            let code = terminate_child(&mut child, &shared.config, generation).await;
            let _ = exit_tx.send(ExitState::Exited { code });
            return;
        }
        Some(Ok(status)) => status.code(),
        Some(Err(e)) => {
            warn!(generation, error = %e, "Failed to wait for engine process");
            None
        }
    };

    let _ = exit_tx.send(ExitState::Exited { code });
    if handle.is_cancelled() {
        return;
    }

    recover(shared, handle, code).await;
}

async fn terminate_child(child: &mut Child, config: &EngineConfig, generation: u64) -> Option<i32> {
    debug!(generation, pid = ?child.id(), "Terminating engine process");
    handle::terminate(child, config.grace_period).await
}

/// Crash recovery for a generation that exited on its own.
///
/// Every step re-checks that the crashed generation still owns the slot and
/// has not been cancelled; `stop` winning the slot ends recovery.
async fn recover(shared: Arc<Shared>, crashed: Arc<ProcessHandle>, code: Option<i32>) {
    let generation = crashed.generation();
    let mut uptime = crashed.uptime();

    loop {
        let (model, binary, args, attempt, delay) = {
            let mut slot = shared.slot.lock().await;
            let Some(session) = owned_session(&mut slot, &crashed) else {
                debug!(generation, "Exit of superseded generation ignored");
                return;
            };

            let model = session.model.clone();
            let status = shared.registry.status(&model);
            if !status.is_active() {
                *slot = None;
                info!(model = %model, generation, status = %status, "Engine exited");
                shared.registry.set_status(&model, ModelStatus::Installed);
                shared.emit(ProcessEvent::Stopped { model });
                return;
            }

            match session.restart.on_exit(uptime) {
                Some((attempt, delay)) => (
                    model,
                    session.binary.clone(),
                    session.args.clone(),
                    attempt,
                    delay,
                ),
                None => {
                    let attempts = session.restart.attempts();
                    let max_attempts = session.restart.max_attempts();
                    *slot = None;
                    error!(model = %model, generation, attempts, max_attempts, "Engine keeps crashing, giving up");
                    shared.registry.set_status(&model, ModelStatus::Error);
                    shared.emit(ProcessEvent::Error {
                        model,
                        message: format!(
                            "Engine process exited unexpectedly (code {code:?}) and could not be restarted after {attempts} attempts"
                        ),
                    });
                    return;
                }
            }
        };

        warn!(
            model = %model,
            generation,
            attempt,
            code = ?code,
            "Engine exited unexpectedly, restarting in {:?}",
            delay
        );

        tokio::select! {
            _ = crashed.cancel_token().cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let mut slot = shared.slot.lock().await;
        let Some(session) = owned_session(&mut slot, &crashed) else {
            debug!(generation, "Recovery abandoned, session changed during backoff");
            return;
        };

        match shared.spawn_generation(&model, &binary, &args) {
            Ok(handle) => {
                let next = handle.generation();
                let pid = handle.pid();
                session.handle = handle;
                crashed.cancel_token().cancel();
                shared.registry.set_status(&model, ModelStatus::Running);
                shared.emit(ProcessEvent::Restarted {
                    model: model.clone(),
                    generation: next,
                    attempt,
                });
                info!(model = %model, generation = next, pid = ?pid, attempt, "Engine restarted");
                return;
            }
            Err(e) => {
                error!(model = %model, attempt, error = %e, "Restart attempt failed");
                uptime = std::time::Duration::ZERO;
            }
        }
    }
}

/// The active session, if it still belongs to `handle`'s generation.
fn owned_session<'a>(
    slot: &'a mut Option<ActiveSession>,
    handle: &ProcessHandle,
) -> Option<&'a mut ActiveSession> {
    if handle.is_cancelled() {
        return None;
    }
    slot.as_mut()
        .filter(|s| s.handle.generation() == handle.generation())
}
