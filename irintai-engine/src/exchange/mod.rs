//! Prompt/response exchanges with the running model.
//!
//! An exchange writes one formatted line to the engine's stdin and collects
//! cleaned output until the completion marker. Exchanges on the same session
//! are serialized by the session's I/O lock.

mod format;

pub use format::{PromptFormat, PromptFormatter};

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::pump::PumpLine;
use crate::registry::ModelStatus;
use crate::supervisor::{ExitState, ProcessHandle, ProcessSupervisor, SessionIo};

/// Events delivered by a streaming exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum StreamEvent {
    /// One cleaned output line
    Chunk(String),
    /// The full response, sent once the marker is seen
    Complete(String),
    /// The exchange failed; no `Complete` follows
    Error(String),
}

/// Sends prompts to the supervisor's active session.
#[derive(Debug, Clone)]
pub struct ExchangeChannel {
    supervisor: ProcessSupervisor,
}

impl ExchangeChannel {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self { supervisor }
    }

    /// Send `prompt` and wait up to `timeout` for the full response.
    ///
    /// On timeout the error carries whatever was received so far. The rest
    /// of that answer is skipped by the next exchange before it writes.
    pub async fn send<P>(&self, prompt: &str, formatter: &P, timeout: Duration) -> Result<String>
    where
        P: PromptFormatter + ?Sized,
    {
        let handle = self.live_handle().await?;
        let input = formatter.format(prompt);

        let mut io = handle.lock_io().await;
        ensure_live(&handle)?;
        let stale = io.lines.drain_stale();
        if stale > 0 {
            debug!(generation = handle.generation(), stale, "Discarded idle output");
        }

        let registry = self.supervisor.registry();
        let model = handle.model();
        registry.set_status(model, ModelStatus::Generating);
        debug!(model, chars = input.len(), "Sending prompt");

        let result = exchange(&handle, &mut io, &input, timeout).await;
        finish_generating(&self.supervisor, model);

        if let Err(ref e) = result {
            warn!(model, error = %e, "Exchange failed");
        }
        result
    }

    /// Send `prompt` with the configured default timeout.
    pub async fn send_default<P>(&self, prompt: &str, formatter: &P) -> Result<String>
    where
        P: PromptFormatter + ?Sized,
    {
        let timeout = self.supervisor.config().exchange_timeout;
        self.send(prompt, formatter, timeout).await
    }

    /// Send `prompt` on a background task, delivering lines as they arrive.
    ///
    /// The exchange runs until the completion marker or until the process
    /// exits; it has no time limit of its own. Fails immediately with
    /// `NotRunning` when there is no live session; every later failure is
    /// reported as a [`StreamEvent::Error`].
    pub async fn stream<P, F>(
        &self,
        prompt: &str,
        formatter: &P,
        mut on_event: F,
    ) -> Result<JoinHandle<()>>
    where
        P: PromptFormatter + ?Sized,
        F: FnMut(StreamEvent) + Send + 'static,
    {
        let handle = self.live_handle().await?;
        let input = formatter.format(prompt);
        let supervisor = self.supervisor.clone();
        let resync_timeout = supervisor.config().exchange_timeout;

        Ok(tokio::spawn(async move {
            let mut io = handle.lock_io().await;
            if let Err(e) = ensure_live(&handle) {
                on_event(StreamEvent::Error(e.to_string()));
                return;
            }
            io.lines.drain_stale();

            let model = handle.model();
            supervisor
                .registry()
                .set_status(model, ModelStatus::Generating);

            let outcome = stream_exchange(&handle, &mut io, &input, resync_timeout, &mut on_event).await;
            finish_generating(&supervisor, model);

            match outcome {
                Ok(text) => on_event(StreamEvent::Complete(text)),
                Err(e) => {
                    warn!(model, error = %e, "Streaming exchange failed");
                    on_event(StreamEvent::Error(e.to_string()));
                }
            }
        }))
    }

    async fn live_handle(&self) -> Result<Arc<ProcessHandle>> {
        let handle = self
            .supervisor
            .active_handle()
            .await
            .ok_or(EngineError::NotRunning)?;
        ensure_live(&handle)?;
        Ok(handle)
    }
}

fn ensure_live(handle: &ProcessHandle) -> Result<()> {
    if handle.has_exited() || handle.is_cancelled() {
        return Err(EngineError::NotRunning);
    }
    Ok(())
}

fn exited(handle: &ProcessHandle) -> EngineError {
    let code = match handle.exit_state() {
        ExitState::Exited { code } => code,
        ExitState::Running => None,
    };
    EngineError::ProcessExitedUnexpectedly { code }
}

/// Return to `Running` unless recovery or `stop` already moved on.
fn finish_generating(supervisor: &ProcessSupervisor, model: &str) {
    let registry = supervisor.registry();
    if registry.status(model) == ModelStatus::Generating {
        registry.set_status(model, ModelStatus::Running);
    }
}

async fn write_line(stdin: &mut ChildStdin, text: &str) -> Result<()> {
    let mut payload = String::with_capacity(text.len() + 1);
    payload.push_str(text);
    payload.push('\n');
    stdin
        .write_all(payload.as_bytes())
        .await
        .map_err(EngineError::BrokenConnection)?;
    stdin.flush().await.map_err(EngineError::BrokenConnection)
}

/// Wait out the rest of responses abandoned by earlier timeouts.
async fn resync(handle: &ProcessHandle, io: &mut SessionIo, timeout: Duration) -> Result<()> {
    let owed = io.lines.markers_owed();
    if owed == 0 {
        return Ok(());
    }
    debug!(generation = handle.generation(), owed, "Skipping abandoned output");

    let started = Instant::now();
    match tokio::time::timeout(timeout, io.lines.resync()).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(exited(handle)),
        Err(_) => Err(EngineError::Timeout {
            elapsed: started.elapsed(),
            partial: String::new(),
        }),
    }
}

async fn exchange(
    handle: &ProcessHandle,
    io: &mut SessionIo,
    input: &str,
    timeout: Duration,
) -> Result<String> {
    let started = Instant::now();
    resync(handle, io, timeout).await?;

    let remaining = timeout.saturating_sub(started.elapsed());
    if remaining.is_zero() {
        return Err(EngineError::Timeout {
            elapsed: started.elapsed(),
            partial: String::new(),
        });
    }

    let mut response: Vec<String> = Vec::new();
    let mut written = false;
    let outcome = tokio::time::timeout(remaining, async {
        written = true;
        if let Err(e) = write_line(&mut io.stdin, input).await {
            return Err(e);
        }
        while let Some(line) = io.lines.recv().await {
            match line {
                PumpLine::Content(text) => response.push(text),
                PumpLine::Marker => return Ok(()),
            }
        }
        Err(exited(handle))
    })
    .await;

    match outcome {
        Ok(Ok(())) => Ok(response.join("\n").trim().to_string()),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            // The engine is still answering; its marker belongs to this prompt
            if written {
                io.lines.owe_marker();
            }
            Err(EngineError::Timeout {
                elapsed: started.elapsed(),
                partial: response.join("\n"),
            })
        }
    }
}

async fn stream_exchange<F>(
    handle: &ProcessHandle,
    io: &mut SessionIo,
    input: &str,
    resync_timeout: Duration,
    on_event: &mut F,
) -> Result<String>
where
    F: FnMut(StreamEvent),
{
    resync(handle, io, resync_timeout).await?;
    write_line(&mut io.stdin, input).await?;

    let mut response = Vec::new();
    while let Some(line) = io.lines.recv().await {
        match line {
            PumpLine::Content(text) => {
                on_event(StreamEvent::Chunk(text.clone()));
                response.push(text);
            }
            PumpLine::Marker => return Ok(response.join("\n").trim().to_string()),
        }
    }
    Err(exited(handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::registry::ModelRegistry;

    fn channel() -> ExchangeChannel {
        let supervisor = ProcessSupervisor::new(EngineConfig::default(), Arc::new(ModelRegistry::new()));
        ExchangeChannel::new(supervisor)
    }

    #[tokio::test]
    async fn send_without_session_is_not_running() {
        let channel = channel();

        let result = channel
            .send("hi", &PromptFormat::Default, Duration::from_secs(1))
            .await;

        assert!(matches!(result, Err(EngineError::NotRunning)));
    }

    #[tokio::test]
    async fn stream_without_session_is_not_running() {
        let channel = channel();

        let result = channel
            .stream("hi", &PromptFormat::Default, |_| {})
            .await;

        assert!(matches!(result, Err(EngineError::NotRunning)));
    }

    #[test]
    fn stream_events_serialize_with_text() {
        let json = serde_json::to_string(&StreamEvent::Chunk("hello".to_string())).unwrap();
        assert_eq!(json, r#"{"type":"chunk","text":"hello"}"#);
    }
}
