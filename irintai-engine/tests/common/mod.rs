//! Fake engine scripts and polling helpers shared by the integration tests.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use irintai_engine::{EngineConfig, ModelRegistry, ModelStatus, ProcessEvent};
use tempfile::TempDir;
use tokio::sync::broadcast;

/// A shell script standing in for the engine binary.
///
/// `body` is the script after the shebang; `$dir` is set to the script's
/// directory so scripts can keep state between invocations.
pub struct FakeEngine {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl FakeEngine {
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ollama");
        let script = format!("#!/bin/sh\ndir=$(dirname \"$0\")\n{body}\n");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir, path }
    }

    /// Config pointing at this script, with fast retry timings.
    pub fn config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_binary_path(&self.path)
            .with_models_dir(self.dir.path().join("models"))
            .with_restart(Duration::from_millis(20), Duration::from_secs(5))
            .with_list_backoff(Duration::from_millis(10))
            .with_grace_period(Duration::from_secs(1))
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.file(name)).unwrap_or_default()
    }

    /// Wait until the script has written a complete line to `name`.
    pub async fn wait_for_line(&self, name: &str) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let text = self.read(name);
                if text.ends_with('\n') {
                    return text;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_default()
    }
}

/// Engine whose `run` answers every input line with `hello` and a prompt.
pub const ECHO_ENGINE: &str = r#"
case "$1" in
  run)
    while IFS= read -r line; do
      echo "$line" >> "$dir/input.log"
      echo "hello"
      echo ">"
    done
    ;;
esac
"#;

/// Registry with `models` already installed.
pub fn installed(models: &[&str]) -> Arc<ModelRegistry> {
    let registry = Arc::new(ModelRegistry::new());
    for model in models {
        registry.set_status(model, ModelStatus::Installed);
    }
    registry
}

/// Poll until `model` reaches `status`.
pub async fn wait_for_status(
    registry: &ModelRegistry,
    model: &str,
    status: ModelStatus,
    timeout: Duration,
) -> bool {
    tokio::time::timeout(timeout, async {
        while registry.status(model) != status {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Collect lifecycle events, skipping output, until `done` matches one.
pub async fn collect_until<F>(
    events: &mut broadcast::Receiver<ProcessEvent>,
    timeout: Duration,
    done: F,
) -> Vec<ProcessEvent>
where
    F: Fn(&ProcessEvent) -> bool,
{
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        while let Ok(event) = events.recv().await {
            if matches!(event, ProcessEvent::Output { .. }) {
                continue;
            }
            let finished = done(&event);
            seen.push(event);
            if finished {
                break;
            }
        }
    })
    .await;
    seen
}

/// Lifecycle events already queued, without waiting.
pub fn drain(events: &mut broadcast::Receiver<ProcessEvent>) -> Vec<ProcessEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if !matches!(event, ProcessEvent::Output { .. }) {
            seen.push(event);
        }
    }
    seen
}

pub fn restarts(events: &[ProcessEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            ProcessEvent::Restarted { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect()
}
