//! Start, stop and crash recovery against a fake engine

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{ECHO_ENGINE, FakeEngine, collect_until, drain, installed, restarts, wait_for_status};
use irintai_engine::{EngineError, ModelStatus, ProcessEvent, ProcessSupervisor, RunParams};

const CRASHING_ENGINE: &str = r#"
case "$1" in
  run) exit 1;;
esac
"#;

/// Crashes on the first run, then serves until stopped.
const FLAKY_ENGINE: &str = r#"
case "$1" in
  run)
    if [ ! -f "$dir/crashed" ]; then
      touch "$dir/crashed"
      exit 1
    fi
    while IFS= read -r line; do echo ">"; done
    ;;
esac
"#;

fn params(pairs: &[(&str, &str)]) -> RunParams {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn start_and_stop_model() {
    let engine = FakeEngine::new(ECHO_ENGINE);
    let registry = installed(&["llama2"]);
    let supervisor = ProcessSupervisor::new(engine.config(), Arc::clone(&registry));
    let mut events = supervisor.subscribe();

    supervisor.start("llama2", &RunParams::new()).await.unwrap();

    assert_eq!(registry.status("llama2"), ModelStatus::Running);
    assert_eq!(supervisor.active_model().await.as_deref(), Some("llama2"));
    assert_eq!(registry.current().as_deref(), Some("llama2"));

    supervisor.stop().await.unwrap();

    assert_eq!(registry.status("llama2"), ModelStatus::Installed);
    assert!(!supervisor.is_running().await);
    let seen = drain(&mut events);
    assert!(matches!(seen.first(), Some(ProcessEvent::Started { generation: 1, .. })));
    assert!(matches!(seen.last(), Some(ProcessEvent::Stopped { model }) if model == "llama2"));
}

#[tokio::test]
async fn second_start_is_rejected() {
    let engine = FakeEngine::new(ECHO_ENGINE);
    let registry = installed(&["llama2", "mistral"]);
    let supervisor = ProcessSupervisor::new(engine.config(), Arc::clone(&registry));

    supervisor.start("llama2", &RunParams::new()).await.unwrap();
    let second = supervisor.start("mistral", &RunParams::new()).await;

    assert!(matches!(second, Err(EngineError::AlreadyRunning(ref m)) if m == "llama2"));
    assert_eq!(supervisor.active_model().await.as_deref(), Some("llama2"));
    assert_eq!(registry.status("mistral"), ModelStatus::Installed);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn start_passes_allowed_params_only() {
    let engine = FakeEngine::new(
        r#"
case "$1" in
  run)
    echo "$@" > "$dir/args"
    while IFS= read -r line; do echo ">"; done
    ;;
esac
"#,
    );
    let registry = installed(&["llama2"]);
    let supervisor = ProcessSupervisor::new(engine.config(), Arc::clone(&registry));

    supervisor
        .start(
            "llama2",
            &params(&[("temperature", "0.2"), ("verbose", "yes"), ("seed", "7")]),
        )
        .await
        .unwrap();

    let args = engine.wait_for_line("args").await;

    assert_eq!(args.trim(), "run llama2 --seed 7 --temperature 0.2");
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn eight_bit_uses_negotiated_flag() {
    let engine = FakeEngine::new(
        r#"
case "$1" in
  --version) echo "ollama version is 0.1.32";;
  run)
    echo "$@" > "$dir/args"
    while IFS= read -r line; do echo ">"; done
    ;;
esac
"#,
    );
    let registry = installed(&["llama2"]);
    let config = engine.config().with_8bit(true);
    let supervisor = ProcessSupervisor::new(config, Arc::clone(&registry));

    supervisor.start("llama2", &RunParams::new()).await.unwrap();

    let args = engine.wait_for_line("args").await;

    assert_eq!(args.trim(), "run llama2 --quantization=8bit");
    supervisor.stop().await.unwrap();
}

const ARGS_ENGINE: &str = r#"
case "$1" in
  --version) sleep 1; echo "ollama version is 0.1.32";;
  run)
    echo "$@" > "$dir/args"
    while IFS= read -r line; do echo ">"; done
    ;;
esac
"#;

#[tokio::test]
async fn configured_context_size_fills_in_missing_param() {
    let engine = FakeEngine::new(ARGS_ENGINE);
    let registry = installed(&["llama2"]);
    let config = engine.config().with_context_size(8192);
    let supervisor = ProcessSupervisor::new(config, Arc::clone(&registry));

    supervisor.start("llama2", &RunParams::new()).await.unwrap();
    assert_eq!(
        engine.wait_for_line("args").await.trim(),
        "run llama2 --context 8192"
    );
    supervisor.stop().await.unwrap();
    std::fs::remove_file(engine.file("args")).unwrap();

    supervisor
        .start("llama2", &params(&[("context", "2048")]))
        .await
        .unwrap();
    assert_eq!(
        engine.wait_for_line("args").await.trim(),
        "run llama2 --context 2048"
    );
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn version_probe_does_not_block_queries() {
    let engine = FakeEngine::new(ARGS_ENGINE);
    let registry = installed(&["llama2"]);
    let config = engine.config().with_8bit(true);
    let supervisor = ProcessSupervisor::new(config, Arc::clone(&registry));

    let starting = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.start("llama2", &RunParams::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let running = tokio::time::timeout(Duration::from_millis(100), supervisor.is_running()).await;
    assert_eq!(running.ok(), Some(false));

    starting.await.unwrap().unwrap();
    assert_eq!(
        engine.wait_for_line("args").await.trim(),
        "run llama2 --quantization=8bit"
    );
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn stop_escalates_to_kill() {
    let engine = FakeEngine::new(
        r#"
case "$1" in
  run)
    trap '' TERM
    while true; do sleep 0.1; done
    ;;
esac
"#,
    );
    let registry = installed(&["llama2"]);
    let config = engine.config().with_grace_period(Duration::from_millis(200));
    let supervisor = ProcessSupervisor::new(config, Arc::clone(&registry));

    supervisor.start("llama2", &RunParams::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    supervisor.stop().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(registry.status("llama2"), ModelStatus::Installed);
}

#[tokio::test]
async fn crashing_engine_gives_up_after_three_restarts() {
    let engine = FakeEngine::new(CRASHING_ENGINE);
    let registry = installed(&["llama2"]);
    let supervisor = ProcessSupervisor::new(engine.config(), Arc::clone(&registry));
    let mut events = supervisor.subscribe();

    supervisor.start("llama2", &RunParams::new()).await.unwrap();
    let seen = collect_until(&mut events, Duration::from_secs(10), |e| {
        matches!(e, ProcessEvent::Error { .. })
    })
    .await;

    assert_eq!(restarts(&seen), vec![1, 2, 3]);
    assert!(matches!(seen.last(), Some(ProcessEvent::Error { .. })));
    assert_eq!(registry.status("llama2"), ModelStatus::Error);
    assert!(!supervisor.is_running().await);
    assert!(matches!(
        supervisor.stop().await,
        Err(EngineError::NotRunning)
    ));
}

#[tokio::test]
async fn single_crash_recovers() {
    let engine = FakeEngine::new(FLAKY_ENGINE);
    let registry = installed(&["llama2"]);
    let supervisor = ProcessSupervisor::new(engine.config(), Arc::clone(&registry));
    let mut events = supervisor.subscribe();

    supervisor.start("llama2", &RunParams::new()).await.unwrap();
    let seen = collect_until(&mut events, Duration::from_secs(5), |e| {
        matches!(e, ProcessEvent::Restarted { .. })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let later = drain(&mut events);

    assert_eq!(restarts(&seen), vec![1]);
    assert!(restarts(&later).is_empty());
    assert_eq!(registry.status("llama2"), ModelStatus::Running);
    assert!(matches!(
        seen.last(),
        Some(ProcessEvent::Restarted { generation: 2, .. })
    ));

    supervisor.stop().await.unwrap();
    assert_eq!(registry.status("llama2"), ModelStatus::Installed);
}

#[tokio::test]
async fn stop_during_backoff_cancels_recovery() {
    let engine = FakeEngine::new(CRASHING_ENGINE);
    let registry = installed(&["llama2"]);
    let config = engine
        .config()
        .with_restart(Duration::from_secs(5), Duration::from_secs(10));
    let supervisor = ProcessSupervisor::new(config, Arc::clone(&registry));
    let mut events = supervisor.subscribe();

    supervisor.start("llama2", &RunParams::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    supervisor.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = drain(&mut events);
    assert!(restarts(&seen).is_empty());
    assert!(matches!(seen.last(), Some(ProcessEvent::Stopped { .. })));
    assert_eq!(registry.status("llama2"), ModelStatus::Installed);
}

#[tokio::test]
async fn exit_while_not_running_clears_session() {
    let engine = FakeEngine::new(
        r#"
case "$1" in
  run) sleep 0.3; exit 0;;
esac
"#,
    );
    let registry = installed(&["llama2"]);
    let supervisor = ProcessSupervisor::new(engine.config(), Arc::clone(&registry));
    let mut events = supervisor.subscribe();

    supervisor.start("llama2", &RunParams::new()).await.unwrap();
    // Simulate the session having been reset outside of a run
    registry.set_status("llama2", ModelStatus::Installed);

    let seen = collect_until(&mut events, Duration::from_secs(5), |e| {
        matches!(e, ProcessEvent::Stopped { .. })
    })
    .await;

    assert!(restarts(&seen).is_empty());
    assert!(matches!(seen.last(), Some(ProcessEvent::Stopped { .. })));
    assert!(!supervisor.is_running().await);
    assert!(wait_for_status(&registry, "llama2", ModelStatus::Installed, Duration::from_secs(1)).await);
}

#[tokio::test]
async fn status_listener_follows_current_model() {
    let engine = FakeEngine::new(ECHO_ENGINE);
    let registry = installed(&["llama2"]);
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    registry.set_listener(move |name, status| {
        sink.lock().unwrap().push((name.to_string(), status));
    });
    let supervisor = ProcessSupervisor::new(engine.config(), Arc::clone(&registry));

    supervisor.start("llama2", &RunParams::new()).await.unwrap();
    supervisor.stop().await.unwrap();

    let statuses: Vec<_> = seen.lock().unwrap().iter().map(|(_, s)| *s).collect();
    assert_eq!(
        statuses,
        vec![
            ModelStatus::Loading,
            ModelStatus::Running,
            ModelStatus::Installed
        ]
    );
}
