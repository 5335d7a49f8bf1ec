//! Interactive chat with a local model.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use irintai_engine::{
    ExchangeChannel, InstallCoordinator, ModelRegistry, ProcessEvent, ProcessSupervisor,
    PromptFormat, RunParams, StreamEvent,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::config::{ConfigLoader, SessionConfig};

/// Lines that end an interactive session.
const EXIT_COMMANDS: &[&str] = &["/bye", "/exit", "exit", "quit"];

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Model to run (defaults to session.default_model)
    pub model: Option<String>,

    /// Engine parameter as key=value (temperature, context, threads, gpu, seed)
    #[arg(long = "param", value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// Prompt template: default, chatml, llama or coder
    #[arg(long)]
    pub format: Option<PromptFormat>,

    /// Send one prompt, print the answer and exit
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// Print response lines as they arrive
    #[arg(long)]
    pub stream: bool,

    /// Seconds to wait for each response (streamed responses have no limit)
    #[arg(long, conflicts_with = "stream")]
    pub timeout: Option<u64>,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("missing parameter name in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Merge configured parameters with command line ones (command line wins).
fn run_params(session: &SessionConfig, overrides: &[(String, String)]) -> RunParams {
    let mut params = session.params.clone();
    params.extend(overrides.iter().cloned());
    params
}

pub async fn run(args: RunArgs) -> Result<()> {
    let config = ConfigLoader::load()?;
    let Some(model) = args.model.clone().or(config.session.default_model.clone()) else {
        bail!("No model given and session.default_model is not configured");
    };

    let registry = Arc::new(ModelRegistry::with_recommended());
    let installer = InstallCoordinator::new(config.engine.clone(), Arc::clone(&registry));
    if !installer.verify(&model).await? {
        bail!(
            "Model '{}' is not installed. Run `irintai models install {}` first.",
            model,
            model
        );
    }

    let format = args
        .format
        .or(config.session.format)
        .unwrap_or_else(|| PromptFormat::for_model(&model));
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(config.engine.exchange_timeout);

    let supervisor = ProcessSupervisor::new(config.engine.clone(), Arc::clone(&registry));
    let watcher = tokio::spawn(report_events(supervisor.subscribe()));

    supervisor
        .start(&model, &run_params(&config.session, &args.params))
        .await
        .with_context(|| format!("Failed to start {model}"))?;
    debug!(model = %model, format = %format, "Session started");

    let channel = ExchangeChannel::new(supervisor.clone());
    let result = match &args.prompt {
        Some(prompt) => ask(&channel, prompt, &format, timeout, args.stream).await,
        None => repl(&channel, &model, &format, timeout, args.stream).await,
    };

    supervisor.shutdown().await;
    watcher.abort();
    result
}

async fn repl(
    channel: &ExchangeChannel,
    model: &str,
    format: &PromptFormat,
    timeout: Duration,
    stream: bool,
) -> Result<()> {
    println!("Chatting with {model}. Type /bye to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!(">>> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if EXIT_COMMANDS.contains(&prompt) {
            break;
        }

        if let Err(e) = ask(channel, prompt, format, timeout, stream).await {
            eprintln!("Error: {e:#}");
        }
    }

    Ok(())
}

async fn ask(
    channel: &ExchangeChannel,
    prompt: &str,
    format: &PromptFormat,
    timeout: Duration,
    stream: bool,
) -> Result<()> {
    if stream {
        let task = channel
            .stream(prompt, format, |event| match event {
                StreamEvent::Chunk(line) => println!("{line}"),
                StreamEvent::Complete(_) => {}
                StreamEvent::Error(message) => eprintln!("Error: {message}"),
            })
            .await?;
        task.await?;
        return Ok(());
    }

    match channel.send(prompt, format, timeout).await {
        Ok(response) => {
            println!("{response}");
            Ok(())
        }
        Err(e) => {
            if let Some(partial) = e.partial_response()
                && !partial.is_empty()
            {
                println!("{partial}");
            }
            Err(e.into())
        }
    }
}

/// Surface recovery activity while a session is open.
async fn report_events(mut events: broadcast::Receiver<ProcessEvent>) {
    loop {
        match events.recv().await {
            Ok(ProcessEvent::Restarted { model, attempt, .. }) => {
                warn!(model = %model, attempt, "Model process restarted");
            }
            Ok(ProcessEvent::Error { model, message }) => {
                error!(model = %model, "{}", message);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Event watcher lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
