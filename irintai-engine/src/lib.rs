//! irintai-engine - supervision of a local inference engine
//!
//! This crate manages an externally installed model runtime (such as
//! `ollama`) as a child process:
//!
//! - [`ModelRegistry`] tracks model status behind a closed transition table
//! - [`OutputPump`] drains and cleans engine output
//! - [`ProcessSupervisor`] owns the single running model, with crash recovery
//! - [`InstallCoordinator`] runs install, uninstall and list commands
//! - [`ExchangeChannel`] serializes prompt/response exchanges
//!
//! ```no_run
//! use std::sync::Arc;
//! use irintai_engine::{
//!     EngineConfig, ExchangeChannel, ModelRegistry, ProcessSupervisor, PromptFormat, RunParams,
//! };
//!
//! # async fn example() -> irintai_engine::Result<()> {
//! let registry = Arc::new(ModelRegistry::with_recommended());
//! registry.set_status("mistral:instruct", irintai_engine::ModelStatus::Installed);
//!
//! let supervisor = ProcessSupervisor::new(EngineConfig::default(), Arc::clone(&registry));
//! supervisor.start("mistral:instruct", &RunParams::new()).await?;
//!
//! let channel = ExchangeChannel::new(supervisor.clone());
//! let format = PromptFormat::for_model("mistral:instruct");
//! let answer = channel.send_default("Hello!", &format).await?;
//! println!("{answer}");
//!
//! supervisor.stop().await?;
//! # Ok(())
//! # }
//! ```

mod command;
pub mod config;
pub mod error;
pub mod exchange;
pub mod install;
pub mod pump;
pub mod registry;
pub mod supervisor;

pub use config::{EngineConfig, ListConfig, RestartConfig};
pub use error::{EngineError, Result};
pub use exchange::{ExchangeChannel, PromptFormat, PromptFormatter, StreamEvent};
pub use install::{InstallCoordinator, InstallJob, ListedModel};
pub use pump::{OutputPump, PumpExit, PumpLine};
pub use registry::{ModelDescriptor, ModelRegistry, ModelStatus, RECOMMENDED_MODELS};
pub use supervisor::{ProcessEvent, ProcessHandle, ProcessSupervisor, RunParams};
