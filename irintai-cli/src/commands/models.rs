//! Model management commands.
//!
//! Lists, installs, removes and inspects models through the engine.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use irintai_engine::{
    InstallCoordinator, ListedModel, ModelDescriptor, ModelRegistry, ModelStatus, PromptFormat,
};
use tracing::debug;

use crate::config::ConfigLoader;

/// Models management arguments.
#[derive(Args, Debug)]
pub struct ModelsArgs {
    #[command(subcommand)]
    pub command: ModelsCommands,
}

/// Models subcommands.
#[derive(Subcommand, Debug)]
pub enum ModelsCommands {
    /// List installed and recommended models
    List {
        /// List the engine's remote catalog instead
        #[arg(long)]
        remote: bool,
    },
    /// Download a model
    Install {
        /// Model name (e.g., mistral:instruct)
        model: String,
    },
    /// Remove an installed model
    Uninstall {
        model: String,
    },
    /// Show model status and details
    Info {
        model: String,
    },
}

/// Run models command.
pub async fn run(args: ModelsArgs) -> Result<()> {
    let config = ConfigLoader::load()?;
    let registry = Arc::new(ModelRegistry::with_recommended());
    let installer = InstallCoordinator::new(config.engine, Arc::clone(&registry));

    match args.command {
        ModelsCommands::List { remote } => list_models(&installer, remote).await,
        ModelsCommands::Install { model } => install_model(&installer, &model).await,
        ModelsCommands::Uninstall { model } => uninstall_model(&installer, &model).await,
        ModelsCommands::Info { model } => show_model_info(&installer, &model).await,
    }
}

async fn list_models(installer: &InstallCoordinator, remote: bool) -> Result<()> {
    let listed = installer
        .list_models(remote)
        .await
        .context("Failed to query the engine")?;

    if remote {
        print_remote(&listed);
        return Ok(());
    }

    debug!(installed = listed.len(), "Listed installed models");
    println!("{}", models_table(&installer.registry().list()));
    Ok(())
}

fn print_remote(models: &[ListedModel]) {
    if models.is_empty() {
        println!("The engine returned no remote models.");
        return;
    }
    for model in models {
        println!("{}", model.name);
    }
}

fn models_table(models: &[ModelDescriptor]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Model").fg(Color::Cyan),
        Cell::new("Status").fg(Color::Cyan),
        Cell::new("Context").fg(Color::Cyan),
        Cell::new("Size").fg(Color::Cyan),
        Cell::new("Notes").fg(Color::Cyan),
    ]);

    for model in models {
        let status = Cell::new(model.status.to_string()).fg(status_color(model.status));
        table.add_row(vec![
            Cell::new(&model.name),
            status,
            Cell::new(model.context.as_deref().unwrap_or("-")),
            Cell::new(model.size.as_deref().unwrap_or("-")),
            Cell::new(model.notes.as_deref().unwrap_or("")),
        ]);
    }

    table
}

fn status_color(status: ModelStatus) -> Color {
    match status {
        ModelStatus::Installed | ModelStatus::Running => Color::Green,
        ModelStatus::Error => Color::Red,
        ModelStatus::NotInstalled => Color::DarkGrey,
        _ => Color::Yellow,
    }
}

async fn install_model(installer: &InstallCoordinator, model: &str) -> Result<()> {
    let name = model.to_string();
    let job = installer.install(model, move |percent| {
        print!("\r{name}: {percent:>5.1}%");
        let _ = std::io::stdout().flush();
    })
    .await?;

    let result = job.wait().await;
    println!();
    result?;

    println!("Installed {model}");
    Ok(())
}

async fn uninstall_model(installer: &InstallCoordinator, model: &str) -> Result<()> {
    // Populate the registry so the uninstall transition starts from Installed
    installer.list_models(false).await?;
    if installer.registry().status(model) != ModelStatus::Installed {
        anyhow::bail!("Model '{}' is not installed", model);
    }

    installer.uninstall(model).await?.wait().await?;
    println!("Removed {model}");
    Ok(())
}

async fn show_model_info(installer: &InstallCoordinator, model: &str) -> Result<()> {
    let installed = installer.verify(model).await?;
    if installed {
        // Size comes from the listing
        installer.list_models(false).await?;
    }

    let registry = installer.registry();
    let descriptor = registry
        .descriptor(model)
        .unwrap_or_else(|| ModelDescriptor::new(model, registry.status(model)));

    println!("Model:   {}", descriptor.name);
    println!("Status:  {}", descriptor.status);
    println!("Format:  {}", PromptFormat::for_model(model));
    if let Some(context) = &descriptor.context {
        println!("Context: {}", context);
    }
    if let Some(size) = &descriptor.size {
        println!("Size:    {}", size);
    }
    if let Some(notes) = &descriptor.notes {
        println!("Notes:   {}", notes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lists_recommended_models() {
        let registry = ModelRegistry::with_recommended();
        registry.set_status("mistral:instruct", ModelStatus::Installed);

        let rendered = models_table(&registry.list()).to_string();

        assert!(rendered.contains("mistral:instruct"));
        assert!(rendered.contains("Installed"));
        assert!(rendered.contains("Not Installed"));
        assert!(rendered.contains("Balanced assistant"));
    }

    #[test]
    fn status_colors() {
        assert_eq!(status_color(ModelStatus::Running), Color::Green);
        assert_eq!(status_color(ModelStatus::Error), Color::Red);
        assert_eq!(status_color(ModelStatus::Installing), Color::Yellow);
    }
}
