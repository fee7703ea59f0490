//! Waypoint CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use waypoint::adapters::monitor::SystemResourceMonitor;
use waypoint::adapters::persistence::open_configured;
use waypoint::application::Coordinator;
use waypoint::cli::commands::{config, health, knowledge, policy, task};
use waypoint::cli::{
    Cli, Commands, ConfigCommands, KnowledgeCommands, OfflineExecutor, PolicyCommands,
    TaskCommands,
};
use waypoint::infrastructure::config::ConfigLoader;
use waypoint::infrastructure::logging::LoggerImpl;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli.command, cli.config, cli.json).await {
        waypoint::cli::handle_error(&err, cli.json);
    }
}

async fn run(command: Commands, config_path: Option<std::path::PathBuf>, json: bool) -> Result<()> {
    let config = match config_path {
        Some(path) => ConfigLoader::load_from_file(&path)?,
        None => ConfigLoader::load()?,
    };
    let _logger = LoggerImpl::init(&config.logging).context("Failed to initialize logging")?;

    if let Commands::Config(ConfigCommands::Show) = command {
        return config::show(&config, json);
    }

    let persistence = open_configured(&config.persistence)
        .await
        .context("Failed to open persistence backend")?;
    let coordinator = Coordinator::builder(config)
        .executor(Arc::new(OfflineExecutor))
        .monitor(Arc::new(SystemResourceMonitor::new()))
        .persistence(persistence)
        .build()?;

    // Health reports initialization failures itself instead of aborting.
    let init = coordinator.initialize().await;
    if !matches!(command, Commands::Health) {
        init.context("Failed to initialize coordinator")?;
    }

    let result = match command {
        Commands::Health => health::execute(&coordinator, json).await,
        Commands::Knowledge(KnowledgeCommands::Query { term, category }) => {
            knowledge::query(&coordinator, &term, category.as_deref(), json).await
        }
        Commands::Knowledge(KnowledgeCommands::Patterns) => {
            knowledge::patterns(&coordinator, json).await
        }
        Commands::Knowledge(KnowledgeCommands::Expire) => knowledge::expire(&coordinator, json).await,
        Commands::Policy(PolicyCommands::List) => policy::list(&coordinator, json).await,
        Commands::Policy(PolicyCommands::Enable { name }) => {
            policy::set_enabled(&coordinator, &name, true, json).await
        }
        Commands::Policy(PolicyCommands::Disable { name }) => {
            policy::set_enabled(&coordinator, &name, false, json).await
        }
        Commands::Task(TaskCommands::Show { task_id }) => task::show(&coordinator, task_id, json).await,
        Commands::Task(TaskCommands::Stats) => task::stats(&coordinator, json).await,
        Commands::Config(ConfigCommands::Show) => Ok(()),
    };

    if coordinator.is_initialized() {
        coordinator
            .shutdown()
            .await
            .context("Failed to persist state on shutdown")?;
    }
    result
}
