//! Command-line surface for inspecting and administering a persisted core.

pub mod commands;
pub mod output;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use crate::domain::errors::ToolExecutionError;
use crate::domain::models::Context;
use crate::domain::ports::ToolExecutor;

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(about = "Waypoint - task orchestration and guidance core", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Load configuration from this file instead of .waypoint/
    #[arg(short, long, global = true, env = "WAYPOINT_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show component status, task backlog and tool reliability
    Health,

    /// Knowledge store commands
    #[command(subcommand)]
    Knowledge(KnowledgeCommands),

    /// Policy engine commands
    #[command(subcommand)]
    Policy(PolicyCommands),

    /// Task inspection commands
    #[command(subcommand)]
    Task(TaskCommands),

    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum KnowledgeCommands {
    /// Search stored knowledge by keyword
    Query {
        /// Whitespace-separated keywords; an entry matches any of them
        term: String,

        /// Restrict to one category (best_practice, workflow_pattern, system_fact, ...)
        #[arg(short = 'C', long)]
        category: Option<String>,
    },

    /// List recorded workflow patterns
    Patterns,

    /// Drop stale low-confidence entries using the configured thresholds
    Expire,
}

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// List registered policies
    List,

    /// Enable a policy by name
    Enable { name: String },

    /// Disable a policy by name
    Disable { name: String },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Show a task and its subtasks
    Show {
        /// Task ID
        task_id: Uuid,
    },

    /// Show task counts by status and type
    Stats,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
}

/// Executor installed by the CLI, which never runs tools itself.
pub struct OfflineExecutor;

#[async_trait]
impl ToolExecutor for OfflineExecutor {
    async fn invoke(
        &self,
        tool_name: &str,
        _parameters: &Context,
    ) -> Result<serde_json::Value, ToolExecutionError> {
        Err(ToolExecutionError::Unavailable(tool_name.to_string()))
    }
}

/// Print an error the way the selected output mode expects and exit non-zero.
pub fn handle_error(err: &anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let payload = serde_json::json!({ "error": format!("{err:#}") });
        println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default());
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(1)
}
