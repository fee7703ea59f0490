//! Waypoint - task orchestration and guidance core
//!
//! Waypoint turns a structured request into a tree of tasks, consults
//! learned knowledge and declarative policies, routes each leaf to the most
//! reliable tool that fits current host resources, and learns from the
//! outcome.
//!
//! # Architecture
//!
//! This crate follows Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): models, error taxonomy and port traits
//! - **Service Layer** (`services`): task state, knowledge, policies, tool routing, planning
//! - **Application Layer** (`application`): the `Coordinator` that owns the services
//! - **Adapters** (`adapters`): persistence and resource-monitor implementations
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line inspection of a persisted core
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use waypoint::{ActionSpec, Coordinator, Request, WaypointConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coordinator = Coordinator::builder(WaypointConfig::default())
//!         .executor(Arc::new(MyExecutor))
//!         .build()?;
//!     coordinator.initialize().await?;
//!     let response = coordinator
//!         .execute(Request::new("index repo").with_action(ActionSpec::new("index", "search")))
//!         .await?;
//!     println!("succeeded: {}", response.success);
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use application::{ComponentStatus, Coordinator, CoordinatorBuilder, HealthReport};
pub use domain::errors::{
    DomainError, DomainResult, PersistenceError, PolicyError, RegistryError, TaskError,
    ToolExecutionError,
};
pub use domain::models::{
    ActionSpec, Context, KnowledgeCategory, Policy, PolicyAction, PolicyCondition, Request,
    Response, TaskNode, TaskPriority, TaskStatus, TaskType, ToolCapability, WaypointConfig,
};
pub use domain::ports::{PersistenceAdapter, ResourceMonitor, ToolExecutor};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{KnowledgeStore, Planner, PolicyEngine, TaskStateManager, ToolRegistry};
