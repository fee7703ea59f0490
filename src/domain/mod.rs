//! Domain layer for the Waypoint orchestration core
//!
//! Models, the error taxonomy and the ports the core consumes.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{
    DomainError, DomainResult, PersistenceError, PolicyError, RegistryError, TaskError,
    ToolExecutionError,
};
