//! Port trait definitions (Hexagonal Architecture)
//!
//! Interfaces the core consumes from its environment:
//! - ToolExecutor: invokes a named tool with parameters
//! - ResourceMonitor: polled host pressure readings
//! - PersistenceAdapter: byte-level durable storage and an append log
//!
//! The core owns serialization; adapters only store bytes.

pub mod persistence;
pub mod resource_monitor;
pub mod tool_executor;

pub use persistence::PersistenceAdapter;
pub use resource_monitor::ResourceMonitor;
pub use tool_executor::ToolExecutor;
