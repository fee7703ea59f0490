//! CLI command implementations.

pub mod config;
pub mod health;
pub mod knowledge;
pub mod policy;
pub mod task;
