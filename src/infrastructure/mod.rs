//! Infrastructure layer module
//!
//! Process-wide concerns that sit outside the core services:
//! - Configuration management (figment)
//! - Logging infrastructure (tracing)

pub mod config;
pub mod logging;
