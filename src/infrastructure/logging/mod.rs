//! Logging infrastructure
//!
//! Structured logging using tracing and tracing-subscriber:
//! - JSON or pretty stdout formatting
//! - Optional rolling file output (always JSON)

pub mod logger;

pub use logger::LoggerImpl;
