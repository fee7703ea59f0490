//! Implementations of the domain ports.

pub mod monitor;
pub mod persistence;

pub use monitor::{StaticResourceMonitor, SystemResourceMonitor};
pub use persistence::{InMemoryPersistence, SqlitePersistence};
