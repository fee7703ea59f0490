pub mod static_monitor;
pub mod system;

pub use static_monitor::StaticResourceMonitor;
pub use system::SystemResourceMonitor;
