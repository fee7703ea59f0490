use async_trait::async_trait;

use crate::domain::models::ResourceSnapshot;

/// Read-only feed of host resource pressure. Polled, never pushed.
#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    /// Current memory, CPU and network headroom.
    async fn snapshot(&self) -> ResourceSnapshot;
}
