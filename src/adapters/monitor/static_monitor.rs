use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::models::ResourceSnapshot;
use crate::domain::ports::ResourceMonitor;

/// Monitor that reports whatever reading it was last given.
pub struct StaticResourceMonitor {
    current: RwLock<ResourceSnapshot>,
}

impl StaticResourceMonitor {
    pub fn new(snapshot: ResourceSnapshot) -> Self {
        Self {
            current: RwLock::new(snapshot),
        }
    }

    pub fn unconstrained() -> Self {
        Self::new(ResourceSnapshot::unconstrained())
    }

    /// Replace the reported reading.
    pub async fn set(&self, snapshot: ResourceSnapshot) {
        *self.current.write().await = snapshot;
    }
}

impl Default for StaticResourceMonitor {
    fn default() -> Self {
        Self::unconstrained()
    }
}

#[async_trait]
impl ResourceMonitor for StaticResourceMonitor {
    async fn snapshot(&self) -> ResourceSnapshot {
        self.current.read().await.clone()
    }
}
