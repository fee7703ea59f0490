//! Host resource monitor backed by `sysinfo`.

use async_trait::async_trait;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Networks, RefreshKind, System};
use tokio::sync::Mutex;
use tracing::trace;

use crate::domain::models::ResourceSnapshot;
use crate::domain::ports::ResourceMonitor;

/// Polls CPU, memory and network interfaces on every snapshot.
pub struct SystemResourceMonitor {
    system: Mutex<System>,
    networks: Mutex<Networks>,
}

impl SystemResourceMonitor {
    pub fn new() -> Self {
        let refresh_kind = RefreshKind::new()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything());

        Self {
            system: Mutex::new(System::new_with_specifics(refresh_kind)),
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }
}

impl Default for SystemResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceMonitor for SystemResourceMonitor {
    async fn snapshot(&self) -> ResourceSnapshot {
        let (cpu_percent, available_mb) = {
            let mut sys = self.system.lock().await;
            sys.refresh_cpu_all();
            sys.refresh_memory();
            (sys.global_cpu_usage(), sys.available_memory() / 1024 / 1024)
        };

        let network_available = {
            let mut networks = self.networks.lock().await;
            networks.refresh_list();
            networks.list().keys().any(|name| name != "lo" && name != "lo0")
        };

        trace!(cpu_percent, available_mb, network_available, "Resource snapshot");
        ResourceSnapshot::new(available_mb, f64::from(cpu_percent) / 100.0, network_available)
    }
}
