//! Tool capability registry.
//!
//! Each tool sits behind its own mutex so reliability read-modify-write
//! cycles from concurrent requests never interleave.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainResult, RegistryError};
use crate::domain::models::tool::clamp_reliability;
use crate::domain::models::{
    Context, RegistryConfig, ResourceSnapshot, ToolCapability, ToolPreference,
};
use crate::domain::ports::ResourceMonitor;

struct RegisteredTool {
    capability: ToolCapability,
    /// Registration order, breaks score ties
    sequence: u64,
}

type InFlight = Arc<StdMutex<HashSet<(Uuid, String)>>>;

/// Held for the duration of one tool invocation; releases the
/// (task, tool) slot on drop.
pub struct InFlightGuard {
    key: (Uuid, String),
    in_flight: InFlight,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        match self.in_flight.lock() {
            Ok(mut set) => {
                set.remove(&self.key);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&self.key);
            }
        }
    }
}

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<Mutex<RegisteredTool>>>>,
    next_sequence: AtomicU64,
    in_flight: InFlight,
    monitor: Arc<dyn ResourceMonitor>,
    config: RegistryConfig,
}

impl ToolRegistry {
    pub fn new(config: RegistryConfig, monitor: Arc<dyn ResourceMonitor>) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            next_sequence: AtomicU64::new(0),
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
            monitor,
            config,
        }
    }

    /// Take a first resource reading so a broken monitor surfaces at startup.
    pub async fn initialize(&self) -> DomainResult<()> {
        let snapshot = self.monitor.snapshot().await;
        info!(
            memory_available_mb = snapshot.memory_available_mb,
            cpu_load = snapshot.cpu_load,
            network_available = snapshot.network_available,
            "Tool registry initialized"
        );
        Ok(())
    }

    pub async fn register(&self, mut capability: ToolCapability) -> Result<(), RegistryError> {
        capability.reliability = clamp_reliability(capability.reliability);
        let mut tools = self.tools.write().await;
        if tools.contains_key(&capability.name) {
            return Err(RegistryError::DuplicateTool(capability.name));
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        info!(tool = %capability.name, category = %capability.category, "Tool registered");
        tools.insert(
            capability.name.clone(),
            Arc::new(Mutex::new(RegisteredTool {
                capability,
                sequence,
            })),
        );
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> Result<ToolCapability, RegistryError> {
        let removed = self
            .tools
            .write()
            .await
            .remove(name)
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))?;
        info!(tool = %name, "Tool unregistered");
        let capability = removed.lock().await.capability.clone();
        Ok(capability)
    }

    pub async fn get(&self, name: &str) -> Option<ToolCapability> {
        let entry = self.tools.read().await.get(name).cloned()?;
        let tool = entry.lock().await;
        Some(tool.capability.clone())
    }

    async fn entries(&self) -> Vec<Arc<Mutex<RegisteredTool>>> {
        self.tools.read().await.values().cloned().collect()
    }

    /// All registered tools in registration order.
    pub async fn tools(&self) -> Vec<ToolCapability> {
        let mut all = Vec::new();
        for entry in self.entries().await {
            let tool = entry.lock().await;
            all.push((tool.sequence, tool.capability.clone()));
        }
        all.sort_by_key(|(seq, _)| *seq);
        all.into_iter().map(|(_, c)| c).collect()
    }

    /// Best tool in `category` that fits the current resource snapshot.
    ///
    /// Score is `reliability * fitness * (1 + bonus)` where the bonus is
    /// the summed weight of matching preferences. Ties go to the earlier
    /// registration. `None` means no tool is available right now.
    pub async fn select_tool(
        &self,
        category: &str,
        context: &Context,
        preferences: &[ToolPreference],
    ) -> Option<ToolCapability> {
        let snapshot = self.monitor.snapshot().await;
        let mut best: Option<(f64, u64, ToolCapability)> = None;

        for entry in self.entries().await {
            let tool = entry.lock().await;
            let capability = &tool.capability;
            if capability.category != category {
                continue;
            }
            if !capability.fits_within(&snapshot, self.config.cpu_ceiling) {
                debug!(tool = %capability.name, "Tool excluded by resource headroom");
                continue;
            }
            let bonus: f64 = preferences
                .iter()
                .filter(|p| p.tool == capability.name)
                .map(|p| p.weight)
                .sum();
            let score = capability.reliability * capability.fitness(context) * (1.0 + bonus);

            let better = match &best {
                None => true,
                Some((best_score, best_seq, _)) => {
                    score > *best_score || (score == *best_score && tool.sequence < *best_seq)
                }
            };
            if better {
                best = Some((score, tool.sequence, capability.clone()));
            }
        }

        match best {
            Some((score, _, capability)) => {
                debug!(category, tool = %capability.name, score, "Tool selected");
                Some(capability)
            }
            None => {
                debug!(category, "No tool available");
                None
            }
        }
    }

    /// Fold one execution outcome into the tool's reliability. Returns the
    /// new score, or `None` for an unknown tool.
    pub async fn record_outcome(&self, name: &str, success: bool) -> Option<f64> {
        let Some(entry) = self.tools.read().await.get(name).cloned() else {
            warn!(tool = %name, "Outcome for unknown tool ignored");
            return None;
        };
        let mut tool = entry.lock().await;
        let before = tool.capability.reliability;
        let after = tool
            .capability
            .apply_outcome(success, self.config.reliability_smoothing);
        debug!(tool = %name, success, before, after, "Tool reliability updated");
        Some(after)
    }

    /// Latest reading from the resource monitor.
    pub async fn current_pressure(&self) -> ResourceSnapshot {
        self.monitor.snapshot().await
    }

    pub fn is_under_pressure(&self, snapshot: &ResourceSnapshot) -> bool {
        snapshot.cpu_load >= self.config.pressure_cpu_load
            || snapshot.memory_available_mb < self.config.pressure_min_memory_mb
    }

    /// Claim the (task, tool) invocation slot. `None` when an invocation
    /// for the same pair is already outstanding.
    pub fn begin_invocation(&self, task_id: Uuid, tool: &str) -> Option<InFlightGuard> {
        let key = (task_id, tool.to_string());
        let mut set = match self.in_flight.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !set.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            key,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Mean reliability over registered tools.
    pub async fn average_reliability(&self) -> Option<f64> {
        let tools = self.tools().await;
        if tools.is_empty() {
            return None;
        }
        Some(tools.iter().map(|t| t.reliability).sum::<f64>() / tools.len() as f64)
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }
}
