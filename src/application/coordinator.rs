//! Coordinator: owns the four core components and exposes `execute` and
//! `health` to the outside world.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::adapters::monitor::StaticResourceMonitor;
use crate::adapters::persistence::InMemoryPersistence;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    KnowledgeStatistics, Request, Response, TaskStatistics, WaypointConfig,
};
use crate::domain::ports::{PersistenceAdapter, ResourceMonitor, ToolExecutor};
use crate::services::{KnowledgeStore, Planner, PolicyEngine, TaskStateManager, ToolRegistry};

const KNOWLEDGE_STORE: &str = "knowledge_store";
const POLICY_ENGINE: &str = "policy_engine";
const TOOL_REGISTRY: &str = "tool_registry";
const TASK_STATE_MANAGER: &str = "task_state_manager";
const PLANNER: &str = "planner";

/// Startup order. Later components depend on earlier ones.
const INIT_ORDER: [&str; 5] = [
    KNOWLEDGE_STORE,
    POLICY_ENGINE,
    TOOL_REGISTRY,
    TASK_STATE_MANAGER,
    PLANNER,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ComponentStatus {
    Uninitialized,
    Ready,
    Failed { error: String },
    Stopped,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Failed { .. } => "failed",
            Self::Stopped => "stopped",
        }
    }
}

/// Read-only aggregate for external monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub components: BTreeMap<String, ComponentStatus>,
    /// Retained tasks not yet completed or failed
    pub task_backlog_size: usize,
    /// `None` while no tools are registered
    pub average_reliability: Option<f64>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.components.values().all(|s| *s == ComponentStatus::Ready)
    }
}

/// Assembles a [`Coordinator`] from configuration and ports.
pub struct CoordinatorBuilder {
    config: WaypointConfig,
    executor: Option<Arc<dyn ToolExecutor>>,
    monitor: Option<Arc<dyn ResourceMonitor>>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
}

impl CoordinatorBuilder {
    pub fn new(config: WaypointConfig) -> Self {
        Self {
            config,
            executor: None,
            monitor: None,
            persistence: None,
        }
    }

    pub fn executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Defaults to a monitor reporting unlimited headroom.
    pub fn monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Defaults to volatile in-memory storage.
    pub fn persistence(mut self, persistence: Arc<dyn PersistenceAdapter>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn build(self) -> DomainResult<Coordinator> {
        let executor = self
            .executor
            .ok_or(DomainError::MissingDependency("tool executor"))?;
        let monitor = self
            .monitor
            .unwrap_or_else(|| Arc::new(StaticResourceMonitor::unconstrained()));
        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(InMemoryPersistence::new()));

        let config = self.config;
        let knowledge = Arc::new(KnowledgeStore::new(Arc::clone(&persistence)));
        let policies = Arc::new(
            PolicyEngine::new(Arc::clone(&persistence))
                .with_history_limit(config.knowledge.policy_history_limit),
        );
        let registry = Arc::new(ToolRegistry::new(config.registry.clone(), monitor));
        let tasks = Arc::new(TaskStateManager::new(config.tasks.clone(), persistence));
        let planner = Planner::new(
            Arc::clone(&tasks),
            Arc::clone(&knowledge),
            Arc::clone(&policies),
            Arc::clone(&registry),
            executor,
            config.planner.clone(),
        );

        let statuses = INIT_ORDER
            .iter()
            .map(|name| (*name, ComponentStatus::Uninitialized))
            .collect();

        Ok(Coordinator {
            config,
            tasks,
            knowledge,
            policies,
            registry,
            planner,
            statuses: RwLock::new(statuses),
            initialized: AtomicBool::new(false),
            shutdown: RwLock::new(CancellationToken::new()),
        })
    }
}

pub struct Coordinator {
    config: WaypointConfig,
    tasks: Arc<TaskStateManager>,
    knowledge: Arc<KnowledgeStore>,
    policies: Arc<PolicyEngine>,
    registry: Arc<ToolRegistry>,
    planner: Planner,
    statuses: RwLock<BTreeMap<&'static str, ComponentStatus>>,
    initialized: AtomicBool,
    /// Parent of every request token; cancelled on shutdown and replaced
    /// on the next initialize
    shutdown: RwLock<CancellationToken>,
}

impl Coordinator {
    pub fn builder(config: WaypointConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    /// Bring components up in dependency order, stopping at the first
    /// failure.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> DomainResult<()> {
        self.init_component(KNOWLEDGE_STORE, self.knowledge.initialize())
            .await?;
        self.init_component(POLICY_ENGINE, self.policies.initialize())
            .await?;
        self.init_component(TOOL_REGISTRY, self.registry.initialize())
            .await?;
        self.init_component(TASK_STATE_MANAGER, self.tasks.initialize())
            .await?;
        self.init_component(PLANNER, self.planner.initialize())
            .await?;

        {
            let mut shutdown = self.shutdown.write().await;
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
        info!("Coordinator initialized");
        Ok(())
    }

    async fn init_component(
        &self,
        component: &'static str,
        init: impl Future<Output = DomainResult<()>>,
    ) -> DomainResult<()> {
        match init.await {
            Ok(()) => {
                self.statuses
                    .write()
                    .await
                    .insert(component, ComponentStatus::Ready);
                Ok(())
            }
            Err(e) => {
                error!(component, error = %e, "Component failed to initialize");
                self.statuses.write().await.insert(
                    component,
                    ComponentStatus::Failed {
                        error: e.to_string(),
                    },
                );
                Err(DomainError::ComponentInit {
                    component,
                    source: Box::new(e),
                })
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Run one full planning loop for `request`.
    pub async fn execute(&self, request: Request) -> DomainResult<Response> {
        let cancel = self.shutdown.read().await.child_token();
        self.execute_with_cancel(request, cancel).await
    }

    /// As [`Coordinator::execute`], with a caller-held cancellation token.
    /// Cancelling it fails every outstanding leaf with reason `canceled`.
    pub async fn execute_with_cancel(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> DomainResult<Response> {
        if !self.is_initialized() {
            return Err(DomainError::NotInitialized);
        }
        self.planner.run(request, cancel).await
    }

    /// Aggregate status. Performs no mutation.
    pub async fn health(&self) -> HealthReport {
        let components = self
            .statuses
            .read()
            .await
            .iter()
            .map(|(name, status)| ((*name).to_string(), status.clone()))
            .collect();
        HealthReport {
            components,
            task_backlog_size: self.tasks.backlog_size().await,
            average_reliability: self.registry.average_reliability().await,
        }
    }

    pub async fn task_statistics(&self) -> TaskStatistics {
        self.tasks.statistics().await
    }

    pub async fn knowledge_statistics(&self) -> KnowledgeStatistics {
        self.knowledge
            .statistics(self.policies.active_count().await)
            .await
    }

    /// Cancel in-flight requests and flush all state to persistence.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> DomainResult<()> {
        self.shutdown.read().await.cancel();
        self.initialized.store(false, Ordering::SeqCst);

        let trees = self.tasks.persist_all().await?;
        self.knowledge.persist().await?;
        self.policies.persist().await?;

        let mut statuses = self.statuses.write().await;
        for status in statuses.values_mut() {
            if *status == ComponentStatus::Ready {
                *status = ComponentStatus::Stopped;
            }
        }
        info!(trees, "Coordinator shut down");
        Ok(())
    }

    pub fn config(&self) -> &WaypointConfig {
        &self.config
    }

    pub fn tasks(&self) -> &Arc<TaskStateManager> {
        &self.tasks
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeStore> {
        &self.knowledge
    }

    pub fn policies(&self) -> &Arc<PolicyEngine> {
        &self.policies
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::{PersistenceError, ToolExecutionError};
    use crate::domain::models::{ActionSpec, Context, ToolCapability};
    use async_trait::async_trait;
    use serde_json::json;

    struct OkExecutor;

    #[async_trait]
    impl ToolExecutor for OkExecutor {
        async fn invoke(
            &self,
            _tool_name: &str,
            _parameters: &Context,
        ) -> Result<serde_json::Value, ToolExecutionError> {
            Ok(json!("done"))
        }
    }

    struct BrokenStorage;

    #[async_trait]
    impl PersistenceAdapter for BrokenStorage {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
            Err(PersistenceError::Storage("disk unavailable".into()))
        }

        async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<(), PersistenceError> {
            Err(PersistenceError::Storage("disk unavailable".into()))
        }

        async fn append_log(&self, _entry: Vec<u8>) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    fn coordinator() -> Coordinator {
        Coordinator::builder(WaypointConfig::default())
            .executor(Arc::new(OkExecutor))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_executor() {
        let err = Coordinator::builder(WaypointConfig::default())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, DomainError::MissingDependency(_)));
    }

    #[tokio::test]
    async fn test_execute_before_initialize_fails() {
        let coordinator = coordinator();
        let request = Request::new("r").with_action(ActionSpec::new("a", "c"));
        let err = coordinator.execute(request).await.unwrap_err();
        assert!(matches!(err, DomainError::NotInitialized));
    }

    #[tokio::test]
    async fn test_initialize_fails_fast() {
        let coordinator = Coordinator::builder(WaypointConfig::default())
            .executor(Arc::new(OkExecutor))
            .persistence(Arc::new(BrokenStorage))
            .build()
            .unwrap();

        let err = coordinator.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            DomainError::ComponentInit {
                component: "knowledge_store",
                ..
            }
        ));

        let health = coordinator.health().await;
        assert!(!health.is_healthy());
        assert_eq!(
            health.components["knowledge_store"].as_str(),
            "failed"
        );
        assert_eq!(
            health.components["planner"],
            ComponentStatus::Uninitialized
        );
    }

    #[tokio::test]
    async fn test_health_reports_backlog_and_reliability() {
        let coordinator = coordinator();
        coordinator.initialize().await.unwrap();
        coordinator
            .registry()
            .register(ToolCapability::new("fmt", "lint").with_reliability(0.6))
            .await
            .unwrap();

        let health = coordinator.health().await;
        assert!(health.is_healthy());
        assert_eq!(health.components.len(), 5);
        assert_eq!(health.task_backlog_size, 0);
        assert!((health.average_reliability.unwrap() - 0.6).abs() < 1e-9);

        let response = coordinator
            .execute(Request::new("format").with_action(ActionSpec::new("fmt", "lint")))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(coordinator.health().await.task_backlog_size, 0);
    }

    #[tokio::test]
    async fn test_shutdown_persists_and_stops() {
        let coordinator = coordinator();
        coordinator.initialize().await.unwrap();
        coordinator.shutdown().await.unwrap();

        assert!(!coordinator.is_initialized());
        let health = coordinator.health().await;
        assert!(health
            .components
            .values()
            .all(|s| *s == ComponentStatus::Stopped));
    }
}
