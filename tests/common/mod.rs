//! Common test utilities for integration tests
//!
//! Provides a scripted tool executor, coordinator fixtures and test
//! logging shared across the integration test files.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use waypoint::adapters::monitor::StaticResourceMonitor;
use waypoint::adapters::persistence::InMemoryPersistence;
use waypoint::domain::models::{Context, PlannerConfig};
use waypoint::{Coordinator, PersistenceAdapter, ToolExecutionError, ToolExecutor, WaypointConfig};

/// What a scripted tool does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(serde_json::Value),
    Fail(String),
}

/// Executor whose tools follow a per-tool script.
///
/// Once a tool's script runs out every further call succeeds with
/// `{"tool": name}`. Every call is counted, including ones that are
/// cancelled mid-flight.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<HashMap<String, usize>>,
    delays: Mutex<HashMap<String, Duration>>,
    total: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, tool: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(tool.to_string(), steps.into());
        self
    }

    pub fn delay(self, tool: &str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(tool.to_string(), delay);
        self
    }

    pub fn calls(&self, tool: &str) -> usize {
        self.calls.lock().unwrap().get(tool).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolExecutor for ScriptedExecutor {
    async fn invoke(
        &self,
        tool_name: &str,
        _parameters: &Context,
    ) -> Result<serde_json::Value, ToolExecutionError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .unwrap()
            .entry(tool_name.to_string())
            .or_insert(0) += 1;

        let delay = self.delays.lock().unwrap().get(tool_name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(tool_name)
            .and_then(VecDeque::pop_front);
        match step {
            Some(Step::Succeed(value)) => Ok(value),
            Some(Step::Fail(message)) => Err(ToolExecutionError::failed(tool_name, message)),
            None => Ok(json!({ "tool": tool_name })),
        }
    }
}

/// Config tuned for fast tests: short deadline and re-route interval.
pub fn test_config() -> WaypointConfig {
    WaypointConfig {
        planner: PlannerConfig {
            default_deadline_ms: 2_000,
            reroute_interval_ms: 20,
            ..PlannerConfig::default()
        },
        ..WaypointConfig::default()
    }
}

pub struct Harness {
    pub coordinator: Arc<Coordinator>,
    pub executor: Arc<ScriptedExecutor>,
    pub monitor: Arc<StaticResourceMonitor>,
}

/// Initialized coordinator over in-memory persistence.
pub async fn harness(config: WaypointConfig, executor: ScriptedExecutor) -> Harness {
    harness_with_persistence(config, executor, Arc::new(InMemoryPersistence::new())).await
}

pub async fn harness_with_persistence(
    config: WaypointConfig,
    executor: ScriptedExecutor,
    persistence: Arc<dyn PersistenceAdapter>,
) -> Harness {
    setup_test_logging();
    let executor = Arc::new(executor);
    let monitor = Arc::new(StaticResourceMonitor::unconstrained());
    let coordinator = Coordinator::builder(config)
        .executor(executor.clone())
        .monitor(monitor.clone())
        .persistence(persistence)
        .build()
        .expect("coordinator should build");
    coordinator
        .initialize()
        .await
        .expect("coordinator should initialize");

    Harness {
        coordinator: Arc::new(coordinator),
        executor,
        monitor,
    }
}

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
