//! End-to-end planning loop scenarios through the public coordinator API.

mod common;

use common::{harness, test_config, ScriptedExecutor, Step};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use waypoint::adapters::monitor::StaticResourceMonitor;
use waypoint::adapters::persistence::InMemoryPersistence;
use waypoint::domain::models::task::reason;
use waypoint::domain::models::{PlannerConfig, ResourceSnapshot};
use waypoint::services::PREFERRED_TOOL;
use waypoint::{
    ActionSpec, Coordinator, DomainError, KnowledgeCategory, PolicyAction, PolicyCondition,
    Request, TaskPriority, TaskStatus, ToolCapability,
};

#[tokio::test]
async fn test_two_leaf_request_completes_and_learns_pattern() {
    let h = harness(test_config(), ScriptedExecutor::new()).await;
    let registry = h.coordinator.registry();
    registry.register(ToolCapability::new("fetcher", "fetch")).await.unwrap();
    registry.register(ToolCapability::new("indexer", "index")).await.unwrap();

    let request = Request::new("refresh search index")
        .with_action(ActionSpec::new("fetch", "fetch"))
        .with_action(ActionSpec::new("index", "index").after("fetch"));
    let response = h.coordinator.execute(request).await.unwrap();

    assert!(response.success);
    assert_eq!(response.outcome.root_status, TaskStatus::Completed);
    assert_eq!(response.outcome.completed, 2);
    assert_eq!(response.tools_used, vec!["fetcher", "indexer"]);
    assert_eq!(response.outputs.len(), 2);
    assert_eq!(response.outputs["index"], json!({ "tool": "indexer" }));

    let root = h.coordinator.tasks().get_task(response.task_id).await.unwrap();
    assert_eq!(root.status, TaskStatus::Completed);
    assert_eq!(root.subtasks.len(), 2);

    let pattern = h
        .coordinator
        .knowledge()
        .workflow_pattern("refresh search index")
        .await
        .unwrap();
    assert_eq!(pattern.usage_count, 1);
    assert_eq!(pattern.steps.len(), 2);
    assert_eq!(pattern.steps[0].tool, "fetcher");
    assert!(h
        .coordinator
        .knowledge()
        .get(KnowledgeCategory::WorkflowPattern, "refresh search index")
        .await
        .is_some());

    let fetcher = registry.get("fetcher").await.unwrap();
    assert_eq!(fetcher.executions, 1);
    assert!(fetcher.reliability > 0.9);
}

#[tokio::test]
async fn test_block_policy_fails_leaf_without_invoking_tool() {
    let h = harness(test_config(), ScriptedExecutor::new()).await;
    h.coordinator
        .registry()
        .register(ToolCapability::new("deployer", "deploy"))
        .await
        .unwrap();
    h.coordinator
        .policies()
        .add_policy(
            "deploy-freeze",
            "No deployments during the freeze",
            "safety",
            PolicyCondition::equals("tool_category", "deploy"),
            PolicyAction::Block {
                reason: "change freeze".to_string(),
            },
        )
        .await
        .unwrap();

    let response = h
        .coordinator
        .execute(Request::new("ship it").with_action(ActionSpec::new("deploy", "deploy")))
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(response.applied_policies, vec!["deploy-freeze"]);
    assert!(response.tools_used.is_empty());
    assert_eq!(h.executor.total_calls(), 0);

    let root = h.coordinator.tasks().get_task(response.task_id).await.unwrap();
    assert_eq!(root.status, TaskStatus::Failed);
    assert_eq!(root.status_reason.as_deref(), Some(reason::POLICY_BLOCKED));

    let deployer = h.coordinator.registry().get("deployer").await.unwrap();
    assert_eq!(deployer.executions, 0);
    let policy = h.coordinator.policies().get("deploy-freeze").await.unwrap();
    assert_eq!(policy.applications.len(), 1);
    assert_eq!(policy.applications[0].task_id, Some(response.task_id));
}

#[tokio::test]
async fn test_no_tools_blocks_until_deadline() {
    let h = harness(test_config(), ScriptedExecutor::new()).await;

    let started = Instant::now();
    let response = h
        .coordinator
        .execute(
            Request::new("orphan")
                .with_action(ActionSpec::new("analyze", "analysis"))
                .with_deadline_ms(150),
        )
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(!response.success);
    assert!(response.outcome.deadline_exceeded);
    assert_eq!(response.outcome.root_status, TaskStatus::Blocked);
    assert_eq!(response.outcome.reasons[reason::NO_TOOL_AVAILABLE], 1);
}

#[tokio::test]
async fn test_no_tools_returns_immediately_when_not_awaiting() {
    let mut config = test_config();
    config.planner.await_blocked_leaves = false;
    let h = harness(config, ScriptedExecutor::new()).await;

    let started = Instant::now();
    let response = h
        .coordinator
        .execute(Request::new("orphan").with_action(ActionSpec::new("analyze", "analysis")))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert!(!response.outcome.deadline_exceeded);
    assert_eq!(response.outcome.blocked, 1);
    assert_eq!(response.outcome.root_status, TaskStatus::Blocked);
}

#[tokio::test]
async fn test_late_registered_tool_is_picked_up_on_reroute() {
    let h = harness(test_config(), ScriptedExecutor::new()).await;

    let coordinator = Arc::clone(&h.coordinator);
    let run = tokio::spawn(async move {
        coordinator
            .execute(Request::new("wait for tool").with_action(ActionSpec::new("scan", "scan")))
            .await
    });

    tokio::time::sleep(Duration::from_millis(60)).await;
    h.coordinator
        .registry()
        .register(ToolCapability::new("scanner", "scan"))
        .await
        .unwrap();

    let response = run.await.unwrap().unwrap();
    assert!(response.success);
    assert_eq!(response.tools_used, vec!["scanner"]);
}

#[tokio::test]
async fn test_retry_policy_recovers_flaky_tool() {
    let executor = ScriptedExecutor::new().script(
        "compiler",
        vec![
            Step::Fail("linker crashed".to_string()),
            Step::Fail("linker crashed".to_string()),
            Step::Succeed(json!({ "artifact": "app.bin" })),
        ],
    );
    let h = harness(test_config(), executor).await;
    h.coordinator
        .registry()
        .register(ToolCapability::new("compiler", "build"))
        .await
        .unwrap();
    h.coordinator
        .policies()
        .add_policy(
            "retry-builds",
            "Builds are flaky, retry them",
            "resilience",
            PolicyCondition::Always,
            PolicyAction::RetryWithBackoff {
                max_retries: 3,
                initial_backoff_ms: 5,
                max_backoff_ms: 20,
            },
        )
        .await
        .unwrap();

    let response = h
        .coordinator
        .execute(Request::new("build app").with_action(ActionSpec::new("build", "build")))
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.applied_policies, vec!["retry-builds"]);
    assert_eq!(h.executor.calls("compiler"), 3);

    let root = h.coordinator.tasks().get_task(response.task_id).await.unwrap();
    assert_eq!(root.executions.len(), 3);
    assert_eq!(
        root.executions.iter().filter(|r| r.success).count(),
        1,
        "only the last attempt succeeded"
    );
    assert_eq!(root.outputs, Some(json!({ "artifact": "app.bin" })));

    let compiler = h.coordinator.registry().get("compiler").await.unwrap();
    assert_eq!(compiler.executions, 3);

    let fact = h
        .coordinator
        .knowledge()
        .get(KnowledgeCategory::SystemFact, "tool-failure:compiler")
        .await
        .unwrap();
    assert_eq!(fact.content["failures"], json!(2));
}

#[tokio::test]
async fn test_tool_failure_without_retry_policy_fails_leaf() {
    let executor = ScriptedExecutor::new().script("compiler", vec![Step::Fail("boom".to_string())]);
    let h = harness(test_config(), executor).await;
    h.coordinator
        .registry()
        .register(ToolCapability::new("compiler", "build"))
        .await
        .unwrap();

    let response = h
        .coordinator
        .execute(Request::new("build app").with_action(ActionSpec::new("build", "build")))
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(h.executor.calls("compiler"), 1);
    assert_eq!(response.outcome.reasons[reason::TOOL_FAILED], 1);
    assert!(h
        .coordinator
        .knowledge()
        .workflow_pattern("build app")
        .await
        .is_none());
}

#[tokio::test]
async fn test_partial_failure_keeps_completed_outputs() {
    let executor = ScriptedExecutor::new().script("linter", vec![Step::Fail("bad config".to_string())]);
    let h = harness(test_config(), executor).await;
    let registry = h.coordinator.registry();
    registry.register(ToolCapability::new("formatter", "format")).await.unwrap();
    registry.register(ToolCapability::new("linter", "lint")).await.unwrap();

    let response = h
        .coordinator
        .execute(
            Request::new("tidy")
                .with_action(ActionSpec::new("format", "format"))
                .with_action(ActionSpec::new("lint", "lint")),
        )
        .await
        .unwrap();

    assert!(!response.success);
    assert!(response.outcome.is_partial());
    assert_eq!(response.outcome.completed, 1);
    assert_eq!(response.outcome.failed, 1);
    assert_eq!(response.outcome.root_status, TaskStatus::Failed);
    assert!(response.outputs.contains_key("format"));
    let mut tools = response.tools_used.clone();
    tools.sort();
    assert_eq!(tools, vec!["formatter", "linter"]);

    let root = h.coordinator.tasks().get_task(response.task_id).await.unwrap();
    assert_eq!(root.status_reason.as_deref(), Some(reason::SUBTASK_FAILED));
}

#[tokio::test]
async fn test_cancellation_fails_outstanding_leaves() {
    let executor = ScriptedExecutor::new().delay("crawler", Duration::from_secs(5));
    let h = harness(test_config(), executor).await;
    h.coordinator
        .registry()
        .register(ToolCapability::new("crawler", "crawl"))
        .await
        .unwrap();

    let token = CancellationToken::new();
    let coordinator = Arc::clone(&h.coordinator);
    let child = token.clone();
    let run = tokio::spawn(async move {
        coordinator
            .execute_with_cancel(
                Request::new("crawl everything")
                    .with_action(ActionSpec::new("crawl", "crawl"))
                    .with_deadline_ms(10_000),
                child,
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let started = Instant::now();
    token.cancel();
    let response = run.await.unwrap().unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(response.outcome.canceled);
    assert!(!response.success);
    let root = h.coordinator.tasks().get_task(response.task_id).await.unwrap();
    assert_eq!(root.status, TaskStatus::Failed);
    assert_eq!(root.status_reason.as_deref(), Some(reason::CANCELED));
    assert_eq!(h.executor.calls("crawler"), 1);
}

#[tokio::test]
async fn test_require_approval_blocks_until_approved() {
    let h = harness(test_config(), ScriptedExecutor::new()).await;
    h.coordinator
        .registry()
        .register(ToolCapability::new("migrator", "migrate"))
        .await
        .unwrap();
    h.coordinator
        .policies()
        .add_policy(
            "confirm-migrations",
            "Schema migrations need a human",
            "safety",
            PolicyCondition::equals("tool_category", "migrate"),
            PolicyAction::RequireApproval {
                prompt: "Apply schema migration?".to_string(),
            },
        )
        .await
        .unwrap();

    let pending = h
        .coordinator
        .execute(Request::new("migrate db").with_action(ActionSpec::new("migrate", "migrate")))
        .await
        .unwrap();
    assert!(!pending.success);
    assert_eq!(h.executor.total_calls(), 0);
    let root = h.coordinator.tasks().get_task(pending.task_id).await.unwrap();
    assert_eq!(root.status, TaskStatus::Blocked);
    assert_eq!(root.status_reason.as_deref(), Some(reason::APPROVAL_REQUIRED));
    assert_eq!(
        root.metadata.get("approval_prompt"),
        Some(&json!("Apply schema migration?"))
    );

    let approved = h
        .coordinator
        .execute(
            Request::new("migrate db")
                .with_action(ActionSpec::new("migrate", "migrate"))
                .with_context("approved", json!(true)),
        )
        .await
        .unwrap();
    assert!(approved.success);
    assert_eq!(h.executor.calls("migrator"), 1);
}

#[tokio::test]
async fn test_learned_user_preference_steers_selection() {
    let h = harness(test_config(), ScriptedExecutor::new()).await;
    let registry = h.coordinator.registry();
    registry.register(ToolCapability::new("alpha", "search")).await.unwrap();
    registry
        .register(ToolCapability::new("beta", "search").with_reliability(0.8))
        .await
        .unwrap();

    h.coordinator
        .knowledge()
        .learn_user_preference("ada", PREFERRED_TOOL, "search", json!("beta"), 1.0, "onboarding")
        .await;

    let for_ada = h
        .coordinator
        .execute(
            Request::new("find docs")
                .with_action(ActionSpec::new("search", "search"))
                .for_user("ada"),
        )
        .await
        .unwrap();
    assert_eq!(for_ada.tools_used, vec!["beta"]);

    let for_bob = h
        .coordinator
        .execute(
            Request::new("find docs")
                .with_action(ActionSpec::new("search", "search"))
                .for_user("bob"),
        )
        .await
        .unwrap();
    assert_eq!(for_bob.tools_used, vec!["alpha"]);

    let bob_prefs = h
        .coordinator
        .knowledge()
        .get_user_preferences("bob", Some(PREFERRED_TOOL))
        .await;
    assert_eq!(bob_prefs.len(), 1);
    assert_eq!(bob_prefs[0].key, "search");
    assert_eq!(bob_prefs[0].value, json!("alpha"));
}

#[tokio::test]
async fn test_low_priority_leaf_waits_out_resource_pressure() {
    let h = harness(test_config(), ScriptedExecutor::new()).await;
    h.coordinator
        .registry()
        .register(ToolCapability::new("archiver", "archive"))
        .await
        .unwrap();
    h.monitor.set(ResourceSnapshot::new(8_192, 0.97, true)).await;

    let coordinator = Arc::clone(&h.coordinator);
    let run = tokio::spawn(async move {
        coordinator
            .execute(
                Request::new("archive logs")
                    .with_action(ActionSpec::new("archive", "archive"))
                    .with_priority(TaskPriority::Low),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(h.executor.total_calls(), 0, "deferred while under pressure");
    h.monitor.set(ResourceSnapshot::unconstrained()).await;

    let response = run.await.unwrap().unwrap();
    assert!(response.success);
    assert_eq!(h.executor.calls("archiver"), 1);
}

#[tokio::test]
async fn test_low_priority_leaf_deferred_when_not_awaiting() {
    let mut config = test_config();
    config.planner.await_blocked_leaves = false;
    let h = harness(config, ScriptedExecutor::new()).await;
    h.coordinator
        .registry()
        .register(ToolCapability::new("archiver", "archive"))
        .await
        .unwrap();
    h.monitor.set(ResourceSnapshot::new(64, 0.2, true)).await;

    let response = h
        .coordinator
        .execute(
            Request::new("archive logs")
                .with_action(ActionSpec::new("archive", "archive"))
                .with_priority(TaskPriority::Low),
        )
        .await
        .unwrap();

    assert_eq!(response.outcome.reasons[reason::DEFERRED], 1);
    assert_eq!(h.executor.total_calls(), 0);
}

#[tokio::test]
async fn test_concurrency_limit_bounds_parallel_leaves() {
    let mut config = test_config();
    config.planner = PlannerConfig {
        max_concurrency: 2,
        ..config.planner
    };
    let executor = ScriptedExecutor::new().delay("worker", Duration::from_millis(100));
    let h = harness(config, executor).await;
    h.coordinator
        .registry()
        .register(ToolCapability::new("worker", "work"))
        .await
        .unwrap();

    let mut request = Request::new("fan out");
    for i in 0..4 {
        request = request.with_action(ActionSpec::new(format!("job-{i}"), "work"));
    }

    let started = Instant::now();
    let response = h.coordinator.execute(request).await.unwrap();

    assert!(response.success);
    assert_eq!(h.executor.calls("worker"), 4);
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_execute_before_initialize_is_rejected() {
    let coordinator = Coordinator::builder(test_config())
        .executor(Arc::new(ScriptedExecutor::new()))
        .monitor(Arc::new(StaticResourceMonitor::unconstrained()))
        .persistence(Arc::new(InMemoryPersistence::new()))
        .build()
        .unwrap();

    let result = coordinator
        .execute(Request::new("too early").with_action(ActionSpec::new("a", "b")))
        .await;
    assert!(matches!(result, Err(DomainError::NotInitialized)));
    assert!(!coordinator.health().await.is_healthy());
}

#[tokio::test]
async fn test_invalid_request_is_an_error() {
    let h = harness(test_config(), ScriptedExecutor::new()).await;
    let result = h
        .coordinator
        .execute(
            Request::new("bad deps")
                .with_action(ActionSpec::new("second", "x").after("first"))
                .with_action(ActionSpec::new("first", "x")),
        )
        .await;
    assert!(matches!(result, Err(DomainError::InvalidRequest(_))));
    assert_eq!(h.coordinator.tasks().len().await, 0);
}

#[tokio::test]
async fn test_health_reports_backlog_and_reliability() {
    let h = harness(test_config(), ScriptedExecutor::new()).await;
    let before = h.coordinator.health().await;
    assert!(before.is_healthy());
    assert_eq!(before.average_reliability, None);

    h.coordinator
        .registry()
        .register(ToolCapability::new("sampler", "sampler"))
        .await
        .unwrap();
    h.coordinator
        .execute(Request::new("sampler").with_action(ActionSpec::new("sampler", "sampler")))
        .await
        .unwrap();

    let after = h.coordinator.health().await;
    assert_eq!(after.task_backlog_size, 0);
    let reliability = after.average_reliability.unwrap();
    assert!((reliability - 0.92).abs() < 1e-9);
    assert_eq!(after.components.len(), 5);
}

#[tokio::test]
async fn test_independent_leaves_complete_and_learn_pattern() {
    let h = harness(test_config(), ScriptedExecutor::new()).await;
    let registry = h.coordinator.registry();
    registry.register(ToolCapability::new("resizer", "resize")).await.unwrap();
    registry.register(ToolCapability::new("tagger", "tag")).await.unwrap();

    let request = Request::new("process photo")
        .with_action(ActionSpec::new("resize", "resize"))
        .with_action(ActionSpec::new("tag", "tag"));
    let response = h.coordinator.execute(request).await.unwrap();

    assert!(response.success);
    assert_eq!(response.outcome.root_status, TaskStatus::Completed);
    let mut tools = response.tools_used.clone();
    tools.sort();
    assert_eq!(tools, vec!["resizer", "tagger"]);

    let subtasks = h.coordinator.tasks().subtasks(response.task_id).await;
    assert_eq!(subtasks.len(), 2);
    assert!(subtasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert!(subtasks.iter().all(|t| t.prerequisites().is_empty()));

    let pattern = h
        .coordinator
        .knowledge()
        .workflow_pattern("process photo")
        .await
        .unwrap();
    assert_eq!(pattern.usage_count, 1);
    assert_eq!(pattern.steps.len(), 2);
}

#[tokio::test]
async fn test_no_tools_for_decomposed_request_blocks_root_at_deadline() {
    let h = harness(test_config(), ScriptedExecutor::new()).await;

    let response = h
        .coordinator
        .execute(
            Request::new("nothing can run")
                .with_action(ActionSpec::new("analyze", "analysis"))
                .with_action(ActionSpec::new("report", "reporting"))
                .with_deadline_ms(150),
        )
        .await
        .unwrap();

    assert!(!response.success);
    assert!(response.outcome.deadline_exceeded);
    assert_eq!(response.outcome.root_status, TaskStatus::Blocked);
    assert_eq!(response.outcome.blocked, 2);
    assert_eq!(h.executor.total_calls(), 0);

    let root = h.coordinator.tasks().get_task(response.task_id).await.unwrap();
    assert_eq!(root.status, TaskStatus::Blocked);
    assert_eq!(root.status_reason.as_deref(), Some(reason::SUBTASK_BLOCKED));

    let subtasks = h.coordinator.tasks().subtasks(response.task_id).await;
    assert_eq!(subtasks.len(), 2);
    for subtask in &subtasks {
        assert_eq!(subtask.status, TaskStatus::Blocked);
        assert_eq!(subtask.status_reason.as_deref(), Some(reason::NO_TOOL_AVAILABLE));
    }
}

#[tokio::test]
async fn test_reinitialize_after_shutdown_accepts_requests() {
    let h = harness(test_config(), ScriptedExecutor::new()).await;
    h.coordinator
        .registry()
        .register(ToolCapability::new("fetcher", "fetch"))
        .await
        .unwrap();

    h.coordinator.shutdown().await.unwrap();
    assert!(matches!(
        h.coordinator
            .execute(Request::new("too early").with_action(ActionSpec::new("fetch", "fetch")))
            .await,
        Err(DomainError::NotInitialized)
    ));

    h.coordinator.initialize().await.unwrap();
    let response = h
        .coordinator
        .execute(Request::new("fetch again").with_action(ActionSpec::new("fetch", "fetch")))
        .await
        .unwrap();

    assert!(response.success);
    assert!(!response.outcome.canceled);
    assert_eq!(response.tools_used, vec!["fetcher"]);
    assert_eq!(h.executor.calls("fetcher"), 1);
}

#[tokio::test]
async fn test_leaf_reaching_tool_after_deadline_records_no_invocation() {
    let mut config = test_config();
    config.planner.max_concurrency = 1;
    let executor = ScriptedExecutor::new()
        .delay("renderer", Duration::from_millis(300))
        .delay("uploader", Duration::from_millis(300));
    let h = harness(config, executor).await;
    let registry = h.coordinator.registry();
    registry.register(ToolCapability::new("renderer", "render")).await.unwrap();
    registry.register(ToolCapability::new("uploader", "upload")).await.unwrap();

    let response = h
        .coordinator
        .execute(
            Request::new("render and upload")
                .with_action(ActionSpec::new("render", "render"))
                .with_action(ActionSpec::new("upload", "upload"))
                .with_deadline_ms(150),
        )
        .await
        .unwrap();

    assert!(response.outcome.deadline_exceeded);
    assert_eq!(response.tools_used, vec!["renderer"]);
    assert_eq!(h.executor.calls("renderer"), 1);
    assert_eq!(h.executor.calls("uploader"), 0);

    let subtasks = h.coordinator.tasks().subtasks(response.task_id).await;
    let render = subtasks.iter().find(|t| t.title == "render").unwrap();
    let upload = subtasks.iter().find(|t| t.title == "upload").unwrap();
    assert_eq!(render.executions.len(), 1);
    assert!(!render.executions[0].success);
    assert!(upload.executions.is_empty());
    assert_eq!(upload.status, TaskStatus::Blocked);
    assert_eq!(upload.status_reason.as_deref(), Some(reason::DEADLINE_EXCEEDED));
}
