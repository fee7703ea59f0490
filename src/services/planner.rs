//! Planner: the parse → decompose → validate → route → execute → reflect
//! loop run once per request.
//!
//! Leaves fan out concurrently, bounded by `max_concurrency`. Every wait
//! inside the loop races the request's cancellation token and deadline,
//! so a run always ends with each leaf settled or forced to a settled
//! status.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::future::join_all;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::task::reason;
use crate::domain::models::{
    ActionSpec, Context, KnowledgeCategory, PlanOutcome, PlannerConfig, Policy, PolicyAction,
    Provenance, Request, Response, StatusChange, SubtaskSpec, TaskNode, TaskPriority,
    TaskStatus, TaskType, ToolCapability, ToolPreference, WorkflowStep,
};
use crate::domain::ports::ToolExecutor;

use super::knowledge_store::KnowledgeStore;
use super::policy_engine::PolicyEngine;
use super::task_state_manager::TaskStateManager;
use super::tool_registry::ToolRegistry;

/// Preference category learned from successful plans; keyed by tool category.
pub const PREFERRED_TOOL: &str = "preferred-tool";

/// Context keys the planner adds for policy evaluation.
pub mod context_keys {
    pub const ACTION: &str = "action";
    pub const TOOL_CATEGORY: &str = "tool_category";
    pub const TASK_TYPE: &str = "task_type";
    pub const PRIORITY: &str = "priority";
    pub const USER_ID: &str = "user_id";
    /// Must be `true` for a require-approval policy to let a leaf through
    pub const APPROVED: &str = "approved";
}

/// A decomposed request ready to execute.
#[derive(Debug, Clone)]
pub struct Plan {
    pub root_id: Uuid,
    pub leaves: Vec<PlannedLeaf>,
}

/// One leaf task bound to the action it carries out.
#[derive(Debug, Clone)]
pub struct PlannedLeaf {
    pub task_id: Uuid,
    /// Position of the action in the request
    pub order: usize,
    pub action: ActionSpec,
    pub prerequisites: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy)]
struct RetryPlan {
    max_retries: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl RetryPlan {
    fn backoff(self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(
                self.max_backoff_ms.max(self.initial_backoff_ms),
            ))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

#[derive(Debug, Default)]
struct ToolFailure {
    count: u32,
    last_error: String,
}

#[derive(Debug)]
struct ExecutedStep {
    order: usize,
    category: String,
    step: WorkflowStep,
}

/// Shared by every leaf of one run.
#[derive(Debug, Default)]
struct RunLedger {
    applied_policies: Vec<String>,
    tools_used: Vec<String>,
    steps: Vec<ExecutedStep>,
    failures: BTreeMap<String, ToolFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Settled,
    DeadlineExceeded,
    Canceled,
}

enum Invocation {
    Finished(Result<serde_json::Value, crate::domain::errors::ToolExecutionError>),
    Canceled,
    DeadlineExceeded,
}

fn dedup_in_order(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|i| seen.insert(i.clone())).collect()
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Clone)]
pub struct Planner {
    tasks: Arc<TaskStateManager>,
    knowledge: Arc<KnowledgeStore>,
    policies: Arc<PolicyEngine>,
    registry: Arc<ToolRegistry>,
    executor: Arc<dyn ToolExecutor>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(
        tasks: Arc<TaskStateManager>,
        knowledge: Arc<KnowledgeStore>,
        policies: Arc<PolicyEngine>,
        registry: Arc<ToolRegistry>,
        executor: Arc<dyn ToolExecutor>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            tasks,
            knowledge,
            policies,
            registry,
            executor,
            config,
        }
    }

    pub async fn initialize(&self) -> DomainResult<()> {
        info!(
            max_concurrency = self.config.max_concurrency,
            default_deadline_ms = self.config.default_deadline_ms,
            "Planner initialized"
        );
        Ok(())
    }

    /// Parse and decompose: one root task, plus one subtask per action
    /// when the request carries more than one.
    pub async fn plan(&self, request: &Request) -> DomainResult<Plan> {
        if request.actions.is_empty() {
            return Err(DomainError::InvalidRequest(format!(
                "request '{}' has no actions",
                request.title
            )));
        }

        let mut positions: HashMap<&str, usize> = HashMap::new();
        let mut dependency_indices = Vec::with_capacity(request.actions.len());
        for (index, action) in request.actions.iter().enumerate() {
            let mut deps = Vec::with_capacity(action.depends_on.len());
            for name in &action.depends_on {
                let dep = positions.get(name.as_str()).copied().ok_or_else(|| {
                    DomainError::InvalidRequest(format!(
                        "action '{}' depends on unknown or later action '{name}'",
                        action.name
                    ))
                })?;
                deps.push(dep);
            }
            if positions.insert(action.name.as_str(), index).is_some() {
                return Err(DomainError::InvalidRequest(format!(
                    "duplicate action name '{}'",
                    action.name
                )));
            }
            dependency_indices.push(deps);
        }

        if let [action] = request.actions.as_slice() {
            let root = self
                .tasks
                .create_task(
                    request.title.clone(),
                    request.description.clone(),
                    action.resolved_type(),
                    action.priority.unwrap_or(request.priority),
                    None,
                )
                .await?;
            debug!(root_id = %root.id, "Single-action request planned");
            return Ok(Plan {
                root_id: root.id,
                leaves: vec![PlannedLeaf {
                    task_id: root.id,
                    order: 0,
                    action: action.clone(),
                    prerequisites: Vec::new(),
                }],
            });
        }

        let root = self
            .tasks
            .create_task(
                request.title.clone(),
                request.description.clone(),
                TaskType::UserRequest,
                request.priority,
                None,
            )
            .await?;

        let specs: Vec<SubtaskSpec> = request
            .actions
            .iter()
            .zip(&dependency_indices)
            .map(|(action, deps)| {
                let mut spec = SubtaskSpec::new(action.name.clone(), action.description.clone())
                    .with_type(action.resolved_type())
                    .with_priority(action.priority.unwrap_or(request.priority))
                    .with_metadata(context_keys::ACTION, json!(action.name))
                    .with_metadata(context_keys::TOOL_CATEGORY, json!(action.category));
                for &dep in deps {
                    spec = spec.depending_on(dep);
                }
                spec
            })
            .collect();

        let parent = self.tasks.decompose_task(root.id, specs).await?;
        let leaves = request
            .actions
            .iter()
            .zip(&dependency_indices)
            .enumerate()
            .map(|(order, (action, deps))| PlannedLeaf {
                task_id: parent.subtasks[order],
                order,
                action: action.clone(),
                prerequisites: deps.iter().map(|&d| parent.subtasks[d]).collect(),
            })
            .collect::<Vec<_>>();

        debug!(root_id = %root.id, leaves = leaves.len(), "Request decomposed");
        Ok(Plan {
            root_id: root.id,
            leaves,
        })
    }

    /// Run one full planning loop.
    ///
    /// Only validation problems come back as `Err`; everything else that
    /// goes wrong is reported in the response's outcome.
    #[instrument(skip_all, fields(request_id = %request.id, title = %request.title))]
    pub async fn run(&self, request: Request, cancel: CancellationToken) -> DomainResult<Response> {
        let started = Instant::now();
        let deadline_ms = request.deadline_ms.unwrap_or(self.config.default_deadline_ms);
        let deadline = started + Duration::from_millis(deadline_ms);

        let plan = self.plan(&request).await?;
        info!(root_id = %plan.root_id, leaves = plan.leaves.len(), deadline_ms, "Planning loop started");

        let request = Arc::new(request);
        let ledger = Arc::new(Mutex::new(RunLedger::default()));
        let exit = self
            .execute(&request, &plan, &ledger, deadline, &cancel)
            .await;

        let ledger = std::mem::take(&mut *ledger.lock().await);
        self.reflect(&request, &plan, ledger, millis(started.elapsed()), exit)
            .await
    }

    async fn leaf_nodes(&self, plan: &Plan) -> HashMap<Uuid, TaskNode> {
        let mut nodes = HashMap::with_capacity(plan.leaves.len());
        for leaf in &plan.leaves {
            if let Some(node) = self.tasks.get_task(leaf.task_id).await {
                nodes.insert(node.id, node);
            }
        }
        nodes
    }

    fn is_recoverable(node: &TaskNode) -> bool {
        node.status == TaskStatus::Blocked
            && node
                .status_reason
                .as_deref()
                .is_some_and(reason::is_recoverable)
    }

    async fn execute(
        &self,
        request: &Arc<Request>,
        plan: &Plan,
        ledger: &Arc<Mutex<RunLedger>>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> LoopExit {
        loop {
            if cancel.is_cancelled() {
                self.force_unsettled(plan, TaskStatus::Failed, reason::CANCELED)
                    .await;
                return LoopExit::Canceled;
            }
            if Instant::now() >= deadline {
                self.force_unsettled(plan, TaskStatus::Blocked, reason::DEADLINE_EXCEEDED)
                    .await;
                return LoopExit::DeadlineExceeded;
            }

            let nodes = self.leaf_nodes(plan).await;
            let mut ready = Vec::new();
            let mut recoverable = Vec::new();
            let mut progressed = false;

            for leaf in &plan.leaves {
                let Some(node) = nodes.get(&leaf.task_id) else {
                    continue;
                };
                match node.status {
                    TaskStatus::Pending => {
                        let prereqs: Vec<&TaskNode> = leaf
                            .prerequisites
                            .iter()
                            .filter_map(|id| nodes.get(id))
                            .collect();
                        let unsatisfiable = prereqs.iter().any(|p| {
                            p.status == TaskStatus::Failed
                                || (p.status == TaskStatus::Blocked && !Self::is_recoverable(p))
                        });
                        if unsatisfiable {
                            self.settle(
                                leaf.task_id,
                                StatusChange::to(TaskStatus::Blocked)
                                    .because(reason::DEPENDENCY_UNSATISFIED),
                            )
                            .await;
                            progressed = true;
                        } else if prereqs.iter().all(|p| p.status == TaskStatus::Completed) {
                            ready.push(leaf.clone());
                        }
                    }
                    TaskStatus::Blocked if Self::is_recoverable(node) => {
                        recoverable.push(leaf.clone());
                    }
                    _ => {}
                }
            }

            if !ready.is_empty() {
                self.execute_wave(request, ready, ledger, deadline, cancel)
                    .await;
                continue;
            }
            if progressed {
                continue;
            }
            if recoverable.is_empty() || !self.config.await_blocked_leaves {
                self.block_stalled(plan).await;
                return LoopExit::Settled;
            }

            debug!(blocked = recoverable.len(), "Waiting to re-route blocked leaves");
            tokio::select! {
                () = cancel.cancelled() => continue,
                () = sleep_until(deadline) => continue,
                () = sleep(Duration::from_millis(self.config.reroute_interval_ms)) => {}
            }
            self.execute_wave(request, recoverable, ledger, deadline, cancel)
                .await;
        }
    }

    /// Pending leaves still waiting on something that will never finish.
    async fn block_stalled(&self, plan: &Plan) {
        for leaf in &plan.leaves {
            if let Some(node) = self.tasks.get_task(leaf.task_id).await {
                if node.status == TaskStatus::Pending {
                    self.settle(
                        leaf.task_id,
                        StatusChange::to(TaskStatus::Blocked)
                            .because(reason::DEPENDENCY_UNSATISFIED),
                    )
                    .await;
                }
            }
        }
    }

    /// Force every pending or running leaf to `status`.
    async fn force_unsettled(&self, plan: &Plan, status: TaskStatus, why: &str) {
        for leaf in &plan.leaves {
            let Some(node) = self.tasks.get_task(leaf.task_id).await else {
                continue;
            };
            if matches!(node.status, TaskStatus::Pending | TaskStatus::InProgress) {
                self.settle(leaf.task_id, StatusChange::to(status).because(why))
                    .await;
            }
        }
    }

    async fn execute_wave(
        &self,
        request: &Arc<Request>,
        wave: Vec<PlannedLeaf>,
        ledger: &Arc<Mutex<RunLedger>>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut handles = Vec::with_capacity(wave.len());

        for leaf in wave {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let planner = self.clone();
            let request = Arc::clone(request);
            let ledger = Arc::clone(ledger);
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                planner
                    .run_leaf(&request, &leaf, &ledger, deadline, &cancel)
                    .await;
            }));
        }

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Leaf execution task failed");
            }
        }
    }

    async fn settle(&self, task_id: Uuid, change: StatusChange) -> Option<TaskNode> {
        let target = change.status;
        match self.tasks.transition(task_id, change).await {
            Ok(node) => node,
            Err(e) => {
                warn!(task_id = %task_id, status = %target, error = %e, "Status transition rejected");
                None
            }
        }
    }

    async fn apply_policy(&self, ledger: &Mutex<RunLedger>, policy: &Policy, task_id: Uuid) {
        ledger.lock().await.applied_policies.push(policy.name.clone());
        if let Err(e) = self
            .policies
            .record_application(&policy.name, Some(task_id))
            .await
        {
            warn!(policy = %policy.name, error = %e, "Failed to record policy application");
        }
    }

    fn leaf_context(request: &Request, action: &ActionSpec, node: &TaskNode) -> Context {
        let mut context = request.context.clone();
        context.extend(action.parameters.clone());
        context.insert(context_keys::ACTION.to_string(), json!(action.name));
        context.insert(context_keys::TOOL_CATEGORY.to_string(), json!(action.category));
        context.insert(context_keys::TASK_TYPE.to_string(), json!(node.task_type.as_str()));
        context.insert(context_keys::PRIORITY.to_string(), json!(node.priority.as_str()));
        if let Some(user) = &request.user_id {
            context.insert(context_keys::USER_ID.to_string(), json!(user));
        }
        context
    }

    /// Validate, route and execute a single leaf.
    #[instrument(skip_all, fields(task_id = %leaf.task_id, action = %leaf.action.name))]
    async fn run_leaf(
        &self,
        request: &Request,
        leaf: &PlannedLeaf,
        ledger: &Mutex<RunLedger>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) {
        let task_id = leaf.task_id;
        let action = &leaf.action;
        let Some(node) = self.tasks.get_task(task_id).await else {
            warn!("Leaf task vanished before execution");
            return;
        };
        let context = Self::leaf_context(request, action, &node);

        // Validate
        let policies = self.policies.get_applicable_policies(&context).await;

        if let Some(policy) = policies
            .iter()
            .find(|p| matches!(p.action, PolicyAction::Block { .. }))
        {
            self.apply_policy(ledger, policy, task_id).await;
            let why = match &policy.action {
                PolicyAction::Block { reason } => reason.clone(),
                _ => String::new(),
            };
            info!(policy = %policy.name, reason = %why, "Leaf blocked by policy");
            self.settle(
                task_id,
                StatusChange::to(TaskStatus::Failed)
                    .because(reason::POLICY_BLOCKED)
                    .with_outputs(json!({ "policy": policy.name, "reason": why })),
            )
            .await;
            return;
        }

        if let Some(policy) = policies
            .iter()
            .find(|p| matches!(p.action, PolicyAction::RequireApproval { .. }))
        {
            self.apply_policy(ledger, policy, task_id).await;
            let approved = context.get(context_keys::APPROVED) == Some(&json!(true));
            if !approved {
                if let PolicyAction::RequireApproval { prompt } = &policy.action {
                    self.tasks
                        .annotate(task_id, "approval_prompt", json!(prompt))
                        .await;
                }
                info!(policy = %policy.name, "Leaf awaiting approval");
                self.settle(
                    task_id,
                    StatusChange::to(TaskStatus::Blocked).because(reason::APPROVAL_REQUIRED),
                )
                .await;
                return;
            }
        }

        let mut preferences = Vec::new();
        let mut retry: Option<RetryPlan> = None;
        for policy in &policies {
            match &policy.action {
                PolicyAction::PreferTool { tool, weight } => {
                    preferences.push(ToolPreference::new(tool.clone(), *weight));
                    self.apply_policy(ledger, policy, task_id).await;
                }
                PolicyAction::Annotate { key, value } => {
                    self.tasks.annotate(task_id, key.clone(), value.clone()).await;
                    self.apply_policy(ledger, policy, task_id).await;
                }
                PolicyAction::RetryWithBackoff {
                    max_retries,
                    initial_backoff_ms,
                    max_backoff_ms,
                } if retry.is_none() => {
                    retry = Some(RetryPlan {
                        max_retries: *max_retries,
                        initial_backoff_ms: *initial_backoff_ms,
                        max_backoff_ms: *max_backoff_ms,
                    });
                    self.apply_policy(ledger, policy, task_id).await;
                }
                _ => {}
            }
        }

        if let Some(user) = &request.user_id {
            for pref in self
                .knowledge
                .get_user_preferences(user, Some(PREFERRED_TOOL))
                .await
            {
                if pref.key == action.category {
                    if let Some(tool) = pref.value.as_str() {
                        preferences.push(ToolPreference::new(
                            tool,
                            self.config.user_preference_weight * pref.confidence,
                        ));
                    }
                }
            }
        }

        // Route
        if self.config.defer_low_priority && node.priority == TaskPriority::Low {
            let snapshot = self.registry.current_pressure().await;
            if self.registry.is_under_pressure(&snapshot) {
                debug!(cpu_load = snapshot.cpu_load, "Low-priority leaf deferred");
                self.settle(
                    task_id,
                    StatusChange::to(TaskStatus::Blocked).because(reason::DEFERRED),
                )
                .await;
                return;
            }
        }

        let Some(tool) = self
            .registry
            .select_tool(&action.category, &context, &preferences)
            .await
        else {
            info!(category = %action.category, "No tool available for leaf");
            self.settle(
                task_id,
                StatusChange::to(TaskStatus::Blocked).because(reason::NO_TOOL_AVAILABLE),
            )
            .await;
            return;
        };

        if self
            .settle(task_id, StatusChange::to(TaskStatus::InProgress))
            .await
            .is_none()
        {
            return;
        }

        // Execute
        let mut parameters = tool.bind_parameters(&context);
        parameters.extend(action.parameters.clone());
        self.invoke_with_retries(leaf, &tool, &parameters, retry, ledger, deadline, cancel)
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn invoke_with_retries(
        &self,
        leaf: &PlannedLeaf,
        tool: &ToolCapability,
        parameters: &Context,
        retry: Option<RetryPlan>,
        ledger: &Mutex<RunLedger>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) {
        let task_id = leaf.task_id;
        let inputs = serde_json::to_value(parameters).unwrap_or_default();
        let max_attempts = retry.map_or(1, |r| r.max_retries.saturating_add(1));
        let mut backoff = retry.map(RetryPlan::backoff);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let Some(guard) = self.registry.begin_invocation(task_id, &tool.name) else {
                warn!(tool = %tool.name, "Invocation already outstanding for this task");
                self.settle(
                    task_id,
                    StatusChange::to(TaskStatus::Failed)
                        .because(reason::TOOL_FAILED)
                        .with_outputs(json!({ "error": "invocation already outstanding" })),
                )
                .await;
                return;
            };

            let started = Instant::now();
            // Set once the executor is polled; a cancel or deadline that
            // wins the biased select first means the tool never ran.
            let invoked = AtomicBool::new(false);
            let invocation = tokio::select! {
                biased;
                () = cancel.cancelled() => Invocation::Canceled,
                () = sleep_until(deadline) => Invocation::DeadlineExceeded,
                result = async {
                    invoked.store(true, Ordering::SeqCst);
                    self.executor.invoke(&tool.name, parameters).await
                } => Invocation::Finished(result),
            };
            drop(guard);
            let duration_ms = millis(started.elapsed());
            let invoked = invoked.load(Ordering::SeqCst);
            if invoked {
                ledger.lock().await.tools_used.push(tool.name.clone());
            }

            match invocation {
                Invocation::Canceled => {
                    if invoked {
                        self.tasks
                            .add_execution_record(task_id, &tool.name, inputs, None, false, duration_ms)
                            .await;
                    }
                    info!(tool = %tool.name, "Tool invocation canceled");
                    self.settle(
                        task_id,
                        StatusChange::to(TaskStatus::Failed).because(reason::CANCELED),
                    )
                    .await;
                    return;
                }
                Invocation::DeadlineExceeded => {
                    if invoked {
                        self.tasks
                            .add_execution_record(task_id, &tool.name, inputs, None, false, duration_ms)
                            .await;
                    }
                    info!(tool = %tool.name, "Tool invocation cut off by deadline");
                    self.settle(
                        task_id,
                        StatusChange::to(TaskStatus::Blocked).because(reason::DEADLINE_EXCEEDED),
                    )
                    .await;
                    return;
                }
                Invocation::Finished(Ok(outputs)) => {
                    self.tasks
                        .add_execution_record(
                            task_id,
                            &tool.name,
                            inputs.clone(),
                            Some(outputs.clone()),
                            true,
                            duration_ms,
                        )
                        .await;
                    self.registry.record_outcome(&tool.name, true).await;

                    let mut step = WorkflowStep::new(tool.name.clone(), inputs);
                    for output in &tool.outputs {
                        step = step.expecting(output.name.clone());
                    }
                    ledger.lock().await.steps.push(ExecutedStep {
                        order: leaf.order,
                        category: leaf.action.category.clone(),
                        step,
                    });

                    debug!(tool = %tool.name, duration_ms, attempt, "Tool invocation succeeded");
                    self.settle(
                        task_id,
                        StatusChange::to(TaskStatus::Completed).with_outputs(outputs),
                    )
                    .await;
                    return;
                }
                Invocation::Finished(Err(e)) => {
                    let message = e.to_string();
                    self.tasks
                        .add_execution_record(
                            task_id,
                            &tool.name,
                            inputs.clone(),
                            Some(json!({ "error": message })),
                            false,
                            duration_ms,
                        )
                        .await;
                    self.registry.record_outcome(&tool.name, false).await;
                    {
                        let mut ledger = ledger.lock().await;
                        let failure = ledger.failures.entry(tool.name.clone()).or_default();
                        failure.count += 1;
                        failure.last_error.clone_from(&message);
                    }

                    let delay = if attempt < max_attempts {
                        backoff.as_mut().and_then(|b| b.next_backoff())
                    } else {
                        None
                    };
                    if let Some(delay) = delay {
                        warn!(
                            tool = %tool.name,
                            attempt,
                            max_attempts,
                            delay_ms = millis(delay),
                            error = %message,
                            "Tool invocation failed, retrying"
                        );
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => {
                                self.settle(task_id, StatusChange::to(TaskStatus::Failed).because(reason::CANCELED)).await;
                                return;
                            }
                            () = sleep_until(deadline) => {
                                self.settle(task_id, StatusChange::to(TaskStatus::Blocked).because(reason::DEADLINE_EXCEEDED)).await;
                                return;
                            }
                            () = sleep(delay) => continue,
                        }
                    }

                    warn!(tool = %tool.name, attempt, error = %message, "Tool invocation failed");
                    self.settle(
                        task_id,
                        StatusChange::to(TaskStatus::Failed)
                            .because(reason::TOOL_FAILED)
                            .with_outputs(json!({
                                "error": message,
                                "tool": tool.name,
                                "attempts": attempt,
                            })),
                    )
                    .await;
                    return;
                }
            }
        }
    }

    /// Summarize the run, feed what was learned back into the knowledge
    /// store, persist, and build the response.
    async fn reflect(
        &self,
        request: &Request,
        plan: &Plan,
        ledger: RunLedger,
        elapsed_ms: u64,
        exit: LoopExit,
    ) -> DomainResult<Response> {
        let mut outcome = PlanOutcome {
            leaves: plan.leaves.len(),
            elapsed_ms,
            deadline_exceeded: exit == LoopExit::DeadlineExceeded,
            canceled: exit == LoopExit::Canceled,
            ..PlanOutcome::default()
        };
        let mut outputs = BTreeMap::new();

        for leaf in &plan.leaves {
            let Some(node) = self.tasks.get_task(leaf.task_id).await else {
                continue;
            };
            match node.status {
                TaskStatus::Completed => {
                    outcome.completed += 1;
                    if let Some(out) = node.outputs {
                        outputs.insert(leaf.action.name.clone(), out);
                    }
                    continue;
                }
                TaskStatus::Failed => outcome.failed += 1,
                TaskStatus::Blocked => outcome.blocked += 1,
                TaskStatus::Pending | TaskStatus::InProgress => {}
            }
            if let Some(why) = node.status_reason {
                *outcome.reasons.entry(why).or_insert(0) += 1;
            }
        }

        outcome.root_status = match self.tasks.get_task(plan.root_id).await {
            Some(root) => root.status,
            None => TaskStatus::Pending,
        };
        let success = outcome.root_status == TaskStatus::Completed;

        let RunLedger {
            applied_policies,
            tools_used,
            mut steps,
            failures,
        } = ledger;
        steps.sort_by_key(|s| s.order);

        if success {
            let tools: Vec<&str> = steps.iter().map(|s| s.step.tool.as_str()).collect();
            self.knowledge
                .add_knowledge(
                    KnowledgeCategory::WorkflowPattern,
                    request.pattern_name(),
                    json!({
                        "tools": tools,
                        "leaves": outcome.leaves,
                        "elapsed_ms": elapsed_ms,
                    }),
                    self.config.success_confidence,
                    Some(Provenance::ExecutionOutcome),
                )
                .await;
        }

        for (tool, failure) in &failures {
            self.knowledge
                .add_knowledge(
                    KnowledgeCategory::SystemFact,
                    format!("tool-failure:{tool}"),
                    json!({
                        "tool": tool,
                        "failures": failure.count,
                        "last_error": failure.last_error,
                        "request": request.title,
                    }),
                    self.config.failure_confidence,
                    Some(Provenance::ExecutionOutcome),
                )
                .await;
        }

        if !steps.is_empty() {
            let sequence = steps.iter().map(|s| s.step.clone()).collect();
            self.knowledge
                .record_workflow_pattern(request.pattern_name(), sequence, elapsed_ms)
                .await;
        }

        if success {
            if let Some(user) = &request.user_id {
                for executed in &steps {
                    self.knowledge
                        .learn_user_preference(
                            user.clone(),
                            PREFERRED_TOOL,
                            executed.category.clone(),
                            json!(executed.step.tool),
                            self.config.success_confidence,
                            format!("request:{}", request.id),
                        )
                        .await;
                }
            }
        }

        if let Err(e) = self.tasks.persist_tree(plan.root_id).await {
            warn!(error = %e, root_id = %plan.root_id, "Failed to persist task tree");
        }
        if let Err(e) = self.knowledge.persist().await {
            warn!(error = %e, "Failed to persist knowledge");
        }
        if let Err(e) = self.policies.persist().await {
            warn!(error = %e, "Failed to persist policies");
        }

        info!(
            root_id = %plan.root_id,
            root_status = %outcome.root_status,
            completed = outcome.completed,
            failed = outcome.failed,
            blocked = outcome.blocked,
            elapsed_ms,
            deadline_exceeded = outcome.deadline_exceeded,
            canceled = outcome.canceled,
            "Planning loop finished"
        );

        Ok(Response {
            success,
            task_id: plan.root_id,
            outputs,
            applied_policies: dedup_in_order(applied_policies),
            tools_used: dedup_in_order(tools_used),
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::monitor::StaticResourceMonitor;
    use crate::adapters::persistence::InMemoryPersistence;
    use crate::domain::errors::ToolExecutionError;
    use crate::domain::models::{RegistryConfig, TaskConfig};
    use async_trait::async_trait;

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn invoke(
            &self,
            tool_name: &str,
            _parameters: &Context,
        ) -> Result<serde_json::Value, ToolExecutionError> {
            Ok(json!({ "tool": tool_name }))
        }
    }

    fn planner() -> Planner {
        let persistence = Arc::new(InMemoryPersistence::new());
        Planner::new(
            Arc::new(TaskStateManager::new(TaskConfig::default(), persistence.clone())),
            Arc::new(KnowledgeStore::new(persistence.clone())),
            Arc::new(PolicyEngine::new(persistence)),
            Arc::new(ToolRegistry::new(
                RegistryConfig::default(),
                Arc::new(StaticResourceMonitor::unconstrained()),
            )),
            Arc::new(EchoExecutor),
            PlannerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_plan_rejects_empty_request() {
        let err = planner().plan(&Request::new("nothing")).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_plan_rejects_unknown_dependency() {
        let request = Request::new("bad")
            .with_action(ActionSpec::new("a", "etl").after("b"))
            .with_action(ActionSpec::new("b", "etl"));
        let err = planner().plan(&request).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidRequest(_)));

        let duplicate = Request::new("dup")
            .with_action(ActionSpec::new("a", "etl"))
            .with_action(ActionSpec::new("a", "etl"));
        assert!(planner().plan(&duplicate).await.is_err());
    }

    #[tokio::test]
    async fn test_single_action_runs_on_root() {
        let planner = planner();
        let request = Request::new("one").with_action(
            ActionSpec::new("check", "lint").with_description("validate the config"),
        );
        let plan = planner.plan(&request).await.unwrap();
        assert_eq!(plan.leaves.len(), 1);
        assert_eq!(plan.leaves[0].task_id, plan.root_id);

        let root = planner.tasks.get_task(plan.root_id).await.unwrap();
        assert_eq!(root.task_type, TaskType::Validation);
        assert!(!root.is_decomposed());
    }

    #[tokio::test]
    async fn test_multi_action_decomposes_with_dependencies() {
        let planner = planner();
        let request = Request::new("pipeline")
            .with_action(ActionSpec::new("extract", "etl").with_description("process raw data"))
            .with_action(ActionSpec::new("publish", "storage").after("extract"));
        let plan = planner.plan(&request).await.unwrap();

        let root = planner.tasks.get_task(plan.root_id).await.unwrap();
        assert!(root.is_decomposed());
        assert_eq!(root.task_type, TaskType::DecompositionGoal);
        assert_eq!(plan.leaves[1].prerequisites, vec![plan.leaves[0].task_id]);

        let extract = planner.tasks.get_task(plan.leaves[0].task_id).await.unwrap();
        assert_eq!(extract.task_type, TaskType::DataProcessing);
        let publish = planner.tasks.get_task(plan.leaves[1].task_id).await.unwrap();
        assert_eq!(publish.prerequisites(), vec![extract.id]);
    }

    #[tokio::test]
    async fn test_dependent_leaf_blocked_when_prerequisite_fails() {
        let planner = planner();
        planner
            .policies
            .add_policy(
                "no-etl",
                "",
                "safety",
                crate::domain::models::PolicyCondition::equals(context_keys::TOOL_CATEGORY, "etl"),
                PolicyAction::Block {
                    reason: "frozen".into(),
                },
            )
            .await
            .unwrap();
        planner
            .registry
            .register(ToolCapability::new("s3", "storage"))
            .await
            .unwrap();

        let request = Request::new("pipeline")
            .with_action(ActionSpec::new("extract", "etl"))
            .with_action(ActionSpec::new("publish", "storage").after("extract"));
        let response = planner.run(request, CancellationToken::new()).await.unwrap();

        assert!(!response.success);
        assert_eq!(response.outcome.failed, 1);
        assert_eq!(response.outcome.blocked, 1);
        assert_eq!(
            response.outcome.reasons.get(reason::DEPENDENCY_UNSATISFIED),
            Some(&1)
        );
        assert!(response.tools_used.is_empty());
        assert_eq!(response.outcome.root_status, TaskStatus::Failed);
    }

    #[test]
    fn test_retry_backoff_doubles_up_to_cap() {
        let mut backoff = RetryPlan {
            max_retries: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 25,
        }
        .backoff();
        assert_eq!(backoff.next_backoff().map(millis), Some(10));
        assert_eq!(backoff.next_backoff().map(millis), Some(20));
        assert_eq!(backoff.next_backoff().map(millis), Some(25));
    }
}
