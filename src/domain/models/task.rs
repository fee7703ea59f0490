//! Task domain model.
//!
//! Task nodes form a tree: a root created from a request, optionally
//! decomposed into subtasks. Parent/child links are ids into an arena
//! owned by the task state manager, never live references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Metadata key marking a task as decomposed.
pub const META_DECOMPOSED: &str = "decomposed";
/// Metadata key listing prerequisite sibling task ids.
pub const META_DEPENDS_ON: &str = "depends_on";

/// Reasons attached to non-successful status changes.
pub mod reason {
    pub const POLICY_BLOCKED: &str = "policy-blocked";
    pub const APPROVAL_REQUIRED: &str = "approval-required";
    pub const NO_TOOL_AVAILABLE: &str = "no-tool-available";
    pub const DEFERRED: &str = "deferred-resource-pressure";
    pub const DEPENDENCY_UNSATISFIED: &str = "dependency-unsatisfied";
    pub const TOOL_FAILED: &str = "tool-failed";
    pub const CANCELED: &str = "canceled";
    pub const DEADLINE_EXCEEDED: &str = "deadline-exceeded";
    pub const SUBTASK_FAILED: &str = "subtask-failed";
    pub const SUBTASK_BLOCKED: &str = "subtask-blocked";

    /// Blocked reasons that may clear on a later routing pass.
    pub fn is_recoverable(reason: &str) -> bool {
        matches!(reason, NO_TOOL_AVAILABLE | DEFERRED)
    }
}

/// Status of a task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet started
    Pending,
    /// A tool invocation (or a subtask) is running
    InProgress,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Waiting on something outside the task (tool, resources, approval)
    Blocked,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" | "inprogress" | "running" => Some(Self::InProgress),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    /// Completed and failed accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Nothing is running or waiting to run.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::InProgress, Self::Blocked, Self::Failed],
            Self::InProgress => &[Self::Completed, Self::Failed, Self::Blocked],
            Self::Blocked => &[Self::InProgress, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority level for tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Task-type tag. The set is open: unknown tags are kept as `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    UserRequest,
    DecompositionGoal,
    Validation,
    SystemOperation,
    DataProcessing,
    Custom(String),
}

impl Default for TaskType {
    fn default() -> Self {
        Self::UserRequest
    }
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::UserRequest => "user_request",
            Self::DecompositionGoal => "decomposition_goal",
            Self::Validation => "validation",
            Self::SystemOperation => "system_operation",
            Self::DataProcessing => "data_processing",
            Self::Custom(tag) => tag,
        }
    }

    /// Guess a tag from a free-text action description.
    pub fn infer(text: &str) -> Self {
        const VALIDATION: &[&str] = &["validate", "verify", "check", "lint", "test", "audit"];
        const SYSTEM: &[&str] = &[
            "install", "configure", "restart", "deploy", "system", "cleanup", "provision",
        ];
        const DATA: &[&str] = &[
            "process", "transform", "parse", "index", "analyze", "analyse", "convert", "extract",
            "summarize",
        ];

        let lower = text.to_lowercase();
        let has_any = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        if has_any(VALIDATION) {
            Self::Validation
        } else if has_any(SYSTEM) {
            Self::SystemOperation
        } else if has_any(DATA) {
            Self::DataProcessing
        } else {
            Self::UserRequest
        }
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "user_request" => Self::UserRequest,
            "decomposition_goal" => Self::DecompositionGoal,
            "validation" => Self::Validation,
            "system_operation" => Self::SystemOperation,
            "data_processing" => Self::DataProcessing,
            _ => Self::Custom(s),
        }
    }
}

impl From<TaskType> for String {
    fn from(t: TaskType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempted tool invocation for a task. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub tool_name: String,
    /// Snapshot of the parameters passed to the tool
    pub inputs: serde_json::Value,
    /// Tool outputs; None when the invocation did not return
    pub outputs: Option<serde_json::Value>,
    pub success: bool,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(
        tool_name: impl Into<String>,
        inputs: serde_json::Value,
        outputs: Option<serde_json::Value>,
        success: bool,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool_name: tool_name.into(),
            inputs,
            outputs,
            success,
            duration_ms,
            timestamp: Utc::now(),
        }
    }
}

/// A unit of work, or a composite container of subtasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: Uuid,
    /// None for root tasks
    pub parent_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    /// Why the task reached its current status, when not self-evident
    pub status_reason: Option<String>,
    /// Outputs attached by the last status update
    pub outputs: Option<serde_json::Value>,
    /// Ordered child ids, owned exclusively by this node
    pub subtasks: Vec<Uuid>,
    pub executions: Vec<ExecutionRecord>,
    /// Planner annotations
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped on every mutation
    pub version: u64,
}

impl TaskNode {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            title: title.into(),
            description: description.into(),
            task_type: TaskType::default(),
            priority: TaskPriority::default(),
            status: TaskStatus::default(),
            status_reason: None,
            outputs: None,
            subtasks: Vec::new(),
            executions: Vec::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            version: 1,
        }
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// A composite never runs a tool itself.
    pub fn is_composite(&self) -> bool {
        !self.subtasks.is_empty()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_decomposed(&self) -> bool {
        self.metadata
            .get(META_DECOMPOSED)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Prerequisite sibling ids recorded in metadata.
    pub fn prerequisites(&self) -> Vec<Uuid> {
        self.metadata
            .get(META_DEPENDS_ON)
            .and_then(serde_json::Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| Uuid::parse_str(s).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_prerequisites(&mut self, ids: &[Uuid]) {
        let values = ids
            .iter()
            .map(|id| serde_json::Value::String(id.to_string()))
            .collect();
        self.metadata
            .insert(META_DEPENDS_ON.to_string(), serde_json::Value::Array(values));
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }

    /// Set status and timestamps without validating the transition.
    pub(crate) fn apply_status(&mut self, status: TaskStatus) {
        let now = Utc::now();
        if status == TaskStatus::InProgress && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = status;
        self.touch();
    }

    /// Move toward `target`, inserting the InProgress hop a composite needs
    /// to complete from pending or blocked. Returns whether anything changed.
    pub(crate) fn settle_to(&mut self, target: TaskStatus) -> bool {
        if self.status == target || self.is_terminal() {
            return false;
        }
        if !self.status.can_transition_to(target) {
            let needs_hop = target == TaskStatus::Completed
                && matches!(self.status, TaskStatus::Pending | TaskStatus::Blocked);
            if !needs_hop {
                return false;
            }
            self.apply_status(TaskStatus::InProgress);
        }
        self.apply_status(target);
        true
    }
}

/// Description of a subtask handed to `decompose_task`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub title: String,
    pub description: String,
    pub task_type: Option<TaskType>,
    pub priority: Option<TaskPriority>,
    /// Indices of earlier specs in the same decomposition this one waits on
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SubtaskSpec {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn depending_on(mut self, index: usize) -> Self {
        self.depends_on.push(index);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A requested status change.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: TaskStatus,
    pub outputs: Option<serde_json::Value>,
    pub reason: Option<String>,
}

impl StatusChange {
    pub fn to(status: TaskStatus) -> Self {
        Self {
            status,
            outputs: None,
            reason: None,
        }
    }

    pub fn with_outputs(mut self, outputs: serde_json::Value) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Aggregate counters over the retained task arena.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total_tasks: usize,
    pub by_status: HashMap<TaskStatus, usize>,
    pub by_type: HashMap<TaskType, usize>,
    /// Mean of `completed_at - created_at` over completed tasks
    pub average_completion_time_ms: Option<f64>,
}
