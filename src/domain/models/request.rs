//! Requests entering the core and the responses it returns.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::task::{TaskPriority, TaskStatus, TaskType};

/// String → value mapping used for policy evaluation and tool parameters.
pub type Context = HashMap<String, serde_json::Value>;

/// One logical action inside a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Unique within the request; dependencies refer to it
    pub name: String,
    pub description: String,
    /// Tool category able to carry out the action
    pub category: String,
    /// Explicit tag; inferred from the description when absent
    #[serde(default)]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub parameters: Context,
    /// Names of sibling actions that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ActionSpec {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            category: category.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn after(mut self, action: impl Into<String>) -> Self {
        self.depends_on.push(action.into());
        self
    }

    pub fn resolved_type(&self) -> TaskType {
        self.task_type
            .clone()
            .unwrap_or_else(|| TaskType::infer(&self.description))
    }
}

/// A high-level request handed to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub actions: Vec<ActionSpec>,
    /// Shared context every action sees
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Overrides the configured planning deadline
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Name under which the executed workflow is recorded; defaults to the title
    #[serde(default)]
    pub pattern_name: Option<String>,
}

impl Request {
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            id: Uuid::new_v4(),
            description: title.clone(),
            title,
            actions: Vec::new(),
            context: Context::new(),
            priority: TaskPriority::default(),
            deadline_ms: None,
            user_id: None,
            pattern_name: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_action(mut self, action: ActionSpec) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_pattern_name(mut self, name: impl Into<String>) -> Self {
        self.pattern_name = Some(name.into());
        self
    }

    pub fn pattern_name(&self) -> &str {
        self.pattern_name.as_deref().unwrap_or(&self.title)
    }
}

/// Summary of how a planning loop ended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanOutcome {
    pub root_status: TaskStatus,
    pub leaves: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    /// Count of leaves per non-success reason
    pub reasons: BTreeMap<String, usize>,
    pub elapsed_ms: u64,
    pub deadline_exceeded: bool,
    pub canceled: bool,
}

impl PlanOutcome {
    /// Whether some leaves settled but not all of them completed.
    pub fn is_partial(&self) -> bool {
        self.completed > 0 && self.completed < self.leaves
    }
}

/// What `Coordinator::execute` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    /// Root task of the plan
    pub task_id: Uuid,
    /// Outputs of completed leaves keyed by action name
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub applied_policies: Vec<String>,
    pub tools_used: Vec<String>,
    pub outcome: PlanOutcome,
}
