//! Domain errors for the Waypoint orchestration core.
//!
//! Only validation failures travel as `Err`. Policy blocks, missing tools,
//! tool failures, cancellation and deadlines are recorded on the task tree
//! and summarized in the response instead.

use thiserror::Error;
use uuid::Uuid;

use super::models::task::TaskStatus;

/// Errors raised by the task state manager.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Parent task not found: {0}")]
    InvalidParent(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Task {0} has already been decomposed")]
    AlreadyDecomposed(Uuid),

    #[error("Task {id} is in terminal state {status}")]
    TerminalTask { id: Uuid, status: TaskStatus },

    #[error("Invalid state transition for task {id} from {from} to {to}")]
    InvalidStateTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {id} cannot complete: {pending} subtask(s) not completed")]
    IncompleteSubtasks { id: Uuid, pending: usize },

    #[error("Decomposition of task {0} needs at least one subtask")]
    EmptySubtaskList(Uuid),

    #[error("Subtask {index} depends on unknown or later subtask {dependency}")]
    InvalidSubtaskDependency { index: usize, dependency: usize },
}

/// Errors raised by the tool capability registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tool already registered: {0}")]
    DuplicateTool(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

/// Errors raised by the policy engine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Policy already exists: {0}")]
    DuplicatePolicy(String),

    #[error("Policy not found: {0}")]
    PolicyNotFound(String),
}

/// Errors raised by a persistence adapter or while (de)serializing for one.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Failure reported by a tool executor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolExecutionError {
    #[error("Tool {tool} failed: {message}")]
    Failed { tool: String, message: String },

    #[error("Tool {tool} timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("Tool {0} is unavailable")]
    Unavailable(String),
}

impl ToolExecutionError {
    pub fn failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Domain-level errors that can occur in the Waypoint core.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Coordinator is not initialized")]
    NotInitialized,

    #[error("Component {component} failed to initialize: {source}")]
    ComponentInit {
        component: &'static str,
        #[source]
        source: Box<DomainError>,
    },

    #[error("Missing dependency: {0}")]
    MissingDependency(&'static str),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(PersistenceError::Serialization(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let id = Uuid::nil();
        let err = TaskError::TerminalTask {
            id,
            status: TaskStatus::Completed,
        };
        assert_eq!(
            err.to_string(),
            format!("Task {id} is in terminal state completed")
        );

        let wrapped: DomainError = RegistryError::DuplicateTool("grep".into()).into();
        assert_eq!(wrapped.to_string(), "Tool already registered: grep");
    }

    #[test]
    fn test_component_init_keeps_source() {
        let err = DomainError::ComponentInit {
            component: "knowledge_store",
            source: Box::new(DomainError::Persistence(PersistenceError::Storage(
                "disk full".into(),
            ))),
        };
        assert!(err.to_string().contains("knowledge_store"));
        assert!(err.to_string().contains("disk full"));
    }
}
