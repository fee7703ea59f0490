pub mod config;
pub mod knowledge;
pub mod policy;
pub mod request;
pub mod task;
pub mod tool;

pub use config::{
    KnowledgeConfig, LogFormat, LoggingConfig, PersistenceBackend, PersistenceConfig,
    PlannerConfig, RegistryConfig, RotationPolicy, TaskConfig, WaypointConfig,
};
pub use knowledge::{
    clamp_confidence, KnowledgeCategory, KnowledgeEntry, KnowledgeStatistics, Provenance,
    UserPreference, WorkflowPattern, WorkflowStep,
};
pub use policy::{Policy, PolicyAction, PolicyApplication, PolicyCondition};
pub use request::{ActionSpec, Context, PlanOutcome, Request, Response};
pub use task::{
    reason, ExecutionRecord, StatusChange, SubtaskSpec, TaskNode, TaskPriority, TaskStatistics,
    TaskStatus, TaskType,
};
pub use tool::{
    OutputSpec, ParameterSpec, ParameterType, ResourceRequirement, ResourceSnapshot,
    ToolCapability, ToolPreference,
};
