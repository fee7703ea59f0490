pub mod knowledge_store;
pub mod planner;
pub mod policy_engine;
pub mod task_state_manager;
pub mod tool_registry;

pub use knowledge_store::KnowledgeStore;
pub use planner::{Plan, PlannedLeaf, Planner, PREFERRED_TOOL};
pub use policy_engine::PolicyEngine;
pub use task_state_manager::{derive_composite_status, TaskStateManager, TaskTree};
pub use tool_registry::{InFlightGuard, ToolRegistry};
