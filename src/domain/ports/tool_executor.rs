use async_trait::async_trait;

use crate::domain::errors::ToolExecutionError;
use crate::domain::models::Context;

/// The population of invocable tools.
///
/// The core selects a tool and calls `invoke`; it never looks inside.
/// Implementations may be asynchronous internally, but the planner awaits
/// each invocation to completion (or cancellation) and never issues two
/// concurrent invocations for the same (task, tool) pair.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run `tool_name` with `parameters`, returning its outputs.
    async fn invoke(
        &self,
        tool_name: &str,
        parameters: &Context,
    ) -> Result<serde_json::Value, ToolExecutionError>;
}
