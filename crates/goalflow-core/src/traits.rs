use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::context::WorkflowContext;
use crate::error::Result;

/// Task parameters handed to an agent.
pub type TaskParams = HashMap<String, serde_json::Value>;

/// An executor capability looked up by agent type.
///
/// Agents run against external systems (price feeds, models, chains) and are
/// opaque to the orchestrator. Execution may be attempted more than once for
/// the same task, so implementations should be idempotent.
pub trait Agent: Send + Sync + 'static {
    /// Registry key (matches `Task::agent_type`).
    fn agent_type(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Execute one attempt of a task.
    ///
    /// `ctx` is the workflow's shared scratch space. Writes are visible to
    /// every later task of the workflow; see `WorkflowContext` for the
    /// concurrency contract.
    fn execute(&self, params: TaskParams, ctx: WorkflowContext)
        -> BoxFuture<'_, Result<serde_json::Value>>;
}
