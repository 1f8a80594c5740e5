use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use goalflow_core::context::WorkflowContext;
use goalflow_core::error::Result;
use goalflow_core::traits::{Agent, TaskParams};
use goalflow_core::workflow::Workflow;
use goalflow_engine::AgentRegistry;

/// Stand-in agent for `goalflow run`: waits briefly, records that it ran in
/// the workflow context and echoes its parameters.
pub struct DryRunAgent {
    agent_type: String,
    latency: Duration,
}

impl DryRunAgent {
    pub fn new(agent_type: &str, latency: Duration) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            latency,
        }
    }
}

impl Agent for DryRunAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn description(&self) -> &str {
        "Dry-run agent (no external calls)"
    }

    fn execute(&self, params: TaskParams, ctx: WorkflowContext) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            tokio::time::sleep(self.latency).await;
            let runs = ctx
                .get("dry_run.calls")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            ctx.set("dry_run.calls", json!(runs + 1));
            Ok(json!({
                "agent_type": self.agent_type,
                "dry_run": true,
                "params": params,
            }))
        })
    }
}

/// Registry with a dry-run agent for every agent type `workflow` uses.
pub fn registry_for(workflow: &Workflow, latency: Duration) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    for agent_type in workflow.agent_types() {
        let agent: Arc<dyn Agent> = Arc::new(DryRunAgent::new(&agent_type, latency));
        registry.register_as(agent_type, agent);
    }
    registry
}
