use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use goalflow_core::context::WorkflowContext;
use goalflow_core::error::{GoalflowError, Result};
use goalflow_core::traits::{Agent, TaskParams};
use goalflow_core::workflow::Workflow;

/// Registry of available agents, keyed by agent type.
///
/// Populated before the orchestrator is built and frozen inside it, so
/// lookups during dispatch need no lock.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own agent type.
    pub fn register(&mut self, agent: impl Agent) {
        let key = agent.agent_type().to_string();
        self.agents.insert(key, Arc::new(agent));
    }

    /// Register a shared agent under an explicit key.
    ///
    /// Lets one implementation serve several agent types.
    pub fn register_as(&mut self, agent_type: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.insert(agent_type.into(), agent);
    }

    /// Builder form of `register`.
    pub fn with(mut self, agent: impl Agent) -> Self {
        self.register(agent);
        self
    }

    /// Unregister an agent by type.
    pub fn unregister(&mut self, agent_type: &str) -> bool {
        self.agents.remove(agent_type).is_some()
    }

    /// Get an agent by type.
    pub fn get(&self, agent_type: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_type).cloned()
    }

    /// Like `get`, but a missing agent is an `AgentNotAvailable` error.
    pub fn require(&self, agent_type: &str) -> Result<Arc<dyn Agent>> {
        self.get(agent_type)
            .ok_or_else(|| GoalflowError::AgentNotAvailable(agent_type.to_string()))
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.agents.contains_key(agent_type)
    }

    /// Registered agent types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.agents.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Agent types used by `workflow` that nothing is registered for.
    pub fn missing_for(&self, workflow: &Workflow) -> Vec<String> {
        workflow
            .agent_types()
            .into_iter()
            .filter(|t| !self.contains(t))
            .collect()
    }
}

/// Run one attempt of an agent under a deadline.
///
/// A panic inside the agent, whether raised while building the future or while
/// polling it, is reported as an execution failure rather than taking down the
/// calling worker.
pub async fn execute_with_deadline(
    agent: &Arc<dyn Agent>,
    params: TaskParams,
    ctx: WorkflowContext,
    timeout: Duration,
) -> Result<serde_json::Value> {
    let attempt = AssertUnwindSafe(async move { agent.execute(params, ctx).await }).catch_unwind();

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(GoalflowError::Agent(format!(
            "agent '{}' panicked",
            agent.agent_type()
        ))),
        Err(_) => Err(GoalflowError::AgentTimeout {
            agent_type: agent.agent_type().to_string(),
            timeout_secs: timeout.as_secs(),
        }),
    }
}
