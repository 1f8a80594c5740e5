//! Mock agents and fixtures shared by goalflow tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use goalflow_core::config::AppConfig;
use goalflow_core::context::WorkflowContext;
use goalflow_core::error::{GoalflowError, Result};
use goalflow_core::goal::Goal;
use goalflow_core::task::Task;
use goalflow_core::traits::{Agent, TaskParams};
use goalflow_core::workflow::Workflow;

/// Returns its parameters as a JSON object.
pub struct EchoAgent {
    agent_type: String,
}

impl EchoAgent {
    pub fn new(agent_type: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
        }
    }
}

impl Agent for EchoAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn execute(&self, params: TaskParams, _ctx: WorkflowContext) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move { Ok(serde_json::to_value(params)?) })
    }
}

/// Fails its first `failures` calls, then succeeds.
///
/// Clones share the call counter.
#[derive(Clone)]
pub struct ScriptedAgent {
    agent_type: String,
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl ScriptedAgent {
    pub fn new(agent_type: &str, failures: u32) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            failures,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Agent that never succeeds.
    pub fn always_failing(agent_type: &str) -> Self {
        Self::new(agent_type, u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Agent for ScriptedAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn execute(&self, _params: TaskParams, _ctx: WorkflowContext) -> BoxFuture<'_, Result<serde_json::Value>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failures = self.failures;
        Box::pin(async move {
            if call <= failures {
                Err(GoalflowError::Agent(format!("scripted failure {}", call)))
            } else {
                Ok(json!({ "attempt": call }))
            }
        })
    }
}

/// Panics inside `execute` before any future is built.
pub struct EagerPanicAgent {
    agent_type: String,
}

impl EagerPanicAgent {
    pub fn new(agent_type: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
        }
    }
}

impl Agent for EagerPanicAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn execute(&self, _params: TaskParams, _ctx: WorkflowContext) -> BoxFuture<'_, Result<serde_json::Value>> {
        panic!("{} refused the call", self.agent_type);
    }
}

/// Sleeps for a fixed delay before succeeding.
pub struct SlowAgent {
    agent_type: String,
    delay: Duration,
}

impl SlowAgent {
    pub fn new(agent_type: &str, delay: Duration) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            delay,
        }
    }
}

impl Agent for SlowAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn execute(&self, _params: TaskParams, _ctx: WorkflowContext) -> BoxFuture<'_, Result<serde_json::Value>> {
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(json!({ "slept_ms": delay.as_millis() as u64 }))
        })
    }
}

/// Records how many calls overlap. Each call holds for `hold`.
#[derive(Clone)]
pub struct ConcurrencyTracker {
    agent_type: String,
    hold: Duration,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyTracker {
    pub fn new(agent_type: &str, hold: Duration) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            hold,
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Agent for ConcurrencyTracker {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn execute(&self, _params: TaskParams, _ctx: WorkflowContext) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(json!(null))
        })
    }
}

/// Writes its `key`/`value` parameters into the workflow context and
/// returns what it read back.
pub struct ContextWriter {
    agent_type: String,
}

impl ContextWriter {
    pub fn new(agent_type: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
        }
    }
}

impl Agent for ContextWriter {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn execute(&self, params: TaskParams, ctx: WorkflowContext) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let key = params
                .get("key")
                .and_then(|v| v.as_str())
                .ok_or_else(|| GoalflowError::Agent("missing 'key' parameter".into()))?
                .to_string();
            let value = params.get("value").cloned().unwrap_or(json!(null));
            ctx.set(key.clone(), value);
            Ok(ctx.get(&key).unwrap_or(json!(null)))
        })
    }
}

// -- Fixtures --

/// Config with short backoff and poll interval for end-to-end tests.
pub fn fast_config(workers: usize) -> AppConfig {
    let mut config = AppConfig::default();
    config.orchestrator.workers = workers;
    config.orchestrator.poll_interval_ms = 10;
    config.retry.base_delay_ms = 50;
    config.retry.max_delay_ms = 5_000;
    config.retry.jitter = 0.0;
    config
}

pub fn test_goal() -> Goal {
    Goal::new("test objective", "score", 1.0)
}

/// Linear chain `t1 → t2 → … → tn`, every task on `agent_type`.
pub fn chain_workflow(agent_type: &str, len: usize) -> Workflow {
    let tasks = (1..=len).map(|i| {
        let task = Task::new(format!("t{}", i), format!("Step {}", i), agent_type);
        if i > 1 {
            task.depends_on(format!("t{}", i - 1))
        } else {
            task
        }
    });
    Workflow::new("chain", "linear test chain", test_goal(), "tester").with_tasks(tasks)
}

/// `count` tasks with no dependencies between them.
pub fn independent_workflow(agent_type: &str, count: usize) -> Workflow {
    let tasks = (1..=count).map(|i| Task::new(format!("t{}", i), format!("Task {}", i), agent_type));
    Workflow::new("parallel", "independent tasks", test_goal(), "tester").with_tasks(tasks)
}

/// One task on `agent_type`.
pub fn single_task_workflow(agent_type: &str) -> Workflow {
    Workflow::new("single", "one task", test_goal(), "tester")
        .with_task(Task::new("only", "Only task", agent_type))
}
