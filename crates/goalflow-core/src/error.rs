use thiserror::Error;

#[derive(Debug, Error)]
pub enum GoalflowError {
    // Agent errors
    #[error("Agent execution failed: {0}")]
    Agent(String),

    #[error("Agent timeout after {timeout_secs}s: {agent_type}")]
    AgentTimeout { agent_type: String, timeout_secs: u64 },

    #[error("Agent not available: {0}")]
    AgentNotAvailable(String),

    // Lookup errors
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    // Graph errors
    #[error("Task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: String, dependency: String },

    #[error("Task {0} cannot depend on itself")]
    SelfDependency(String),

    #[error("Dependency cycle detected between tasks: {0:?}")]
    DependencyCycle(Vec<String>),

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Invalid schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    // Lifecycle errors
    #[error("Workflow {workflow_id} cannot move from {from} to {to}")]
    InvalidTransition {
        workflow_id: String,
        from: String,
        to: String,
    },

    #[error("Unknown workflow template: {0}")]
    UnknownTemplate(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GoalflowError>;
