pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod status;
pub mod templates;

pub use orchestrator::{Orchestrator, OrchestratorState};
pub use queue::{QueuedTask, ReadyQueue};
pub use registry::{execute_with_deadline, AgentRegistry};
pub use retry::Backoff;
pub use status::{TaskSummary, WorkflowStatusReport};
pub use templates::TemplateKind;
