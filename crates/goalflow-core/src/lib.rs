pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod goal;
pub mod task;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use context::WorkflowContext;
pub use error::{GoalflowError, Result};
pub use event::{EventBus, WorkflowEvent};
pub use goal::Goal;
pub use task::{Task, TaskStatus};
pub use traits::{Agent, TaskParams};
pub use types::*;
pub use workflow::{Progress, Workflow, WorkflowStatus};
