use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use goalflow_core::goal::Goal;
use goalflow_core::task::{Task, TaskStatus};
use goalflow_core::types::{TaskId, WorkflowId};
use goalflow_core::workflow::{Progress, Workflow, WorkflowStatus};

/// Point-in-time view of a workflow, as returned by `get_workflow_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub id: WorkflowId,
    pub name: String,
    pub status: WorkflowStatus,
    pub progress: Progress,
    pub goal: Goal,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskSummary>,
}

/// One task line of a status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub name: String,
    pub agent_type: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            agent_type: task.agent_type.clone(),
            status: task.status,
            retry_count: task.retry_count,
            error: task.error.clone(),
            result: task.result.clone(),
        }
    }
}

impl From<&Workflow> for WorkflowStatusReport {
    fn from(workflow: &Workflow) -> Self {
        Self {
            id: workflow.id.clone(),
            name: workflow.name.clone(),
            status: workflow.status,
            progress: workflow.progress(),
            goal: workflow.goal.clone(),
            user_id: workflow.user_id.clone(),
            created_at: workflow.created_at,
            started_at: workflow.started_at,
            completed_at: workflow.completed_at,
            tasks: workflow.tasks.iter().map(TaskSummary::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_from_workflow() {
        let mut wf = Workflow::new("Arb", "", Goal::new("g", "profit_usd", 10.0), "alice")
            .with_task(Task::new("a", "A", "price_monitor"))
            .with_task(Task::new("b", "B", "reporter").depends_on("a"));
        wf.tasks[0].mark_failed("agent not available", Utc::now());

        let report = WorkflowStatusReport::from(&wf);
        assert_eq!(report.name, "Arb");
        assert_eq!(report.progress.total, 2);
        assert_eq!(report.progress.failed, 1);
        assert_eq!(report.progress.pending, 1);
        assert_eq!(report.tasks[0].error.as_deref(), Some("agent not available"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "created");
        assert_eq!(json["progress"]["total"], 2);
        assert!(json["tasks"][1].get("error").is_none());
    }
}
