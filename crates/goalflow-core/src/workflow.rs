use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::WorkflowContext;
use crate::error::{GoalflowError, Result};
use crate::goal::Goal;
use crate::task::{Task, TaskStatus};
use crate::types::{TaskId, WorkflowId};

/// Aggregate lifecycle status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Task counts per status at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub cancelled: usize,
    /// Completed share of all tasks, 0-100.
    pub percent: f64,
}

/// A DAG of tasks working towards one goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub goal: Goal,
    /// Tasks in insertion order; the order breaks priority ties.
    pub tasks: Vec<Task>,
    pub status: WorkflowStatus,
    pub user_id: String,
    /// Optional cron expression (seconds field first, as the `cron` crate expects).
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub context: WorkflowContext,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        goal: Goal,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            description: description.into(),
            goal,
            tasks: vec![],
            status: WorkflowStatus::Created,
            user_id: user_id.into(),
            schedule: None,
            context: WorkflowContext::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_id(mut self, id: WorkflowId) -> Self {
        self.id = id;
        self
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    pub fn with_context(mut self, context: WorkflowContext) -> Self {
        self.context = context;
        self
    }

    /// Attach a cron schedule after checking that it parses.
    pub fn with_schedule(mut self, expr: impl Into<String>) -> Result<Self> {
        let expr = expr.into();
        cron::Schedule::from_str(&expr).map_err(|e| GoalflowError::InvalidSchedule {
            schedule: expr.clone(),
            reason: e.to_string(),
        })?;
        self.schedule = Some(expr);
        Ok(self)
    }

    /// Next time the schedule fires strictly after `after`.
    pub fn next_run_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let expr = self.schedule.as_deref()?;
        let schedule = cron::Schedule::from_str(expr).ok()?;
        schedule.after(&after).next()
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.task(id).map(|t| t.status)
    }

    /// Whether every dependency of `task` has Completed.
    pub fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies
            .iter()
            .all(|dep| self.status_of(dep) == Some(TaskStatus::Completed))
    }

    /// Pending tasks whose dependencies have all Completed, highest priority
    /// first. Equal priorities keep insertion order.
    pub fn get_ready_tasks(&self) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && self.dependencies_met(t))
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority));
        ready
    }

    /// True iff every task is Completed or Cancelled.
    pub fn is_completed(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Cancelled))
    }

    /// True iff some task failed with its retries exhausted.
    pub fn has_failed_tasks(&self) -> bool {
        self.tasks.iter().any(|t| t.status == TaskStatus::Failed)
    }

    /// Status the workflow should resolve to, if it can make no more progress.
    ///
    /// Returns `None` while any task is running, waiting out a backoff, or
    /// ready to run. Tasks stuck behind a failed or cancelled dependency do
    /// not hold the workflow open.
    pub fn settled_status(&self) -> Option<WorkflowStatus> {
        if self.is_completed() {
            return Some(WorkflowStatus::Completed);
        }
        if self.tasks.iter().any(|t| t.status.is_in_flight()) {
            return None;
        }
        if !self.get_ready_tasks().is_empty() {
            return None;
        }
        if self.has_failed_tasks() {
            Some(WorkflowStatus::Failed)
        } else {
            Some(WorkflowStatus::Cancelled)
        }
    }

    /// Check that task ids are unique and that dependencies form a DAG over
    /// existing tasks.
    pub fn validate(&self) -> Result<()> {
        let mut ids: HashSet<&TaskId> = HashSet::with_capacity(self.tasks.len());
        for task in &self.tasks {
            if !ids.insert(&task.id) {
                return Err(GoalflowError::DuplicateTask(task.id.to_string()));
            }
        }

        for task in &self.tasks {
            for dep in &task.dependencies {
                if dep == &task.id {
                    return Err(GoalflowError::SelfDependency(task.id.to_string()));
                }
                if !ids.contains(dep) {
                    return Err(GoalflowError::UnknownDependency {
                        task_id: task.id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
            }
        }

        // Kahn's algorithm: whatever cannot be peeled off sits on a cycle
        // or downstream of one.
        let mut indegree: HashMap<&TaskId, usize> = self
            .tasks
            .iter()
            .map(|t| (&t.id, t.dependencies.len()))
            .collect();
        let mut dependents: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
        for task in &self.tasks {
            for dep in &task.dependencies {
                dependents.entry(dep).or_default().push(&task.id);
            }
        }

        let mut queue: VecDeque<&TaskId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;

        while let Some(id) = queue.pop_front() {
            visited += 1;
            for next in dependents.get(id).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }

        if visited < self.tasks.len() {
            let mut stuck: Vec<String> = indegree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            stuck.sort();
            return Err(GoalflowError::DependencyCycle(stuck));
        }

        Ok(())
    }

    pub fn progress(&self) -> Progress {
        let mut p = Progress {
            total: self.tasks.len(),
            ..Progress::default()
        };
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => p.pending += 1,
                TaskStatus::Running => p.running += 1,
                TaskStatus::Completed => p.completed += 1,
                TaskStatus::Failed => p.failed += 1,
                TaskStatus::Retrying => p.retrying += 1,
                TaskStatus::Cancelled => p.cancelled += 1,
            }
        }
        if p.total > 0 {
            p.percent = p.completed as f64 / p.total as f64 * 100.0;
        }
        p
    }

    /// Distinct agent types used by this workflow, in first-use order.
    pub fn agent_types(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for task in &self.tasks {
            if !seen.contains(&task.agent_type) {
                seen.push(task.agent_type.clone());
            }
        }
        seen
    }
}
