use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Priority, TaskId};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default per-attempt execution deadline.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Execution state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl TaskStatus {
    /// Completed, Failed and Cancelled never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Running, or waiting out a backoff before the next attempt.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Running | Self::Retrying)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// An atomic unit of work executed by one agent.
///
/// Only the orchestrator's worker loop mutates a submitted task, and only one
/// worker holds a claim on it for any given attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Key into the agent registry.
    pub agent_type: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Ids of tasks in the same workflow that must complete first.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    /// Deadline for a single execution attempt.
    pub timeout: Duration,
    /// Agent output; set only once the task is Completed.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Failure message; set only once the task is Failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Message of the most recent failed attempt, kept across retries.
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: impl Into<TaskId>,
        name: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            agent_type: agent_type.into(),
            parameters: HashMap::new(),
            dependencies: vec![],
            status: TaskStatus::Pending,
            priority: Priority::Normal,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            result: None,
            error: None,
            last_error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_params(mut self, params: HashMap<String, serde_json::Value>) -> Self {
        self.parameters.extend(params);
        self
    }

    /// Add a dependency; duplicates are ignored.
    pub fn depends_on(mut self, dependency: impl Into<TaskId>) -> Self {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Claim the task for an execution attempt.
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.started_at = Some(now);
        self.error = None;
    }

    pub fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
    }

    /// Record a permanent failure.
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        let error = error.into();
        self.status = TaskStatus::Failed;
        self.last_error = Some(error.clone());
        self.error = Some(error);
        self.completed_at = Some(now);
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(now);
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Apply the retry policy after a failed attempt.
    ///
    /// Returns the new retry count when another attempt is allowed, leaving
    /// the task Retrying. Otherwise the task becomes Failed and `None` is
    /// returned.
    pub fn record_attempt_failure(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<u32> {
        let error = error.into();
        if self.can_retry() {
            self.retry_count += 1;
            self.status = TaskStatus::Retrying;
            self.error = None;
            self.last_error = Some(error);
            Some(self.retry_count)
        } else {
            self.mark_failed(error, now);
            None
        }
    }

    /// Return a Retrying task to Pending once its backoff elapsed.
    ///
    /// Returns false if the task left Retrying in the meantime (for example
    /// because its workflow was cancelled).
    pub fn release_for_retry(&mut self) -> bool {
        if self.status == TaskStatus::Retrying {
            self.status = TaskStatus::Pending;
            true
        } else {
            false
        }
    }
}
