use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Priority;

/// The objective a workflow is constructed to achieve.
///
/// Goals are immutable once a workflow has been built from them; the builder
/// methods consume `self` so a goal is fully described before it is handed
/// to a template or a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    /// Opaque identifier.
    pub id: String,
    /// Human-readable description of the objective.
    pub description: String,
    /// Metric the workflow optimises (e.g. "profit_usd", "apy").
    pub target_metric: String,
    /// Value of `target_metric` that counts as success.
    pub target_value: f64,
    /// Template- and agent-specific constraints.
    #[serde(default)]
    pub constraints: HashMap<String, serde_json::Value>,
    /// Optional deadline.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: Priority,
}

impl Goal {
    pub fn new(
        description: impl Into<String>,
        target_metric: impl Into<String>,
        target_value: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            target_metric: target_metric.into(),
            target_value,
            constraints: HashMap::new(),
            deadline: None,
            priority: Priority::Normal,
        }
    }

    /// Add a single constraint.
    pub fn with_constraint(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.constraints.insert(key.into(), value);
        self
    }

    /// Replace all constraints.
    pub fn with_constraints(mut self, constraints: HashMap<String, serde_json::Value>) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Numeric constraint, or `default` when absent or not a number.
    pub fn constraint_f64(&self, key: &str, default: f64) -> f64 {
        self.constraints
            .get(key)
            .and_then(|v| v.as_f64())
            .unwrap_or(default)
    }

    /// String constraint, or `default` when absent or not a string.
    pub fn constraint_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.constraints
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or(default)
    }

    /// String-list constraint, or `default` when absent.
    ///
    /// A bare string is accepted as a one-element list.
    pub fn constraint_list(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.constraints.get(key) {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            _ => default.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Whether the deadline (if any) has passed at `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| now > d)
    }
}
