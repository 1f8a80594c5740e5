use serde::{Deserialize, Serialize};

use crate::types::{TaskId, WorkflowId};
use crate::workflow::WorkflowStatus;

/// Lifecycle notifications published by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Workflow registered and its first ready tasks queued.
    WorkflowSubmitted { workflow_id: WorkflowId },
    /// A worker claimed a task and invoked its agent.
    TaskStarted {
        workflow_id: WorkflowId,
        task_id: TaskId,
        attempt: u32,
    },
    TaskCompleted {
        workflow_id: WorkflowId,
        task_id: TaskId,
    },
    /// An attempt failed and another one is scheduled.
    TaskRetrying {
        workflow_id: WorkflowId,
        task_id: TaskId,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    /// A task failed permanently.
    TaskFailed {
        workflow_id: WorkflowId,
        task_id: TaskId,
        error: String,
    },
    /// The workflow settled on its own: Completed, Failed, or Cancelled when a
    /// dependency was cancelled.
    WorkflowFinished {
        workflow_id: WorkflowId,
        status: WorkflowStatus,
    },
    WorkflowCancelled { workflow_id: WorkflowId },
    WorkflowPaused { workflow_id: WorkflowId },
    WorkflowResumed { workflow_id: WorkflowId },
}

impl WorkflowEvent {
    pub fn workflow_id(&self) -> &WorkflowId {
        match self {
            Self::WorkflowSubmitted { workflow_id }
            | Self::TaskStarted { workflow_id, .. }
            | Self::TaskCompleted { workflow_id, .. }
            | Self::TaskRetrying { workflow_id, .. }
            | Self::TaskFailed { workflow_id, .. }
            | Self::WorkflowFinished { workflow_id, .. }
            | Self::WorkflowCancelled { workflow_id }
            | Self::WorkflowPaused { workflow_id }
            | Self::WorkflowResumed { workflow_id } => workflow_id,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(WorkflowEvent::WorkflowSubmitted {
            workflow_id: WorkflowId::from_string("wf"),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(WorkflowEvent::WorkflowFinished {
            workflow_id: WorkflowId::from_string("wf"),
            status: WorkflowStatus::Completed,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.workflow_id().as_str(), "wf");
        assert!(matches!(
            event,
            WorkflowEvent::WorkflowFinished {
                status: WorkflowStatus::Completed,
                ..
            }
        ));
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = WorkflowEvent::TaskFailed {
            workflow_id: WorkflowId::from_string("wf"),
            task_id: TaskId::from("execute"),
            error: "timeout".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_failed");
        assert_eq!(json["error"], "timeout");
    }
}
