use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use goalflow_core::config::AppConfig;
use goalflow_core::context::WorkflowContext;
use goalflow_core::error::{GoalflowError, Result};
use goalflow_core::event::{EventBus, WorkflowEvent};
use goalflow_core::goal::Goal;
use goalflow_core::task::TaskStatus;
use goalflow_core::traits::{Agent, TaskParams};
use goalflow_core::types::WorkflowId;
use goalflow_core::workflow::{Workflow, WorkflowStatus};

use crate::queue::{QueuedTask, ReadyQueue};
use crate::registry::{execute_with_deadline, AgentRegistry};
use crate::retry::Backoff;
use crate::status::WorkflowStatusReport;
use crate::templates::{self, TemplateKind};

/// Error recorded on a task whose agent type has no registered agent.
const AGENT_NOT_AVAILABLE: &str = "agent not available";

/// Lifecycle of the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// State shared between the handle, the workers and retry timers.
struct Shared {
    config: AppConfig,
    registry: AgentRegistry,
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
    queue: ReadyQueue,
    backoff: Backoff,
    event_bus: Arc<EventBus>,
}

struct Lifecycle {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

/// Everything a worker needs to run one attempt outside the table lock.
struct Claim {
    agent: Arc<dyn Agent>,
    params: TaskParams,
    context: WorkflowContext,
    timeout: Duration,
}

/// Owns the active-workflow table, the ready-queue and a fixed worker pool.
///
/// The agent registry is moved in at construction and never changes
/// afterwards. All table mutations happen under one write lock; agent calls
/// run without it.
pub struct Orchestrator {
    shared: Arc<Shared>,
    state: StdRwLock<OrchestratorState>,
    lifecycle: Mutex<Lifecycle>,
}

impl Orchestrator {
    pub fn new(config: AppConfig, registry: AgentRegistry) -> Self {
        let event_bus = Arc::new(EventBus::new(config.orchestrator.event_capacity.max(1)));
        let backoff = Backoff::new(&config.retry);
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                workflows: RwLock::new(HashMap::new()),
                queue: ReadyQueue::new(),
                backoff,
                event_bus,
            }),
            state: StdRwLock::new(OrchestratorState::Stopped),
            lifecycle: Mutex::new(Lifecycle {
                cancel: CancellationToken::new(),
                workers: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: OrchestratorState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn config(&self) -> &AppConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.shared.registry
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.shared.event_bus)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.shared.event_bus.subscribe()
    }

    /// Number of (workflow, task) pairs waiting for a worker.
    pub fn queued_tasks(&self) -> usize {
        self.shared.queue.len()
    }

    /// Spawn the worker pool. No-op when already running.
    ///
    /// Tasks left Retrying by an earlier `stop()` are released and every
    /// ready task of a running workflow is queued again.
    pub async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.workers.is_empty() {
            debug!("Orchestrator already running");
            return;
        }
        self.set_state(OrchestratorState::Starting);

        self.shared.recover().await;

        let cancel = CancellationToken::new();
        let workers = self.shared.config.orchestrator.workers.max(1);
        for worker_id in 0..workers {
            let shared = Arc::clone(&self.shared);
            let cancel = cancel.clone();
            lifecycle
                .workers
                .push(tokio::spawn(shared.worker_loop(worker_id, cancel)));
        }
        lifecycle.cancel = cancel;

        self.set_state(OrchestratorState::Running);
        info!(workers, "Orchestrator started");
    }

    /// Signal the workers, wait for their current attempts to finish and
    /// for them to exit. No-op when already stopped.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.workers.is_empty() {
            debug!("Orchestrator already stopped");
            return;
        }
        self.set_state(OrchestratorState::Stopping);

        lifecycle.cancel.cancel();
        for handle in lifecycle.workers.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker ended abnormally");
            }
        }

        self.set_state(OrchestratorState::Stopped);
        info!("Orchestrator stopped");
    }

    /// Register a workflow, mark it Running and queue its ready tasks.
    ///
    /// Re-submitting an id that is already registered returns that id and
    /// changes nothing.
    pub async fn submit_workflow(&self, mut workflow: Workflow) -> Result<WorkflowId> {
        workflow.validate()?;
        let id = workflow.id.clone();

        let mut workflows = self.shared.workflows.write().await;
        if workflows.contains_key(&id) {
            debug!(workflow_id = %id, "Workflow already registered, ignoring resubmission");
            return Ok(id);
        }

        self.shared.warn_missing_agents(&workflow);
        self.shared.activate(&mut workflow);
        workflows.insert(id.clone(), workflow);
        Ok(id)
    }

    /// Register a workflow in status Created without starting it.
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<WorkflowId> {
        workflow.validate()?;
        let id = workflow.id.clone();

        let mut workflows = self.shared.workflows.write().await;
        if workflows.contains_key(&id) {
            debug!(workflow_id = %id, "Workflow already registered");
            return Ok(id);
        }

        self.shared.warn_missing_agents(&workflow);
        debug!(workflow_id = %id, tasks = workflow.tasks.len(), "Workflow registered");
        workflows.insert(id.clone(), workflow);
        Ok(id)
    }

    /// Build a workflow from a goal using the template its metric and
    /// description point to, and register it in status Created.
    pub async fn create_workflow(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        goal_description: impl Into<String>,
        target_metric: impl Into<String>,
        target_value: f64,
        user_id: &str,
    ) -> Result<WorkflowId> {
        let goal = Goal::new(goal_description, target_metric, target_value);
        let kind = TemplateKind::infer(&goal);
        self.create_from_template(kind, goal, name, description, user_id)
            .await
    }

    /// Build a workflow from an explicit template and register it in status
    /// Created.
    pub async fn create_from_template(
        &self,
        kind: TemplateKind,
        goal: Goal,
        name: impl Into<String>,
        description: impl Into<String>,
        user_id: &str,
    ) -> Result<WorkflowId> {
        let mut workflow = templates::build(kind, goal, user_id, &self.shared.config.tasks);
        workflow.name = name.into();
        workflow.description = description.into();
        info!(workflow_id = %workflow.id, template = %kind, "Workflow created from template");
        self.register_workflow(workflow).await
    }

    /// Start a workflow that is still Created. Returns false if it is
    /// unknown or already started.
    pub async fn start_workflow(&self, id: &WorkflowId) -> bool {
        let mut workflows = self.shared.workflows.write().await;
        let Some(workflow) = workflows.get_mut(id) else {
            warn!(workflow_id = %id, "Cannot start unknown workflow");
            return false;
        };
        if workflow.status != WorkflowStatus::Created {
            debug!(workflow_id = %id, status = %workflow.status, "Workflow already started");
            return false;
        }
        self.shared.activate(workflow);
        true
    }

    pub async fn get_workflow_status(&self, id: &WorkflowId) -> Option<WorkflowStatusReport> {
        let workflows = self.shared.workflows.read().await;
        workflows.get(id).map(WorkflowStatusReport::from)
    }

    /// Status reports for every registered workflow, oldest first.
    pub async fn list_workflows(&self) -> Vec<WorkflowStatusReport> {
        let workflows = self.shared.workflows.read().await;
        let mut reports: Vec<WorkflowStatusReport> =
            workflows.values().map(WorkflowStatusReport::from).collect();
        reports.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        reports
    }

    /// Snapshot of a workflow, including task results.
    pub async fn workflow(&self, id: &WorkflowId) -> Option<Workflow> {
        self.shared.workflows.read().await.get(id).cloned()
    }

    /// Remove a finished workflow from the table.
    ///
    /// Returns false, leaving the workflow in place, if it is not terminal.
    pub async fn evict_workflow(&self, id: &WorkflowId) -> Result<bool> {
        let mut workflows = self.shared.workflows.write().await;
        let status = workflows
            .get(id)
            .map(|w| w.status)
            .ok_or_else(|| GoalflowError::WorkflowNotFound(id.to_string()))?;
        if !status.is_terminal() {
            return Ok(false);
        }
        workflows.remove(id);
        debug!(workflow_id = %id, "Workflow evicted");
        Ok(true)
    }

    /// Cancel every task that has not started yet and mark the workflow
    /// Cancelled. Attempts already running finish on their own.
    ///
    /// Returns false if the workflow had already finished.
    pub async fn cancel_workflow(&self, id: &WorkflowId) -> Result<bool> {
        let mut workflows = self.shared.workflows.write().await;
        let workflow = workflows
            .get_mut(id)
            .ok_or_else(|| GoalflowError::WorkflowNotFound(id.to_string()))?;
        if workflow.status.is_terminal() {
            return Ok(false);
        }

        let now = Utc::now();
        for task in workflow
            .tasks
            .iter_mut()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Retrying))
        {
            task.mark_cancelled(now);
        }
        workflow.status = WorkflowStatus::Cancelled;
        workflow.completed_at = Some(now);

        let dropped = self.shared.queue.remove_workflow(id);
        info!(workflow_id = %id, dropped, "Workflow cancelled");
        self.shared
            .event_bus
            .publish(WorkflowEvent::WorkflowCancelled {
                workflow_id: id.clone(),
            });
        Ok(true)
    }

    /// Stop dispatching a running workflow's tasks. In-flight attempts
    /// finish normally.
    pub async fn pause_workflow(&self, id: &WorkflowId) -> Result<()> {
        let mut workflows = self.shared.workflows.write().await;
        let workflow = workflows
            .get_mut(id)
            .ok_or_else(|| GoalflowError::WorkflowNotFound(id.to_string()))?;
        if workflow.status != WorkflowStatus::Running {
            return Err(invalid_transition(workflow, WorkflowStatus::Paused));
        }

        workflow.status = WorkflowStatus::Paused;
        let dropped = self.shared.queue.remove_workflow(id);
        info!(workflow_id = %id, dropped, "Workflow paused");
        self.shared.event_bus.publish(WorkflowEvent::WorkflowPaused {
            workflow_id: id.clone(),
        });
        Ok(())
    }

    /// Resume a paused workflow and queue its ready tasks again.
    pub async fn resume_workflow(&self, id: &WorkflowId) -> Result<()> {
        let mut workflows = self.shared.workflows.write().await;
        let workflow = workflows
            .get_mut(id)
            .ok_or_else(|| GoalflowError::WorkflowNotFound(id.to_string()))?;
        if workflow.status != WorkflowStatus::Paused {
            return Err(invalid_transition(workflow, WorkflowStatus::Running));
        }

        workflow.status = WorkflowStatus::Running;
        let queued = self.shared.enqueue_ready(workflow);
        info!(workflow_id = %id, queued, "Workflow resumed");
        self.shared.event_bus.publish(WorkflowEvent::WorkflowResumed {
            workflow_id: id.clone(),
        });
        self.shared.finalize_if_settled(workflow);
        Ok(())
    }

    /// Wait until the workflow reaches a terminal status and return it.
    pub async fn wait_for_workflow(&self, id: &WorkflowId) -> Result<WorkflowStatus> {
        // Subscribe before the first check so no transition slips between.
        let mut rx = self.shared.event_bus.subscribe();
        loop {
            let status = self.current_status(id).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            if let Err(RecvError::Closed) = rx.recv().await {
                return self.current_status(id).await;
            }
        }
    }

    async fn current_status(&self, id: &WorkflowId) -> Result<WorkflowStatus> {
        self.shared
            .workflows
            .read()
            .await
            .get(id)
            .map(|w| w.status)
            .ok_or_else(|| GoalflowError::WorkflowNotFound(id.to_string()))
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.lifecycle.get_mut().cancel.cancel();
    }
}

fn invalid_transition(workflow: &Workflow, to: WorkflowStatus) -> GoalflowError {
    GoalflowError::InvalidTransition {
        workflow_id: workflow.id.to_string(),
        from: workflow.status.to_string(),
        to: to.to_string(),
    }
}

/// Text recorded on a task for a failed attempt.
fn failure_message(err: &GoalflowError) -> String {
    match err {
        GoalflowError::AgentTimeout { .. } => "timeout".to_string(),
        GoalflowError::Agent(msg) => msg.clone(),
        other => other.to_string(),
    }
}

impl Shared {
    async fn worker_loop(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        debug!(worker_id, "Worker started");
        let poll = self.config.orchestrator.poll_interval();

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = self.queue.pop(poll) => item,
            };
            if let Some(item) = item {
                self.process(worker_id, item, &cancel).await;
            }
        }

        debug!(worker_id, "Worker exiting");
    }

    /// Run one attempt of a queued task and record its outcome.
    async fn process(self: &Arc<Self>, worker_id: usize, item: QueuedTask, cancel: &CancellationToken) {
        let claim = {
            let mut workflows = self.workflows.write().await;
            self.claim(&mut workflows, &item)
        };
        let Some(claim) = claim else {
            return;
        };

        debug!(
            worker_id,
            workflow_id = %item.workflow_id,
            task_id = %item.task_id,
            "Dispatching task"
        );
        let outcome =
            execute_with_deadline(&claim.agent, claim.params, claim.context, claim.timeout).await;
        self.settle(item, outcome, cancel).await;
    }

    /// Move a queued task to Running if it may run now.
    ///
    /// Stale queue entries (unknown ids, tasks no longer Pending, workflows
    /// not Running) are skipped. A task whose agent type has no registered
    /// agent fails here without an attempt.
    fn claim(&self, workflows: &mut HashMap<WorkflowId, Workflow>, item: &QueuedTask) -> Option<Claim> {
        let Some(workflow) = workflows.get_mut(&item.workflow_id) else {
            warn!(workflow_id = %item.workflow_id, task_id = %item.task_id, "Queued task references unknown workflow");
            return None;
        };
        if workflow.status != WorkflowStatus::Running {
            debug!(workflow_id = %item.workflow_id, status = %workflow.status, "Workflow not running, dropping queued task");
            return None;
        }
        let Some(task) = workflow.task(&item.task_id) else {
            warn!(workflow_id = %item.workflow_id, task_id = %item.task_id, "Queued task not found in workflow");
            return None;
        };
        if task.status != TaskStatus::Pending {
            debug!(task_id = %item.task_id, status = %task.status, "Task no longer pending, skipping");
            return None;
        }
        if !workflow.dependencies_met(task) {
            warn!(workflow_id = %item.workflow_id, task_id = %item.task_id, "Queued task has unmet dependencies");
            return None;
        }

        let agent_type = task.agent_type.clone();
        let now = Utc::now();
        let agent = match self.registry.require(&agent_type) {
            Ok(agent) => agent,
            Err(e) => {
                if let Some(task) = workflow.task_mut(&item.task_id) {
                    task.mark_failed(AGENT_NOT_AVAILABLE, now);
                }
                error!(
                    workflow_id = %item.workflow_id,
                    task_id = %item.task_id,
                    error = %e,
                    "No agent registered for task"
                );
                self.event_bus.publish(WorkflowEvent::TaskFailed {
                    workflow_id: item.workflow_id.clone(),
                    task_id: item.task_id.clone(),
                    error: AGENT_NOT_AVAILABLE.to_string(),
                });
                self.finalize_if_settled(workflow);
                return None;
            }
        };

        let context = workflow.context.clone();
        let task = workflow.task_mut(&item.task_id)?;
        task.mark_running(now);
        let attempt = task.retry_count + 1;
        let claim = Claim {
            agent,
            params: task.parameters.clone(),
            context,
            timeout: task.timeout,
        };

        self.event_bus.publish(WorkflowEvent::TaskStarted {
            workflow_id: item.workflow_id.clone(),
            task_id: item.task_id.clone(),
            attempt,
        });
        Some(claim)
    }

    /// Record the outcome of an attempt and apply the retry policy.
    async fn settle(
        self: &Arc<Self>,
        item: QueuedTask,
        outcome: Result<serde_json::Value>,
        cancel: &CancellationToken,
    ) {
        let mut workflows = self.workflows.write().await;
        let Some(workflow) = workflows.get_mut(&item.workflow_id) else {
            warn!(workflow_id = %item.workflow_id, "Workflow evicted while task was running");
            return;
        };
        let workflow_status = workflow.status;
        let Some(task) = workflow.task_mut(&item.task_id) else {
            warn!(workflow_id = %item.workflow_id, task_id = %item.task_id, "Task vanished while running");
            return;
        };
        let now = Utc::now();

        match outcome {
            Ok(result) => {
                task.mark_completed(result, now);
                debug!(workflow_id = %item.workflow_id, task_id = %item.task_id, "Task completed");
                self.event_bus.publish(WorkflowEvent::TaskCompleted {
                    workflow_id: item.workflow_id.clone(),
                    task_id: item.task_id.clone(),
                });
                if workflow.status == WorkflowStatus::Running {
                    self.enqueue_ready(workflow);
                }
                self.finalize_if_settled(workflow);
            }
            Err(e) => {
                let message = failure_message(&e);

                // The workflow was cancelled mid-attempt: record, never retry.
                if workflow_status.is_terminal() {
                    task.mark_failed(message, now);
                    return;
                }

                match task.record_attempt_failure(message.clone(), now) {
                    Some(retry_count) => {
                        let delay = self.backoff.delay_for(retry_count);
                        warn!(
                            workflow_id = %item.workflow_id,
                            task_id = %item.task_id,
                            attempt = retry_count,
                            backoff_ms = delay.as_millis() as u64,
                            error = %message,
                            "Task attempt failed, retrying"
                        );
                        self.event_bus.publish(WorkflowEvent::TaskRetrying {
                            workflow_id: item.workflow_id.clone(),
                            task_id: item.task_id.clone(),
                            attempt: retry_count + 1,
                            backoff_ms: delay.as_millis() as u64,
                            error: message,
                        });
                        drop(workflows);
                        self.schedule_retry(item, delay, cancel.clone());
                    }
                    None => {
                        error!(
                            workflow_id = %item.workflow_id,
                            task_id = %item.task_id,
                            error = %message,
                            "Task failed permanently"
                        );
                        self.event_bus.publish(WorkflowEvent::TaskFailed {
                            workflow_id: item.workflow_id.clone(),
                            task_id: item.task_id.clone(),
                            error: message,
                        });
                        self.finalize_if_settled(workflow);
                    }
                }
            }
        }
    }

    /// Release a Retrying task once its backoff elapsed. The worker that
    /// ran the failed attempt is already free.
    fn schedule_retry(self: &Arc<Self>, item: QueuedTask, delay: Duration, cancel: CancellationToken) {
        let shared = Arc::clone(self);
        let task_id = item.task_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => shared.release_retry(item).await,
                _ = cancel.cancelled() => {
                    debug!(task_id = %task_id, "Retry timer dropped on shutdown");
                }
            }
        });
    }

    async fn release_retry(&self, item: QueuedTask) {
        let mut workflows = self.workflows.write().await;
        let Some(workflow) = workflows.get_mut(&item.workflow_id) else {
            return;
        };
        let released = workflow
            .task_mut(&item.task_id)
            .map(|t| t.release_for_retry())
            .unwrap_or(false);
        if released && workflow.status == WorkflowStatus::Running {
            debug!(workflow_id = %item.workflow_id, task_id = %item.task_id, "Re-queueing task after backoff");
            self.queue.push(item);
        }
    }

    /// Queue every ready task of `workflow`, highest priority first.
    fn enqueue_ready(&self, workflow: &Workflow) -> usize {
        let mut queued = 0;
        for task in workflow.get_ready_tasks() {
            if self
                .queue
                .push(QueuedTask::new(workflow.id.clone(), task.id.clone()))
            {
                debug!(workflow_id = %workflow.id, task_id = %task.id, "Task queued");
                queued += 1;
            }
        }
        queued
    }

    /// Mark a workflow Running and queue its entry tasks.
    fn activate(&self, workflow: &mut Workflow) {
        let now = Utc::now();
        if workflow.goal.is_overdue(now) {
            warn!(workflow_id = %workflow.id, "Goal deadline already passed");
        }
        workflow.status = WorkflowStatus::Running;
        workflow.started_at = Some(now);
        let queued = self.enqueue_ready(workflow);

        info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            tasks = workflow.tasks.len(),
            queued,
            "Workflow submitted"
        );
        self.event_bus.publish(WorkflowEvent::WorkflowSubmitted {
            workflow_id: workflow.id.clone(),
        });
        self.finalize_if_settled(workflow);
    }

    /// Resolve a running workflow once nothing can make progress.
    fn finalize_if_settled(&self, workflow: &mut Workflow) {
        if workflow.status != WorkflowStatus::Running {
            return;
        }
        let Some(status) = workflow.settled_status() else {
            return;
        };

        workflow.status = status;
        workflow.completed_at = Some(Utc::now());
        let progress = workflow.progress();
        info!(
            workflow_id = %workflow.id,
            status = %status,
            completed = progress.completed,
            failed = progress.failed,
            "Workflow finished"
        );
        self.event_bus.publish(WorkflowEvent::WorkflowFinished {
            workflow_id: workflow.id.clone(),
            status,
        });
    }

    /// Re-arm running workflows after a restart of the worker pool.
    async fn recover(&self) {
        let mut workflows = self.workflows.write().await;
        for workflow in workflows.values_mut() {
            if workflow.status != WorkflowStatus::Running {
                continue;
            }
            let released = workflow
                .tasks
                .iter_mut()
                .map(|t| t.release_for_retry())
                .filter(|released| *released)
                .count();
            let queued = self.enqueue_ready(workflow);
            if released > 0 || queued > 0 {
                debug!(workflow_id = %workflow.id, released, queued, "Recovered workflow");
            }
        }
    }

    fn warn_missing_agents(&self, workflow: &Workflow) {
        let missing = self.registry.missing_for(workflow);
        if !missing.is_empty() {
            warn!(workflow_id = %workflow.id, missing = ?missing, "No agent registered for some task types");
        }
    }
}
