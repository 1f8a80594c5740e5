use std::time::{Duration, Instant};

use serde_json::json;
use tokio::time::timeout;

use goalflow_core::event::WorkflowEvent;
use goalflow_core::task::{Task, TaskStatus};
use goalflow_core::types::{Priority, TaskId, WorkflowId};
use goalflow_core::workflow::{Workflow, WorkflowStatus};
use goalflow_engine::{AgentRegistry, Orchestrator};
use goalflow_test_utils::{
    chain_workflow, fast_config, independent_workflow, single_task_workflow, test_goal,
    ConcurrencyTracker, ContextWriter, EagerPanicAgent, EchoAgent, ScriptedAgent, SlowAgent,
};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

async fn started(workers: usize, registry: AgentRegistry) -> Orchestrator {
    let orch = Orchestrator::new(fast_config(workers), registry);
    orch.start().await;
    orch
}

async fn wait(orch: &Orchestrator, id: &WorkflowId) -> WorkflowStatus {
    timeout(SETTLE_TIMEOUT, orch.wait_for_workflow(id))
        .await
        .expect("workflow settled in time")
        .expect("workflow registered")
}

async fn run_to_end(orch: &Orchestrator, workflow: Workflow) -> (WorkflowStatus, Workflow) {
    let id = orch.submit_workflow(workflow).await.unwrap();
    let status = wait(orch, &id).await;
    (status, orch.workflow(&id).await.unwrap())
}

/// Base delay of 500ms, so the first retry waits 1s.
async fn started_with_slow_backoff(workers: usize, registry: AgentRegistry) -> Orchestrator {
    let mut config = fast_config(workers);
    config.retry.base_delay_ms = 500;
    let orch = Orchestrator::new(config, registry);
    orch.start().await;
    orch
}

async fn task_status(orch: &Orchestrator, id: &WorkflowId, task_id: &str) -> TaskStatus {
    let wf = orch.workflow(id).await.unwrap();
    task(&wf, task_id).status
}

fn task<'a>(wf: &'a Workflow, id: &str) -> &'a Task {
    wf.task(&TaskId::from(id)).expect("task exists")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_linear_chain_runs_in_order() {
    let orch = started(4, AgentRegistry::new().with(EchoAgent::new("echo"))).await;

    let (status, wf) = run_to_end(&orch, chain_workflow("echo", 3)).await;

    assert_eq!(status, WorkflowStatus::Completed);
    let (a, b, c) = (task(&wf, "t1"), task(&wf, "t2"), task(&wf, "t3"));
    assert!(a.completed_at.unwrap() <= b.started_at.unwrap());
    assert!(b.started_at.unwrap() <= b.completed_at.unwrap());
    assert!(b.completed_at.unwrap() <= c.started_at.unwrap());
    assert!(wf.completed_at.is_some());
    assert_eq!(c.result.as_ref().unwrap(), &json!({}));
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flaky_task_retries_with_backoff() {
    let agent = ScriptedAgent::new("flaky", 2);
    let orch = started(2, AgentRegistry::new().with(agent.clone())).await;

    let begin = Instant::now();
    let (status, wf) = run_to_end(&orch, single_task_workflow("flaky")).await;
    let elapsed = begin.elapsed();

    assert_eq!(status, WorkflowStatus::Completed);
    let only = task(&wf, "only");
    assert_eq!(only.status, TaskStatus::Completed);
    assert_eq!(only.retry_count, 2);
    assert_eq!(only.error, None);
    assert_eq!(only.last_error.as_deref(), Some("scripted failure 2"));
    assert_eq!(agent.calls(), 3);
    // base 50ms: 50*2 + 50*4
    assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exhausted_retries_fail_workflow() {
    let agent = ScriptedAgent::always_failing("broken");
    let registry = AgentRegistry::new()
        .with(agent.clone())
        .with(EchoAgent::new("echo"));
    let orch = started(2, registry).await;

    let wf = Workflow::new("doomed", "", test_goal(), "u")
        .with_task(Task::new("a", "A", "broken").with_max_retries(1))
        .with_task(Task::new("b", "B", "echo").depends_on("a"));
    let id = wf.id.clone();
    let (status, wf) = run_to_end(&orch, wf).await;

    assert_eq!(status, WorkflowStatus::Failed);
    let a = task(&wf, "a");
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(a.retry_count, 1);
    assert_eq!(a.error.as_deref(), Some("scripted failure 2"));
    assert_eq!(agent.calls(), 2);
    // the dependent never ran
    assert_eq!(task(&wf, "b").status, TaskStatus::Pending);

    let report = orch.get_workflow_status(&id).await.unwrap();
    assert_eq!(report.progress.failed, 1);
    assert_eq!(report.progress.pending, 1);
    assert_eq!(orch.queued_tasks(), 0);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unregistered_agent_fails_without_retry() {
    let orch = started(2, AgentRegistry::new()).await;

    let (status, wf) = run_to_end(&orch, single_task_workflow("ghost")).await;

    assert_eq!(status, WorkflowStatus::Failed);
    let only = task(&wf, "only");
    assert_eq!(only.status, TaskStatus::Failed);
    assert_eq!(only.retry_count, 0);
    assert_eq!(only.error.as_deref(), Some("agent not available"));
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_tasks_run_concurrently() {
    let tracker = ConcurrencyTracker::new("tracker", Duration::from_millis(200));
    let orch = started(2, AgentRegistry::new().with(tracker.clone())).await;

    let (status, _) = run_to_end(&orch, independent_workflow("tracker", 2)).await;

    assert_eq!(status, WorkflowStatus::Completed);
    assert!(tracker.max_concurrent() >= 2, "peak {}", tracker.max_concurrent());
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resubmission_does_not_duplicate_work() {
    let agent = ScriptedAgent::new("counted", 0);
    let orch = started(4, AgentRegistry::new().with(agent.clone())).await;

    let wf = chain_workflow("counted", 3);
    let copy = wf.clone();
    let id = orch.submit_workflow(wf).await.unwrap();
    assert_eq!(orch.submit_workflow(copy.clone()).await.unwrap(), id);

    assert_eq!(wait(&orch, &id).await, WorkflowStatus::Completed);
    // a late resubmission leaves the finished workflow untouched
    assert_eq!(orch.submit_workflow(copy).await.unwrap(), id);
    assert_eq!(
        orch.get_workflow_status(&id).await.unwrap().status,
        WorkflowStatus::Completed
    );
    assert_eq!(agent.calls(), 3);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_counts_always_sum_to_total() {
    let orch = started(
        2,
        AgentRegistry::new().with(SlowAgent::new("slow", Duration::from_millis(30))),
    )
    .await;
    let id = orch
        .submit_workflow(independent_workflow("slow", 6))
        .await
        .unwrap();

    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        let report = orch.get_workflow_status(&id).await.unwrap();
        let p = &report.progress;
        assert_eq!(
            p.total,
            p.completed + p.failed + p.pending + p.running + p.retrying + p.cancelled
        );
        assert_eq!(p.total, 6);
        if report.status.is_terminal() {
            assert_eq!(p.completed, 6);
            assert!((p.percent - 100.0).abs() < f64::EPSILON);
            break;
        }
        assert!(Instant::now() < deadline, "workflow never settled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_is_recorded() {
    let orch = started(
        2,
        AgentRegistry::new().with(SlowAgent::new("slow", Duration::from_secs(5))),
    )
    .await;
    let wf = Workflow::new("deadline", "", test_goal(), "u").with_task(
        Task::new("only", "Only", "slow")
            .with_timeout(Duration::from_millis(100))
            .with_max_retries(0),
    );

    let (status, wf) = run_to_end(&orch, wf).await;

    assert_eq!(status, WorkflowStatus::Failed);
    assert_eq!(task(&wf, "only").error.as_deref(), Some("timeout"));
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_lets_running_attempt_finish() {
    let orch = started(
        2,
        AgentRegistry::new().with(SlowAgent::new("slow", Duration::from_millis(300))),
    )
    .await;
    let mut events = orch.subscribe();
    let id = orch.submit_workflow(chain_workflow("slow", 3)).await.unwrap();

    // wait until t1 is in flight
    timeout(SETTLE_TIMEOUT, async {
        loop {
            if let Ok(WorkflowEvent::TaskStarted { .. }) = events.recv().await {
                break;
            }
        }
    })
    .await
    .expect("first task started");

    assert!(orch.cancel_workflow(&id).await.unwrap());
    assert_eq!(wait(&orch, &id).await, WorkflowStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let wf = orch.workflow(&id).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Cancelled);
    assert_eq!(task(&wf, "t1").status, TaskStatus::Completed);
    assert_eq!(task(&wf, "t2").status, TaskStatus::Cancelled);
    assert_eq!(task(&wf, "t3").status, TaskStatus::Cancelled);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pause_and_resume() {
    let orch = started(
        2,
        AgentRegistry::new().with(SlowAgent::new("slow", Duration::from_millis(100))),
    )
    .await;
    let id = orch.submit_workflow(chain_workflow("slow", 2)).await.unwrap();
    orch.pause_workflow(&id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let wf = orch.workflow(&id).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Paused);
    assert_eq!(task(&wf, "t2").status, TaskStatus::Pending);

    orch.resume_workflow(&id).await.unwrap();
    assert_eq!(wait(&orch, &id).await, WorkflowStatus::Completed);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_higher_priority_dispatched_first() {
    let orch = started(1, AgentRegistry::new().with(EchoAgent::new("echo"))).await;
    let mut events = orch.subscribe();

    let wf = Workflow::new("prio", "", test_goal(), "u")
        .with_task(Task::new("low", "Low", "echo").with_priority(Priority::Low))
        .with_task(Task::new("critical", "Critical", "echo").with_priority(Priority::Critical))
        .with_task(Task::new("high", "High", "echo").with_priority(Priority::High));
    let id = orch.submit_workflow(wf).await.unwrap();
    assert_eq!(wait(&orch, &id).await, WorkflowStatus::Completed);

    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WorkflowEvent::TaskStarted { task_id, .. } = event {
            order.push(task_id.to_string());
        }
    }
    assert_eq!(order, vec!["critical", "high", "low"]);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tasks_share_workflow_context() {
    let orch = started(2, AgentRegistry::new().with(ContextWriter::new("ctx"))).await;

    let wf = Workflow::new("ctx", "", test_goal(), "u")
        .with_task(
            Task::new("quote", "Quote", "ctx")
                .with_param("key", json!("price"))
                .with_param("value", json!(1820.5)),
        )
        .with_task(
            Task::new("size", "Size", "ctx")
                .depends_on("quote")
                .with_param("key", json!("size"))
                .with_param("value", json!(2)),
        );
    let (status, wf) = run_to_end(&orch, wf).await;

    assert_eq!(status, WorkflowStatus::Completed);
    assert_eq!(wf.context.get("price"), Some(json!(1820.5)));
    assert_eq!(wf.context.get("size"), Some(json!(2)));
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_event_stream_for_workflow() {
    let orch = started(2, AgentRegistry::new().with(EchoAgent::new("echo"))).await;
    let mut events = orch.subscribe();

    let id = orch.submit_workflow(chain_workflow("echo", 2)).await.unwrap();
    assert_eq!(wait(&orch, &id).await, WorkflowStatus::Completed);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.workflow_id(), &id);
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(WorkflowEvent::WorkflowSubmitted { .. })));
    assert!(matches!(
        seen.last(),
        Some(WorkflowEvent::WorkflowFinished {
            status: WorkflowStatus::Completed,
            ..
        })
    ));
    let completed = seen
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::TaskCompleted { .. }))
        .count();
    assert_eq!(completed, 2);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_template_workflow_end_to_end() {
    let mut registry = AgentRegistry::new();
    for agent_type in [
        "price_monitor",
        "market_analyzer",
        "trade_executor",
        "reporter",
    ] {
        registry.register(EchoAgent::new(agent_type));
    }
    let orch = started(4, registry).await;

    let id = orch
        .create_workflow(
            "eth-arb",
            "desk test",
            "Capture arbitrage between DEXes",
            "profit_usd",
            100.0,
            "alice",
        )
        .await
        .unwrap();
    assert!(orch.start_workflow(&id).await);
    assert_eq!(wait(&orch, &id).await, WorkflowStatus::Completed);

    let report = orch.get_workflow_status(&id).await.unwrap();
    assert_eq!(report.progress.completed, 4);
    assert_eq!(report.user_id, "alice");
    assert_eq!(report.goal.target_metric, "profit_usd");
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_agent_panicking_before_future_fails_task() {
    let registry = AgentRegistry::new()
        .with(EagerPanicAgent::new("eager"))
        .with(EchoAgent::new("echo"));
    let orch = started(1, registry).await;

    let wf = Workflow::new("eager", "", test_goal(), "u")
        .with_task(Task::new("only", "Only", "eager").with_max_retries(1));
    let (status, wf) = run_to_end(&orch, wf).await;

    assert_eq!(status, WorkflowStatus::Failed);
    let only = task(&wf, "only");
    assert_eq!(only.status, TaskStatus::Failed);
    assert_eq!(only.retry_count, 1);
    assert!(only.error.as_deref().unwrap().contains("panicked"));

    // the single worker survived and keeps dispatching
    let (status, _) = run_to_end(&orch, single_task_workflow("echo")).await;
    assert_eq!(status, WorkflowStatus::Completed);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backoff_does_not_hold_worker() {
    let registry = AgentRegistry::new()
        .with(ScriptedAgent::new("flaky", 1))
        .with(EchoAgent::new("echo"));
    let orch = started_with_slow_backoff(1, registry).await;

    let wf = Workflow::new("mixed", "", test_goal(), "u")
        .with_task(Task::new("flaky", "Flaky", "flaky").with_priority(Priority::Critical))
        .with_task(Task::new("other", "Other", "echo").with_priority(Priority::Low));
    let id = orch.submit_workflow(wf).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(task_status(&orch, &id, "flaky").await, TaskStatus::Retrying);
    assert_eq!(task_status(&orch, &id, "other").await, TaskStatus::Completed);

    assert_eq!(wait(&orch, &id).await, WorkflowStatus::Completed);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_releases_retrying_tasks() {
    let agent = ScriptedAgent::new("flaky", 1);
    let orch = started_with_slow_backoff(1, AgentRegistry::new().with(agent.clone())).await;
    let id = orch.submit_workflow(single_task_workflow("flaky")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(task_status(&orch, &id, "only").await, TaskStatus::Retrying);
    orch.stop().await;

    // the backoff timer was dropped with the pool
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(task_status(&orch, &id, "only").await, TaskStatus::Retrying);
    assert_eq!(agent.calls(), 1);

    orch.start().await;
    assert_eq!(wait(&orch, &id).await, WorkflowStatus::Completed);
    assert_eq!(agent.calls(), 2);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_released_while_paused_runs_on_resume() {
    let agent = ScriptedAgent::new("flaky", 1);
    let orch = started_with_slow_backoff(1, AgentRegistry::new().with(agent.clone())).await;
    let id = orch.submit_workflow(single_task_workflow("flaky")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(task_status(&orch, &id, "only").await, TaskStatus::Retrying);
    orch.pause_workflow(&id).await.unwrap();

    // backoff elapses while paused: released but not dispatched
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let wf = orch.workflow(&id).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Paused);
    assert_eq!(task(&wf, "only").status, TaskStatus::Pending);
    assert_eq!(agent.calls(), 1);
    assert_eq!(orch.queued_tasks(), 0);

    orch.resume_workflow(&id).await.unwrap();
    assert_eq!(wait(&orch, &id).await, WorkflowStatus::Completed);
    assert_eq!(agent.calls(), 2);
    orch.stop().await;
}
