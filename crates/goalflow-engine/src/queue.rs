use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use goalflow_core::types::{TaskId, WorkflowId};

/// A (workflow, task) pair waiting for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueuedTask {
    pub workflow_id: WorkflowId,
    pub task_id: TaskId,
}

impl QueuedTask {
    pub fn new(workflow_id: WorkflowId, task_id: TaskId) -> Self {
        Self {
            workflow_id,
            task_id,
        }
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueuedTask>,
    queued: HashSet<QueuedTask>,
}

/// Shared FIFO of ready tasks.
///
/// A pair is held at most once; pushing a pair that is already waiting is a
/// no-op. Ordering is plain FIFO: a higher-priority task pushed later does
/// not overtake lower-priority work already queued.
#[derive(Default)]
pub struct ReadyQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a pair. Returns false if it was already waiting.
    pub fn push(&self, item: QueuedTask) -> bool {
        {
            let mut state = self.lock();
            if !state.queued.insert(item.clone()) {
                return false;
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<QueuedTask> {
        let mut state = self.lock();
        let item = state.items.pop_front()?;
        state.queued.remove(&item);
        Some(item)
    }

    /// Pop the next pair, waiting at most `poll` for one to arrive.
    ///
    /// Cancel-safe: an item is only removed in a synchronous section that
    /// returns it.
    pub async fn pop(&self, poll: Duration) -> Option<QueuedTask> {
        if let Some(item) = self.try_pop() {
            return Some(item);
        }
        let _ = tokio::time::timeout(poll, self.notify.notified()).await;
        self.try_pop()
    }

    pub fn contains(&self, item: &QueuedTask) -> bool {
        self.lock().queued.contains(item)
    }

    /// Drop every waiting pair of one workflow, returning how many went.
    pub fn remove_workflow(&self, workflow_id: &WorkflowId) -> usize {
        let mut state = self.lock();
        let before = state.items.len();
        state.items.retain(|i| &i.workflow_id != workflow_id);
        state.queued.retain(|i| &i.workflow_id != workflow_id);
        before - state.items.len()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn item(wf: &str, task: &str) -> QueuedTask {
        QueuedTask::new(WorkflowId::from_string(wf), TaskId::from(task))
    }

    #[test]
    fn test_fifo_and_dedup() {
        let queue = ReadyQueue::new();
        assert!(queue.push(item("w", "a")));
        assert!(queue.push(item("w", "b")));
        assert!(!queue.push(item("w", "a")));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.try_pop(), Some(item("w", "a")));
        // popped pairs may be queued again
        assert!(queue.push(item("w", "a")));
        assert_eq!(queue.try_pop(), Some(item("w", "b")));
        assert_eq!(queue.try_pop(), Some(item("w", "a")));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_remove_workflow() {
        let queue = ReadyQueue::new();
        queue.push(item("w1", "a"));
        queue.push(item("w2", "a"));
        queue.push(item("w1", "b"));

        assert_eq!(queue.remove_workflow(&WorkflowId::from_string("w1")), 2);
        assert_eq!(queue.len(), 1);
        assert!(!queue.contains(&item("w1", "a")));
        assert!(queue.contains(&item("w2", "a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_times_out_when_empty() {
        let queue = ReadyQueue::new();
        assert!(queue.pop(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(ReadyQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.push(item("w", "a"));

        let popped = waiter.await.unwrap();
        assert_eq!(popped, Some(item("w", "a")));
    }
}
