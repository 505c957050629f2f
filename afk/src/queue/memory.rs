//! In-memory queue backend.
//!
//! Suitable for single-process systems and testing. Tasks are lost on
//! process restart.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::Result;

use super::TaskItem;
use super::store::{QueueStore, StoreTaskQueue};

#[derive(Default)]
struct Inner {
    pending: VecDeque<String>,
    inflight: Vec<String>,
    tasks: HashMap<String, TaskItem>,
    workers: BTreeMap<String, f64>,
    recovery_lock: Option<(String, f64)>,
}

/// In-process [`QueueStore`] using a deque and dict-based tracking.
#[derive(Default)]
pub struct InMemoryQueueStore {
    inner: Mutex<Inner>,
    notify: Arc<Notify>,
}

impl std::fmt::Debug for InMemoryQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueueStore").finish_non_exhaustive()
    }
}

impl InMemoryQueueStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids waiting in the pending queue.
    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Total number of tracked task records.
    pub async fn total_count(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }
}

/// In-memory task queue: the shared lifecycle layer over
/// [`InMemoryQueueStore`].
pub type InMemoryTaskQueue = StoreTaskQueue<InMemoryQueueStore>;

/// Create an in-memory task queue with default retry pacing.
#[must_use]
pub fn in_memory_task_queue() -> InMemoryTaskQueue {
    // The default policy is non-negative, so construction cannot fail.
    StoreTaskQueue::new(InMemoryQueueStore::new()).expect("default retry policy is valid")
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn save_task(&self, task: &TaskItem) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn load_task(&self, task_id: &str) -> Result<Option<TaskItem>> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(task_id).cloned())
    }

    async fn delete_task(&self, task_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.tasks.remove(task_id);
        Ok(())
    }

    async fn push_pending(&self, task_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.pending.push_back(task_id.to_owned());
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    async fn pop_pending(&self, timeout: Option<f64>) -> Result<Option<String>> {
        let deadline = timeout.map(|t| Instant::now() + Duration::from_secs_f64(t.max(0.0)));
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(task_id) = inner.pending.pop_front() {
                    inner.inflight.push(task_id.clone());
                    return Ok(Some(task_id));
                }
            }

            // Wait for a push, bounded so short timeouts stay accurate.
            let wait = match deadline {
                None => Duration::from_millis(50),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    remaining.min(Duration::from_millis(50))
                }
            };
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    async fn remove_inflight(&self, task_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.inflight.retain(|id| id != task_id);
        Ok(())
    }

    async fn list_inflight(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.inflight.clone())
    }

    async fn list_tasks(&self) -> Result<Vec<TaskItem>> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<TaskItem> = inner.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .partial_cmp(&b.created_at)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(tasks)
    }

    async fn upsert_worker(&self, worker_id: &str, expires_at: f64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.workers.insert(worker_id.to_owned(), expires_at);
        Ok(())
    }

    async fn remove_worker(&self, worker_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.workers.remove(worker_id);
        Ok(())
    }

    async fn active_workers(&self, now: f64) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        inner.workers.retain(|_, expires_at| *expires_at > now);
        Ok(inner.workers.keys().cloned().collect())
    }

    async fn acquire_recovery_lock(&self, token: &str, ttl_s: f64) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let now = crate::util::now_s();
        if let Some((_, expires_at)) = &inner.recovery_lock
            && *expires_at > now
        {
            return Ok(false);
        }
        inner.recovery_lock = Some((token.to_owned(), now + ttl_s));
        Ok(true)
    }

    async fn release_recovery_lock(&self, token: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match &inner.recovery_lock {
            Some((held, _)) if held == token => {
                inner.recovery_lock = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{
        DEAD_LETTER_REASON_KEY, REASON_NON_RETRYABLE, REASON_RETRY_BUDGET_EXHAUSTED, TaskQueue,
        TaskRetryPolicy, TaskStatus,
    };
    use crate::queue::{StartupRecovery as _, WorkerPresence as _};
    use serde_json::{Map, Value};

    fn task() -> TaskItem {
        TaskItem::new(None, Map::new())
    }

    #[tokio::test]
    async fn enqueue_dequeue_round_trip() {
        let queue = in_memory_task_queue();
        let mut original = task();
        original.payload.insert("k".into(), Value::from(1));
        original
            .metadata
            .insert("custom".into(), Value::from("v"));
        let enqueued = queue.enqueue(original).await.unwrap();

        let dequeued = queue.dequeue(Some(1.0)).await.unwrap().unwrap();
        assert_eq!(dequeued.id, enqueued.id);
        assert_eq!(dequeued.payload, enqueued.payload);
        assert_eq!(dequeued.metadata, enqueued.metadata);
        assert_eq!(dequeued.status, TaskStatus::Running);
        assert!(dequeued.started_at.is_some());
    }

    #[tokio::test]
    async fn subsecond_timeout_returns_none_promptly() {
        let queue = in_memory_task_queue();
        let started = Instant::now();
        let result = queue.dequeue(Some(0.25)).await.unwrap();
        let elapsed = started.elapsed();
        assert!(result.is_none());
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
    }

    #[tokio::test]
    async fn terminal_tasks_are_immutable() {
        let queue = in_memory_task_queue();
        let enqueued = queue.enqueue(task()).await.unwrap();
        let claimed = queue.dequeue(Some(1.0)).await.unwrap().unwrap();
        queue
            .complete(&claimed.id, Some(Value::from("done")))
            .await
            .unwrap();

        queue.fail(&claimed.id, "late failure", true, None).await.unwrap();
        queue.cancel(&claimed.id).await.unwrap();

        let stored = queue.get(&enqueued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result, Some(Value::from("done")));
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn dequeue_skips_stale_pending_ids() {
        let queue = in_memory_task_queue();
        let first = queue.enqueue(task()).await.unwrap();
        let second = queue.enqueue(task()).await.unwrap();
        queue.cancel(&first.id).await.unwrap();

        let claimed = queue.dequeue(Some(1.0)).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
    }

    #[tokio::test]
    async fn retryable_failure_requeues_with_backoff_metadata() {
        let queue = in_memory_task_queue();
        let enqueued = queue.enqueue(task()).await.unwrap();
        let claimed = queue.dequeue(Some(1.0)).await.unwrap().unwrap();

        let policy = TaskRetryPolicy {
            backoff_base_s: 5.0,
            backoff_max_s: 30.0,
            backoff_jitter_s: 0.0,
        };
        queue
            .fail(&claimed.id, "transient", true, Some(policy))
            .await
            .unwrap();

        let stored = queue.get(&enqueued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Retrying);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.next_attempt_at().is_some());
        assert!(stored.started_at.is_none());
    }

    #[tokio::test]
    async fn max_retries_zero_dead_letters_immediately() {
        let queue = in_memory_task_queue();
        let mut item = task();
        item.max_retries = 0;
        let enqueued = queue.enqueue(item).await.unwrap();
        let claimed = queue.dequeue(Some(1.0)).await.unwrap().unwrap();
        queue.fail(&claimed.id, "boom", true, None).await.unwrap();

        let stored = queue.get(&enqueued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(
            stored.dead_letter_reason(),
            Some(REASON_RETRY_BUDGET_EXHAUSTED)
        );
    }

    #[tokio::test]
    async fn non_retryable_failure_records_reason() {
        let queue = in_memory_task_queue();
        let enqueued = queue.enqueue(task()).await.unwrap();
        let claimed = queue.dequeue(Some(1.0)).await.unwrap().unwrap();
        queue.fail(&claimed.id, "bad input", false, None).await.unwrap();

        let stored = queue.get(&enqueued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.dead_letter_reason(), Some(REASON_NON_RETRYABLE));
    }

    #[tokio::test]
    async fn redrive_resets_dead_letters() {
        let queue = in_memory_task_queue();
        let enqueued = queue.enqueue(task()).await.unwrap();
        let claimed = queue.dequeue(Some(1.0)).await.unwrap().unwrap();
        queue.fail(&claimed.id, "bad", false, None).await.unwrap();

        let moved = queue.redrive_dead_letters(None, 100).await.unwrap();
        assert_eq!(moved, 1);
        let stored = queue.get(&enqueued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(!stored.metadata.contains_key(DEAD_LETTER_REASON_KEY));

        // Redriven tasks can be claimed again.
        let reclaimed = queue.dequeue(Some(1.0)).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, enqueued.id);
    }

    #[tokio::test]
    async fn purge_honors_reason_filter() {
        let queue = in_memory_task_queue();
        let keep = queue.enqueue(task()).await.unwrap();
        let claimed = queue.dequeue(Some(1.0)).await.unwrap().unwrap();
        queue.fail(&claimed.id, "bad", false, None).await.unwrap();

        let purged = queue
            .purge_dead_letters(Some(REASON_RETRY_BUDGET_EXHAUSTED), 100)
            .await
            .unwrap();
        assert_eq!(purged, 0);
        let purged = queue
            .purge_dead_letters(Some(REASON_NON_RETRYABLE), 100)
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(queue.get(&keep.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recovery_requires_sole_active_worker() {
        let queue = in_memory_task_queue();
        let enqueued = queue.enqueue(task()).await.unwrap();
        let _claimed = queue.dequeue(Some(1.0)).await.unwrap().unwrap();

        queue.register_worker("w1", 30.0).await.unwrap();
        queue.register_worker("w2", 30.0).await.unwrap();
        assert_eq!(queue.recover_inflight_if_idle("w1").await.unwrap(), 0);

        queue.unregister_worker("w2").await.unwrap();
        assert_eq!(queue.recover_inflight_if_idle("w1").await.unwrap(), 1);

        let stored = queue.get(&enqueued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
    }
}
