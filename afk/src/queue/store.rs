//! Backend contract and shared lifecycle layer for state-backed queues.
//!
//! Backends implement the [`QueueStore`] primitives: a FIFO pending list,
//! an in-flight list recording tasks between dequeue and terminal
//! transition, a task record map, a worker-presence set, and a recovery
//! lock whose release compares the caller's token before deleting.
//! [`StoreTaskQueue`] implements the full [`TaskQueue`] lifecycle on top.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::util::now_s;

use super::{
    DEAD_LETTER_REASON_KEY, REASON_NON_RETRYABLE, REASON_RETRY_BUDGET_EXHAUSTED, StartupRecovery,
    TaskItem, TaskQueue, TaskRetryPolicy, TaskStatus, WorkerPresence,
};

/// Primitive persistence operations implemented by queue backends.
///
/// `pop_pending` must be an atomic pending→in-flight move, and subsecond
/// timeouts must not degrade into an infinite wait: a backend whose
/// blocking primitive has coarser granularity (for example a 1-second
/// BLPOP) must poll with a shorter internal window instead.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist one task record.
    async fn save_task(&self, task: &TaskItem) -> Result<()>;

    /// Load one task record.
    async fn load_task(&self, task_id: &str) -> Result<Option<TaskItem>>;

    /// Delete one task record.
    async fn delete_task(&self, task_id: &str) -> Result<()>;

    /// Push one task id onto the pending FIFO.
    async fn push_pending(&self, task_id: &str) -> Result<()>;

    /// Pop the next pending id, atomically moving it to the in-flight
    /// list. `None` timeout = wait forever; otherwise return `Ok(None)`
    /// after `timeout` seconds.
    async fn pop_pending(&self, timeout: Option<f64>) -> Result<Option<String>>;

    /// Remove one id from the in-flight list.
    async fn remove_inflight(&self, task_id: &str) -> Result<()>;

    /// Snapshot of in-flight ids.
    async fn list_inflight(&self) -> Result<Vec<String>>;

    /// List all task records.
    async fn list_tasks(&self) -> Result<Vec<TaskItem>>;

    /// Record worker presence with a TTL (score = expiry timestamp).
    async fn upsert_worker(&self, worker_id: &str, expires_at: f64) -> Result<()>;

    /// Remove a worker from the presence set.
    async fn remove_worker(&self, worker_id: &str) -> Result<()>;

    /// Ids of workers whose presence has not expired.
    async fn active_workers(&self, now: f64) -> Result<Vec<String>>;

    /// Try to acquire the recovery lock with the caller's token.
    async fn acquire_recovery_lock(&self, token: &str, ttl_s: f64) -> Result<bool>;

    /// Release the recovery lock iff it still holds the caller's token.
    async fn release_recovery_lock(&self, token: &str) -> Result<bool>;
}

/// Shared task lifecycle for storage-backed queues.
///
/// Owns retry pacing and terminal-state rules; the backend only provides
/// persistence and pending-id primitives.
#[derive(Debug)]
pub struct StoreTaskQueue<S: QueueStore> {
    store: S,
    retry_policy: TaskRetryPolicy,
}

impl<S: QueueStore> StoreTaskQueue<S> {
    /// Create a queue over `store` with the default retry pacing policy.
    pub fn new(store: S) -> Result<Self> {
        Self::with_retry_policy(store, TaskRetryPolicy::default())
    }

    /// Create a queue with an explicit default retry pacing policy.
    pub fn with_retry_policy(store: S, retry_policy: TaskRetryPolicy) -> Result<Self> {
        if retry_policy.backoff_base_s < 0.0 {
            return Err(Error::configuration("retry_backoff_base_s must be >= 0"));
        }
        if retry_policy.backoff_max_s < 0.0 {
            return Err(Error::configuration("retry_backoff_max_s must be >= 0"));
        }
        if retry_policy.backoff_jitter_s < 0.0 {
            return Err(Error::configuration("retry_backoff_jitter_s must be >= 0"));
        }
        Ok(Self {
            store,
            retry_policy,
        })
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    async fn require_task(&self, task_id: &str) -> Result<TaskItem> {
        self.store
            .load_task(task_id)
            .await?
            .ok_or_else(|| Error::invalid_arguments(format!("Task '{task_id}' not found")))
    }

    /// Bound how long dequeue sleeps while waiting for deferred retries.
    fn max_sleep_window(deadline: Option<Instant>) -> f64 {
        match deadline {
            None => 0.05,
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .as_secs_f64(),
        }
    }
}

#[async_trait]
impl<S: QueueStore> TaskQueue for StoreTaskQueue<S> {
    async fn enqueue(&self, mut task: TaskItem) -> Result<TaskItem> {
        task.status = TaskStatus::Pending;
        task.error = None;
        task.result = None;
        task.started_at = None;
        task.completed_at = None;
        task.set_next_attempt_at(None);
        self.store.save_task(&task).await?;
        self.store.push_pending(&task.id).await?;
        debug!(task_id = %task.id, contract = ?task.execution_contract(), "Task enqueued");
        Ok(task)
    }

    async fn dequeue(&self, timeout: Option<f64>) -> Result<Option<TaskItem>> {
        let deadline = timeout.map(|t| Instant::now() + Duration::from_secs_f64(t.max(0.0)));

        loop {
            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    Some(remaining.as_secs_f64())
                }
            };

            let Some(task_id) = self.store.pop_pending(remaining).await? else {
                return Ok(None);
            };

            let Some(mut task) = self.store.load_task(&task_id).await? else {
                // Stale pending id; drop it.
                self.store.remove_inflight(&task_id).await?;
                continue;
            };
            if task.is_terminal() {
                self.store.remove_inflight(&task_id).await?;
                continue;
            }

            let now = now_s();
            if let Some(next_attempt_at) = task.next_attempt_at()
                && next_attempt_at > now
            {
                // Not yet due; push back and sleep a bounded window.
                self.store.remove_inflight(&task.id).await?;
                self.store.push_pending(&task.id).await?;
                let sleep_s = (next_attempt_at - now)
                    .max(0.0)
                    .min(Self::max_sleep_window(deadline));
                if sleep_s > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(sleep_s)).await;
                }
                continue;
            }

            task.status = TaskStatus::Running;
            task.started_at = Some(now_s());
            task.completed_at = None;
            task.set_next_attempt_at(None);
            self.store.save_task(&task).await?;
            return Ok(Some(task));
        }
    }

    async fn complete(&self, task_id: &str, result: Option<Value>) -> Result<()> {
        let mut task = self.require_task(task_id).await?;
        if task.is_terminal() {
            return Ok(());
        }
        task.status = TaskStatus::Completed;
        task.result = result;
        task.error = None;
        task.completed_at = Some(now_s());
        self.store.save_task(&task).await?;
        self.store.remove_inflight(task_id).await?;
        Ok(())
    }

    async fn fail(
        &self,
        task_id: &str,
        error: &str,
        retryable: bool,
        retry_policy: Option<TaskRetryPolicy>,
    ) -> Result<()> {
        let mut task = self.require_task(task_id).await?;
        if task.is_terminal() {
            return Ok(());
        }
        task.retry_count += 1;
        task.error = Some(error.to_owned());
        task.result = None;

        // `max_retries` counts retries after the first failed attempt.
        if retryable && task.retry_count <= task.max_retries {
            task.status = TaskStatus::Retrying;
            task.started_at = None;
            task.completed_at = None;
            let policy = retry_policy
                .or_else(|| TaskRetryPolicy::from_metadata(&task.metadata))
                .unwrap_or(self.retry_policy);
            let delay_s = policy.delay_s(task.retry_count);
            task.set_next_attempt_at((delay_s > 0.0).then(|| now_s() + delay_s));
            self.store.save_task(&task).await?;
            self.store.remove_inflight(task_id).await?;
            self.store.push_pending(&task.id).await?;
            debug!(task_id = %task.id, retry_count = task.retry_count, delay_s, "Task requeued for retry");
            return Ok(());
        }

        task.status = TaskStatus::Failed;
        task.completed_at = Some(now_s());
        task.set_next_attempt_at(None);
        task.metadata.insert(
            DEAD_LETTER_REASON_KEY.to_owned(),
            Value::String(
                if retryable {
                    REASON_RETRY_BUDGET_EXHAUSTED
                } else {
                    REASON_NON_RETRYABLE
                }
                .to_owned(),
            ),
        );
        self.store.save_task(&task).await?;
        self.store.remove_inflight(task_id).await?;
        debug!(task_id = %task.id, retryable, "Task dead-lettered");
        Ok(())
    }

    async fn cancel(&self, task_id: &str) -> Result<()> {
        let mut task = self.require_task(task_id).await?;
        if task.is_terminal() {
            return Ok(());
        }
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(now_s());
        self.store.save_task(&task).await?;
        self.store.remove_inflight(task_id).await?;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskItem>> {
        self.store.load_task(task_id).await
    }

    async fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<TaskItem>> {
        let mut tasks = self.store.list_tasks().await?;
        if let Some(status) = status {
            tasks.retain(|task| task.status == status);
        }
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn redrive_dead_letters(&self, reason: Option<&str>, limit: usize) -> Result<usize> {
        let mut moved = 0usize;
        for mut task in self.list_dead_letters(limit).await? {
            if let Some(reason) = reason
                && task.dead_letter_reason() != Some(reason)
            {
                continue;
            }
            task.status = TaskStatus::Pending;
            task.error = None;
            task.completed_at = None;
            task.set_next_attempt_at(None);
            task.metadata.remove(DEAD_LETTER_REASON_KEY);
            self.store.save_task(&task).await?;
            self.store.push_pending(&task.id).await?;
            moved += 1;
        }
        if moved > 0 {
            info!(moved, "Dead-letter tasks redriven");
        }
        Ok(moved)
    }

    async fn purge_dead_letters(&self, reason: Option<&str>, limit: usize) -> Result<usize> {
        let mut removed = 0usize;
        for task in self.list_dead_letters(limit).await? {
            if let Some(reason) = reason
                && task.dead_letter_reason() != Some(reason)
            {
                continue;
            }
            self.store.delete_task(&task.id).await?;
            removed += 1;
        }
        Ok(removed)
    }

    fn presence(&self) -> Option<&dyn WorkerPresence> {
        Some(self)
    }

    fn recovery(&self) -> Option<&dyn StartupRecovery> {
        Some(self)
    }
}

#[async_trait]
impl<S: QueueStore> WorkerPresence for StoreTaskQueue<S> {
    async fn register_worker(&self, worker_id: &str, ttl_s: f64) -> Result<()> {
        self.store.upsert_worker(worker_id, now_s() + ttl_s).await
    }

    async fn refresh_worker(&self, worker_id: &str, ttl_s: f64) -> Result<()> {
        self.store.upsert_worker(worker_id, now_s() + ttl_s).await
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        self.store.remove_worker(worker_id).await
    }
}

#[async_trait]
impl<S: QueueStore> StartupRecovery for StoreTaskQueue<S> {
    async fn recover_inflight_if_idle(&self, active_worker_id: &str) -> Result<usize> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        if !self.store.acquire_recovery_lock(&token, 30.0).await? {
            return Ok(0);
        }

        let moved = async {
            let workers = self.store.active_workers(now_s()).await?;
            let sole_worker =
                workers.len() == 1 && workers.first().map(String::as_str) == Some(active_worker_id);
            if !sole_worker {
                return Ok::<usize, Error>(0);
            }

            let mut moved = 0usize;
            for task_id in self.store.list_inflight().await? {
                let Some(mut task) = self.store.load_task(&task_id).await? else {
                    self.store.remove_inflight(&task_id).await?;
                    continue;
                };
                if task.is_terminal() {
                    self.store.remove_inflight(&task_id).await?;
                    continue;
                }
                task.status = TaskStatus::Pending;
                task.started_at = None;
                self.store.save_task(&task).await?;
                self.store.remove_inflight(&task_id).await?;
                self.store.push_pending(&task_id).await?;
                moved += 1;
            }
            Ok(moved)
        }
        .await;

        // Compare-and-delete release even when recovery failed midway.
        let _ = self.store.release_recovery_lock(&token).await;
        moved
    }
}
