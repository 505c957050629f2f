//! Queue backend selection from environment variables.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::TaskQueue;
use super::TaskRetryPolicy;
use super::memory::InMemoryQueueStore;
use super::store::{QueueStore, StoreTaskQueue};

/// Environment variable selecting the queue backend.
pub const QUEUE_BACKEND_ENV: &str = "AFK_QUEUE_BACKEND";
/// Environment variable for the exponential backoff base (seconds).
pub const QUEUE_RETRY_BASE_ENV: &str = "AFK_QUEUE_RETRY_BACKOFF_BASE_S";
/// Environment variable for the backoff cap (seconds).
pub const QUEUE_RETRY_MAX_ENV: &str = "AFK_QUEUE_RETRY_BACKOFF_MAX_S";
/// Environment variable for the backoff jitter (seconds).
pub const QUEUE_RETRY_JITTER_ENV: &str = "AFK_QUEUE_RETRY_BACKOFF_JITTER_S";
/// Environment variable for the distributed key prefix.
pub const QUEUE_REDIS_PREFIX_ENV: &str = "AFK_QUEUE_REDIS_PREFIX";

fn env_f64(name: &str, default: f64) -> Result<f64> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(default);
            }
            trimmed.parse::<f64>().map_err(|_| {
                Error::configuration(format!("{name} must be a number, got '{trimmed}'"))
            })
        }
    }
}

/// Retry pacing policy resolved from `AFK_QUEUE_RETRY_*` variables.
pub fn retry_policy_from_env() -> Result<TaskRetryPolicy> {
    Ok(TaskRetryPolicy {
        backoff_base_s: env_f64(QUEUE_RETRY_BASE_ENV, 0.5)?,
        backoff_max_s: env_f64(QUEUE_RETRY_MAX_ENV, 30.0)?,
        backoff_jitter_s: env_f64(QUEUE_RETRY_JITTER_ENV, 0.2)?,
    })
}

/// Wraps a shared backend store so the lifecycle layer can own it.
struct SharedQueueStore(Arc<dyn QueueStore>);

#[async_trait]
impl QueueStore for SharedQueueStore {
    async fn save_task(&self, task: &super::TaskItem) -> Result<()> {
        self.0.save_task(task).await
    }

    async fn load_task(&self, task_id: &str) -> Result<Option<super::TaskItem>> {
        self.0.load_task(task_id).await
    }

    async fn delete_task(&self, task_id: &str) -> Result<()> {
        self.0.delete_task(task_id).await
    }

    async fn push_pending(&self, task_id: &str) -> Result<()> {
        self.0.push_pending(task_id).await
    }

    async fn pop_pending(&self, timeout: Option<f64>) -> Result<Option<String>> {
        self.0.pop_pending(timeout).await
    }

    async fn remove_inflight(&self, task_id: &str) -> Result<()> {
        self.0.remove_inflight(task_id).await
    }

    async fn list_inflight(&self) -> Result<Vec<String>> {
        self.0.list_inflight().await
    }

    async fn list_tasks(&self) -> Result<Vec<super::TaskItem>> {
        self.0.list_tasks().await
    }

    async fn upsert_worker(&self, worker_id: &str, expires_at: f64) -> Result<()> {
        self.0.upsert_worker(worker_id, expires_at).await
    }

    async fn remove_worker(&self, worker_id: &str) -> Result<()> {
        self.0.remove_worker(worker_id).await
    }

    async fn active_workers(&self, now: f64) -> Result<Vec<String>> {
        self.0.active_workers(now).await
    }

    async fn acquire_recovery_lock(&self, token: &str, ttl_s: f64) -> Result<bool> {
        self.0.acquire_recovery_lock(token, ttl_s).await
    }

    async fn release_recovery_lock(&self, token: &str) -> Result<bool> {
        self.0.release_recovery_lock(token).await
    }
}

/// Create a task queue from `AFK_QUEUE_*` environment variables.
///
/// Backends: `inmemory` (default; aliases `mem`, `memory`, `in_memory`) and
/// `redis`. The distributed store itself is an external collaborator, so
/// selecting `redis` requires an injected [`QueueStore`] implementation —
/// typically a client wrapper honoring `AFK_QUEUE_REDIS_PREFIX`.
pub fn task_queue_from_env(
    distributed_store: Option<Arc<dyn QueueStore>>,
) -> Result<Arc<dyn TaskQueue>> {
    let backend = std::env::var(QUEUE_BACKEND_ENV)
        .unwrap_or_else(|_| "inmemory".to_owned())
        .trim()
        .to_lowercase();
    let retry_policy = retry_policy_from_env()?;

    match backend.as_str() {
        "" | "mem" | "memory" | "inmemory" | "in_memory" => Ok(Arc::new(
            StoreTaskQueue::with_retry_policy(InMemoryQueueStore::new(), retry_policy)?,
        )),
        "redis" => {
            let store = distributed_store.ok_or_else(|| {
                Error::configuration(
                    "Queue backend 'redis' requires an injected distributed QueueStore implementation",
                )
            })?;
            Ok(Arc::new(StoreTaskQueue::with_retry_policy(
                SharedQueueStore(store),
                retry_policy,
            )?))
        }
        other => Err(Error::configuration(format!(
            "Unknown {QUEUE_BACKEND_ENV}: {other}"
        ))),
    }
}
