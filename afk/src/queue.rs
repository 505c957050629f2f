//! Persistent task queue.
//!
//! A FIFO pending queue feeding contract-typed workers, with deferred-retry
//! backoff, dead-letter metadata, worker presence tracking, and startup
//! in-flight recovery. Backends implement the [`QueueStore`] primitive
//! contract; [`StoreTaskQueue`] layers the shared task lifecycle on top.
//!
//! [`QueueStore`]: store::QueueStore
//! [`StoreTaskQueue`]: store::StoreTaskQueue

pub mod contracts;
pub mod factory;
pub mod memory;
pub mod store;
pub mod worker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::util::now_s;

/// Metadata key carrying the execution contract id.
pub const EXECUTION_CONTRACT_KEY: &str = "execution_contract";
/// Metadata key carrying the deferred-retry timestamp.
pub const NEXT_ATTEMPT_AT_KEY: &str = "next_attempt_at";
/// Metadata key recording why a task was dead-lettered.
pub const DEAD_LETTER_REASON_KEY: &str = "dead_letter_reason";
/// Metadata key for a per-task backoff base override (seconds).
pub const RETRY_BACKOFF_BASE_KEY: &str = "retry_backoff_base_s";
/// Metadata key for a per-task backoff cap override (seconds).
pub const RETRY_BACKOFF_MAX_KEY: &str = "retry_backoff_max_s";
/// Metadata key for a per-task backoff jitter override (seconds).
pub const RETRY_BACKOFF_JITTER_KEY: &str = "retry_backoff_jitter_s";

/// Dead-letter reason for a non-retryable failure.
pub const REASON_NON_RETRYABLE: &str = "non_retryable_error";
/// Dead-letter reason for an exhausted retry budget.
pub const REASON_RETRY_BUDGET_EXHAUSTED: &str = "retry_budget_exhausted";

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the pending queue.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Failed retryably; waiting for its next attempt.
    Retrying,
    /// Terminal: succeeded.
    Completed,
    /// Terminal: failed permanently.
    Failed,
    /// Terminal: cancelled.
    Cancelled,
}

impl TaskStatus {
    /// Whether the status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Retry backoff policy used to schedule deferred retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskRetryPolicy {
    /// Exponential backoff base delay in seconds.
    pub backoff_base_s: f64,
    /// Maximum backoff delay cap in seconds.
    pub backoff_max_s: f64,
    /// Uniform random jitter added to the delay, in seconds.
    pub backoff_jitter_s: f64,
}

impl Default for TaskRetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base_s: 0.0,
            backoff_max_s: 30.0,
            backoff_jitter_s: 0.0,
        }
    }
}

impl TaskRetryPolicy {
    /// Serialize into task metadata fields.
    #[must_use]
    pub fn as_metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert(RETRY_BACKOFF_BASE_KEY.to_owned(), self.backoff_base_s.into());
        metadata.insert(RETRY_BACKOFF_MAX_KEY.to_owned(), self.backoff_max_s.into());
        metadata.insert(
            RETRY_BACKOFF_JITTER_KEY.to_owned(),
            self.backoff_jitter_s.into(),
        );
        metadata
    }

    /// Parse from metadata fields, when all three are present.
    #[must_use]
    pub fn from_metadata(metadata: &Map<String, Value>) -> Option<Self> {
        let base = metadata.get(RETRY_BACKOFF_BASE_KEY)?.as_f64()?;
        let max = metadata.get(RETRY_BACKOFF_MAX_KEY)?.as_f64()?;
        let jitter = metadata.get(RETRY_BACKOFF_JITTER_KEY)?.as_f64()?;
        Some(Self {
            backoff_base_s: base,
            backoff_max_s: max,
            backoff_jitter_s: jitter,
        })
    }

    /// Retry delay for the given retry count:
    /// `min(max_backoff, base * 2^(retry_count-1)) + uniform(0, jitter)`.
    #[must_use]
    pub fn delay_s(&self, retry_count: u32) -> f64 {
        let base = if self.backoff_base_s <= 0.0 {
            0.0
        } else {
            let exponent = i32::try_from(retry_count.saturating_sub(1))
                .unwrap_or(i32::MAX)
                .min(64);
            self.backoff_base_s * 2f64.powi(exponent)
        };
        let capped = base.min(self.backoff_max_s);
        let jitter = fastrand::f64() * self.backoff_jitter_s.max(0.0);
        (capped + jitter).max(0.0)
    }
}

/// A unit of work in the task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    /// Unique task identifier.
    pub id: String,
    /// Agent to execute this task (optional for non-agent contracts).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Contract-specific task input data.
    pub payload: Map<String, Value>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Task output after completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of times this task has been retried.
    pub retry_count: u32,
    /// Maximum retries before permanent failure.
    pub max_retries: u32,
    /// Unix timestamp when the task was enqueued.
    pub created_at: f64,
    /// Unix timestamp when execution began.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    /// Unix timestamp when the task reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<f64>,
    /// JSON-safe metadata (contract id, retry overrides, dead-letter reason).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TaskItem {
    /// Create a pending task with a fresh id.
    #[must_use]
    pub fn new(agent_name: Option<String>, payload: Map<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            agent_name,
            payload,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 3,
            created_at: now_s(),
            started_at: None,
            completed_at: None,
            metadata: Map::new(),
        }
    }

    /// Whether the task has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Execution duration in seconds, when started and completed.
    #[must_use]
    pub fn duration_s(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    /// Execution contract id from metadata, when present and non-blank.
    #[must_use]
    pub fn execution_contract(&self) -> Option<&str> {
        self.metadata
            .get(EXECUTION_CONTRACT_KEY)
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Persist the execution contract id in metadata.
    pub fn set_execution_contract(&mut self, contract_id: impl Into<String>) {
        self.metadata.insert(
            EXECUTION_CONTRACT_KEY.to_owned(),
            Value::String(contract_id.into()),
        );
    }

    /// Deferred-retry timestamp from metadata, when present.
    #[must_use]
    pub fn next_attempt_at(&self) -> Option<f64> {
        self.metadata.get(NEXT_ATTEMPT_AT_KEY).and_then(Value::as_f64)
    }

    /// Set or clear the deferred-retry timestamp.
    pub fn set_next_attempt_at(&mut self, timestamp: Option<f64>) {
        match timestamp {
            Some(timestamp) => {
                self.metadata
                    .insert(NEXT_ATTEMPT_AT_KEY.to_owned(), timestamp.into());
            }
            None => {
                self.metadata.remove(NEXT_ATTEMPT_AT_KEY);
            }
        }
    }

    /// Dead-letter reason from metadata, when present.
    #[must_use]
    pub fn dead_letter_reason(&self) -> Option<&str> {
        self.metadata
            .get(DEAD_LETTER_REASON_KEY)
            .and_then(Value::as_str)
    }
}

/// Abstract task queue for distributed agent work.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Add a task to the queue. Returns the normalized, persisted task.
    async fn enqueue(&self, task: TaskItem) -> Result<TaskItem>;

    /// Remove and return the next runnable task. `None` = wait forever;
    /// otherwise wait up to `timeout` seconds and return `Ok(None)` on
    /// expiry.
    async fn dequeue(&self, timeout: Option<f64>) -> Result<Option<TaskItem>>;

    /// Mark a task as completed. No-op for terminal tasks.
    async fn complete(&self, task_id: &str, result: Option<Value>) -> Result<()>;

    /// Mark a task as failed, or requeue it while retry budget remains.
    /// No-op for terminal tasks.
    async fn fail(
        &self,
        task_id: &str,
        error: &str,
        retryable: bool,
        retry_policy: Option<TaskRetryPolicy>,
    ) -> Result<()>;

    /// Cancel a non-terminal task. No-op for terminal tasks.
    async fn cancel(&self, task_id: &str) -> Result<()>;

    /// Retrieve a task by id.
    async fn get(&self, task_id: &str) -> Result<Option<TaskItem>>;

    /// List tasks with an optional status filter.
    async fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<TaskItem>>;

    /// Return dead-lettered tasks (terminal failed tasks).
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<TaskItem>> {
        self.list_tasks(Some(TaskStatus::Failed), limit).await
    }

    /// Requeue failed dead-letter tasks back to pending. Returns the count
    /// moved.
    async fn redrive_dead_letters(&self, reason: Option<&str>, limit: usize) -> Result<usize> {
        let _ = (reason, limit);
        Err(Error::configuration(
            "dead-letter redrive is not supported by this queue",
        ))
    }

    /// Delete failed dead-letter tasks from storage. Returns the count
    /// removed.
    async fn purge_dead_letters(&self, reason: Option<&str>, limit: usize) -> Result<usize> {
        let _ = (reason, limit);
        Err(Error::configuration(
            "dead-letter purge is not supported by this queue",
        ))
    }

    /// Enqueue a task bound to an execution contract.
    ///
    /// Rejects blank contract ids. The contract id and any retry-policy
    /// override are recorded in task metadata.
    async fn enqueue_contract(
        &self,
        execution_contract: &str,
        payload: Map<String, Value>,
        agent_name: Option<String>,
        max_retries: u32,
        metadata: Option<Map<String, Value>>,
        retry_policy: Option<TaskRetryPolicy>,
    ) -> Result<TaskItem> {
        let contract_id = execution_contract.trim();
        if contract_id.is_empty() {
            return Err(Error::configuration(
                "execution_contract must be a non-empty string",
            ));
        }

        let mut task_metadata = metadata.unwrap_or_default();
        task_metadata.insert(
            EXECUTION_CONTRACT_KEY.to_owned(),
            Value::String(contract_id.to_owned()),
        );
        if let Some(policy) = retry_policy {
            for (key, value) in policy.as_metadata() {
                task_metadata.insert(key, value);
            }
        }

        let mut task = TaskItem::new(agent_name, payload);
        task.max_retries = max_retries;
        task.metadata = task_metadata;
        self.enqueue(task).await
    }

    /// Worker-presence capability, when supported.
    fn presence(&self) -> Option<&dyn WorkerPresence> {
        None
    }

    /// Startup-recovery capability, when supported.
    fn recovery(&self) -> Option<&dyn StartupRecovery> {
        None
    }
}

/// Optional queue capability for tracking active workers with TTL
/// semantics.
#[async_trait]
pub trait WorkerPresence: Send + Sync {
    /// Register one worker as active.
    async fn register_worker(&self, worker_id: &str, ttl_s: f64) -> Result<()>;

    /// Refresh a worker's presence TTL. Must be called faster than the TTL.
    async fn refresh_worker(&self, worker_id: &str, ttl_s: f64) -> Result<()>;

    /// Remove one worker from presence tracking.
    async fn unregister_worker(&self, worker_id: &str) -> Result<()>;
}

/// Optional queue capability for startup in-flight recovery.
#[async_trait]
pub trait StartupRecovery: Send + Sync {
    /// Requeue in-flight tasks if and only if `active_worker_id` is the
    /// sole active worker. Returns the number of tasks moved.
    async fn recover_inflight_if_idle(&self, active_worker_id: &str) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_metadata_round_trip() {
        let policy = TaskRetryPolicy {
            backoff_base_s: 0.5,
            backoff_max_s: 10.0,
            backoff_jitter_s: 0.1,
        };
        let metadata = policy.as_metadata();
        assert_eq!(TaskRetryPolicy::from_metadata(&metadata), Some(policy));
        assert_eq!(TaskRetryPolicy::from_metadata(&Map::new()), None);
    }

    #[test]
    fn retry_delay_is_capped_exponential() {
        let policy = TaskRetryPolicy {
            backoff_base_s: 1.0,
            backoff_max_s: 4.0,
            backoff_jitter_s: 0.0,
        };
        assert!((policy.delay_s(1) - 1.0).abs() < f64::EPSILON);
        assert!((policy.delay_s(2) - 2.0).abs() < f64::EPSILON);
        assert!((policy.delay_s(3) - 4.0).abs() < f64::EPSILON);
        assert!((policy.delay_s(8) - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn task_metadata_accessors() {
        let mut task = TaskItem::new(None, Map::new());
        assert_eq!(task.execution_contract(), None);
        task.set_execution_contract("job.dispatch.v1");
        assert_eq!(task.execution_contract(), Some("job.dispatch.v1"));

        assert_eq!(task.next_attempt_at(), None);
        task.set_next_attempt_at(Some(12.5));
        assert_eq!(task.next_attempt_at(), Some(12.5));
        task.set_next_attempt_at(None);
        assert_eq!(task.next_attempt_at(), None);
    }

    #[test]
    fn task_serde_round_trip_preserves_retry_metadata() {
        let mut task = TaskItem::new(Some("agent-a".into()), Map::new());
        task.retry_count = 2;
        task.metadata = TaskRetryPolicy {
            backoff_base_s: 0.25,
            backoff_max_s: 5.0,
            backoff_jitter_s: 0.0,
        }
        .as_metadata();
        let raw = serde_json::to_string(&task).unwrap();
        let back: TaskItem = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, task);
    }
}
