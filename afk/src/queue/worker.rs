//! Task worker — the consumer loop that dequeues and executes
//! contract-typed tasks.
//!
//! Concurrency is bounded by a counting semaphore: a permit is acquired
//! before each dequeue and released when the spawned execution task
//! finishes, not inside the loop body. Missing/unknown/invalid contracts
//! fail immediately without consuming retry budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::agent::Agent;
use crate::error::{Error, Result};
use crate::runner::Runner;

use super::contracts::{
    ContractContext, ContractError, ExecutionContract, JOB_DISPATCH_CONTRACT, JobDispatchContract,
    JobHandler, RUNNER_CHAT_CONTRACT, RunnerChatContract,
};
use super::{TaskItem, TaskQueue, TaskRetryPolicy};

/// Counter sink for worker instrumentation.
pub trait WorkerMetrics: Send + Sync {
    /// Increment a counter metric.
    fn incr(&self, name: &str, value: u64);
}

/// Default metrics sink when no backend is provided.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpWorkerMetrics;

impl WorkerMetrics for NoOpWorkerMetrics {
    fn incr(&self, _name: &str, _value: u64) {}
}

/// Callback invoked after a task completes or fails.
#[async_trait]
pub trait TaskCallback: Send + Sync {
    /// Observe one task in its post-transition state.
    async fn on_task(&self, task: TaskItem);
}

/// Configuration for the task worker.
#[derive(Debug, Clone)]
pub struct TaskWorkerConfig {
    /// Seconds between dequeue attempts when idle.
    pub poll_interval_s: f64,
    /// Maximum tasks executed concurrently.
    pub max_concurrent_tasks: usize,
    /// Grace period for in-flight tasks on shutdown, in seconds.
    pub shutdown_timeout_s: f64,
    /// Whether to run startup in-flight recovery on capable queues.
    pub recover_inflight_on_startup: bool,
    /// Presence TTL in seconds, for queues that track workers.
    pub worker_presence_ttl_s: f64,
    /// Presence heartbeat interval in seconds. Must be below the TTL.
    pub worker_presence_refresh_s: f64,
}

impl Default for TaskWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_s: 1.0,
            max_concurrent_tasks: 4,
            shutdown_timeout_s: 30.0,
            recover_inflight_on_startup: true,
            worker_presence_ttl_s: 30.0,
            worker_presence_refresh_s: 10.0,
        }
    }
}

/// Builder for [`TaskWorker`].
pub struct TaskWorkerBuilder {
    queue: Arc<dyn TaskQueue>,
    agents: HashMap<String, Arc<Agent>>,
    runner: Option<Runner>,
    contracts: Vec<(String, Arc<dyn ExecutionContract>)>,
    job_handlers: HashMap<String, Arc<dyn JobHandler>>,
    retry_policies: HashMap<String, TaskRetryPolicy>,
    metrics: Option<Arc<dyn WorkerMetrics>>,
    config: TaskWorkerConfig,
    on_complete: Option<Arc<dyn TaskCallback>>,
    on_failure: Option<Arc<dyn TaskCallback>>,
}

impl std::fmt::Debug for TaskWorkerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWorkerBuilder").finish_non_exhaustive()
    }
}

impl TaskWorkerBuilder {
    /// Register an agent available to agent-requiring contracts.
    #[must_use]
    pub fn agent(mut self, agent: Arc<Agent>) -> Self {
        self.agents.insert(agent.name().to_owned(), agent);
        self
    }

    /// Use a specific runner for the built-in runner-chat contract.
    #[must_use]
    pub fn runner(mut self, runner: Runner) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Register a custom execution contract under `contract_id`.
    #[must_use]
    pub fn contract(mut self, contract_id: impl Into<String>, contract: Arc<dyn ExecutionContract>) -> Self {
        self.contracts.push((contract_id.into(), contract));
        self
    }

    /// Register a named job handler for the job-dispatch contract.
    #[must_use]
    pub fn job_handler(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.job_handlers.insert(job_type.into(), handler);
        self
    }

    /// Set a per-contract retry policy override.
    #[must_use]
    pub fn retry_policy(mut self, contract_id: impl Into<String>, policy: TaskRetryPolicy) -> Self {
        self.retry_policies.insert(contract_id.into(), policy);
        self
    }

    /// Attach a metrics sink.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn WorkerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the worker configuration.
    #[must_use]
    pub fn config(mut self, config: TaskWorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a completion callback.
    #[must_use]
    pub fn on_complete(mut self, callback: Arc<dyn TaskCallback>) -> Self {
        self.on_complete = Some(callback);
        self
    }

    /// Attach a failure callback.
    #[must_use]
    pub fn on_failure(mut self, callback: Arc<dyn TaskCallback>) -> Self {
        self.on_failure = Some(callback);
        self
    }

    /// Build the worker. Rejects contract-id mismatches between the
    /// registration key and the contract's declared id.
    pub fn build(self) -> Result<TaskWorker> {
        let runner = match self.runner {
            Some(runner) => runner,
            None => Runner::new()?,
        };

        let mut contracts: HashMap<String, Arc<dyn ExecutionContract>> = HashMap::new();
        contracts.insert(
            RUNNER_CHAT_CONTRACT.to_owned(),
            Arc::new(RunnerChatContract::new(runner)),
        );
        contracts.insert(JOB_DISPATCH_CONTRACT.to_owned(), Arc::new(JobDispatchContract));

        for (key, contract) in self.contracts {
            let contract_id = key.trim().to_owned();
            if contract_id.is_empty() {
                return Err(Error::configuration("execution contract ids must be non-empty"));
            }
            let declared = contract.contract_id();
            if !declared.is_empty() && declared != contract_id {
                return Err(Error::configuration(format!(
                    "Contract id mismatch: key '{contract_id}' != contract.contract_id '{declared}'"
                )));
            }
            contracts.insert(contract_id, contract);
        }

        let max_concurrent = self.config.max_concurrent_tasks.max(1);
        Ok(TaskWorker {
            inner: Arc::new(WorkerInner {
                queue: self.queue,
                agents: self.agents,
                contracts,
                contract_context: ContractContext {
                    job_handlers: self.job_handlers,
                },
                retry_policies: self.retry_policies,
                metrics: self.metrics.unwrap_or_else(|| Arc::new(NoOpWorkerMetrics)),
                config: self.config,
                on_complete: self.on_complete,
                on_failure: self.on_failure,
                running: AtomicBool::new(false),
                worker_id: uuid::Uuid::new_v4().simple().to_string(),
                semaphore: Arc::new(Semaphore::new(max_concurrent)),
                active: Mutex::new(JoinSet::new()),
            }),
            dispatcher: Mutex::new(None),
            heartbeat: Mutex::new(None),
        })
    }
}

struct WorkerInner {
    queue: Arc<dyn TaskQueue>,
    agents: HashMap<String, Arc<Agent>>,
    contracts: HashMap<String, Arc<dyn ExecutionContract>>,
    contract_context: ContractContext,
    retry_policies: HashMap<String, TaskRetryPolicy>,
    metrics: Arc<dyn WorkerMetrics>,
    config: TaskWorkerConfig,
    on_complete: Option<Arc<dyn TaskCallback>>,
    on_failure: Option<Arc<dyn TaskCallback>>,
    running: AtomicBool,
    worker_id: String,
    semaphore: Arc<Semaphore>,
    active: Mutex<JoinSet<()>>,
}

impl WorkerInner {
    fn resolve_contract(
        &self,
        task: &TaskItem,
    ) -> std::result::Result<(String, Arc<dyn ExecutionContract>), ContractError> {
        let contract_id = task.execution_contract().ok_or_else(|| {
            ContractError::Resolution(format!(
                "Missing execution contract metadata '{}'",
                super::EXECUTION_CONTRACT_KEY
            ))
        })?;
        let contract = self.contracts.get(contract_id).ok_or_else(|| {
            ContractError::Resolution(format!("Unknown execution contract '{contract_id}'"))
        })?;
        Ok((contract_id.to_owned(), Arc::clone(contract)))
    }

    fn resolve_agent(
        &self,
        task: &TaskItem,
        contract: &Arc<dyn ExecutionContract>,
    ) -> std::result::Result<Option<Arc<Agent>>, ContractError> {
        if !contract.requires_agent() {
            return Ok(None);
        }
        let agent_name = task
            .agent_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                ContractError::Validation(format!(
                    "Contract '{}' requires a non-empty task.agent_name",
                    contract.contract_id()
                ))
            })?;
        let agent = self.agents.get(agent_name).ok_or_else(|| {
            ContractError::Validation(format!(
                "Agent '{agent_name}' not found for contract '{}'",
                contract.contract_id()
            ))
        })?;
        Ok(Some(Arc::clone(agent)))
    }

    fn retry_policy_for(&self, task: &TaskItem) -> Option<TaskRetryPolicy> {
        if let Some(policy) = TaskRetryPolicy::from_metadata(&task.metadata) {
            return Some(policy);
        }
        task.execution_contract()
            .and_then(|contract_id| self.retry_policies.get(contract_id).copied())
    }

    async fn execute_task(self: Arc<Self>, task: TaskItem) {
        let short_id: String = task.id.chars().take(8).collect();
        let outcome = async {
            let (contract_id, contract) = self.resolve_contract(&task)?;
            let agent = self.resolve_agent(&task, &contract)?;
            let output = contract
                .execute(&task, agent, &self.contract_context)
                .await?;
            Ok::<(String, Value), ContractError>((contract_id, output))
        }
        .await;

        match outcome {
            Ok((contract_id, output)) => {
                let mut envelope = Map::new();
                envelope.insert("contract".to_owned(), Value::String(contract_id.clone()));
                envelope.insert("output".to_owned(), output);
                let result = Value::Object(envelope);
                if let Err(err) = self.queue.complete(&task.id, Some(result.clone())).await {
                    error!(%err, task_id = %short_id, "Failed to record task completion");
                }
                self.metrics.incr("queue_worker_completed_total", 1);
                info!(
                    task_id = %short_id,
                    contract = %contract_id,
                    agent = ?task.agent_name,
                    "Task completed",
                );
                self.run_callback(&self.on_complete, &task, |item| {
                    item.status = super::TaskStatus::Completed;
                    item.result = Some(result.clone());
                })
                .await;
            }
            Err(err) if err.is_terminal() => {
                let message = err.to_string();
                self.metrics.incr("queue_worker_failed_non_retryable_total", 1);
                error!(task_id = %short_id, error = %message, "Task failed (non-retryable)");
                if let Err(fail_err) = self.queue.fail(&task.id, &message, false, None).await {
                    error!(%fail_err, task_id = %short_id, "Failed to record task failure");
                }
                self.run_callback(&self.on_failure, &task, |item| {
                    item.error = Some(message.clone());
                })
                .await;
            }
            Err(err) => {
                let message = err.to_string();
                self.metrics.incr("queue_worker_failed_retryable_total", 1);
                warn!(task_id = %short_id, error = %message, "Task failed (retryable)");
                let policy = self.retry_policy_for(&task);
                if let Err(fail_err) = self.queue.fail(&task.id, &message, true, policy).await {
                    error!(%fail_err, task_id = %short_id, "Failed to record task failure");
                }
                self.run_callback(&self.on_failure, &task, |item| {
                    item.error = Some(message.clone());
                })
                .await;
            }
        }
    }

    /// Invoke a callback with the reloaded task record (falling back to a
    /// locally patched copy when the record is gone).
    async fn run_callback(
        &self,
        callback: &Option<Arc<dyn TaskCallback>>,
        task: &TaskItem,
        patch: impl FnOnce(&mut TaskItem),
    ) {
        let Some(callback) = callback else {
            return;
        };
        let item = match self.queue.get(&task.id).await {
            Ok(Some(item)) => item,
            _ => {
                let mut fallback = task.clone();
                patch(&mut fallback);
                fallback
            }
        };
        callback.on_task(item).await;
    }

    async fn dispatch_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let task = match self
                .queue
                .dequeue(Some(self.config.poll_interval_s))
                .await
            {
                Ok(Some(task)) => task,
                Ok(None) => {
                    drop(permit);
                    continue;
                }
                Err(err) => {
                    error!(%err, "Worker dequeue error");
                    drop(permit);
                    tokio::time::sleep(Duration::from_secs_f64(self.config.poll_interval_s)).await;
                    continue;
                }
            };
            self.metrics.incr("queue_worker_dequeued_total", 1);
            debug!(task_id = %task.id, "Task dequeued");

            let worker = Arc::clone(&self);
            let mut active = self.active.lock().await;
            // Reap finished executions so the set stays bounded.
            while active.try_join_next().is_some() {}
            active.spawn(async move {
                worker.execute_task(task).await;
                // Permit released when the execution task finishes.
                drop(permit);
            });
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let Some(presence) = self.queue.presence() else {
            return;
        };
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs_f64(
                self.config.worker_presence_refresh_s,
            ))
            .await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = presence
                .refresh_worker(&self.worker_id, self.config.worker_presence_ttl_s)
                .await
            {
                warn!(%err, worker_id = %short(&self.worker_id), "Worker presence heartbeat failed");
            }
        }
    }
}

fn short(worker_id: &str) -> &str {
    &worker_id[..worker_id.len().min(8)]
}

/// Bounded-concurrency consumer loop over a task queue.
pub struct TaskWorker {
    inner: Arc<WorkerInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaskWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWorker")
            .field("worker_id", &short(&self.inner.worker_id))
            .finish_non_exhaustive()
    }
}

impl TaskWorker {
    /// Create a builder over a queue.
    #[must_use]
    pub fn builder(queue: Arc<dyn TaskQueue>) -> TaskWorkerBuilder {
        TaskWorkerBuilder {
            queue,
            agents: HashMap::new(),
            runner: None,
            contracts: Vec::new(),
            job_handlers: HashMap::new(),
            retry_policies: HashMap::new(),
            metrics: None,
            config: TaskWorkerConfig::default(),
            on_complete: None,
            on_failure: None,
        }
    }

    /// This worker's id (used for presence tracking).
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Whether the worker loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the worker loop in the background.
    ///
    /// Validates presence configuration (only when the queue tracks
    /// workers), registers presence, runs startup in-flight recovery, and
    /// spawns the dispatcher and heartbeat tasks.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::configuration("TaskWorker is already running"));
        }

        if self.inner.queue.presence().is_some() {
            let config = &self.inner.config;
            if config.worker_presence_ttl_s <= 0.0 {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(Error::configuration("worker_presence_ttl_s must be > 0"));
            }
            if config.worker_presence_refresh_s <= 0.0 {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(Error::configuration("worker_presence_refresh_s must be > 0"));
            }
            if config.worker_presence_refresh_s >= config.worker_presence_ttl_s {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(Error::configuration(
                    "worker_presence_refresh_s must be less than worker_presence_ttl_s",
                ));
            }
        }

        if let Some(presence) = self.inner.queue.presence()
            && let Err(err) = presence
                .register_worker(
                    &self.inner.worker_id,
                    self.inner.config.worker_presence_ttl_s,
                )
                .await
        {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(err);
        }

        if self.inner.config.recover_inflight_on_startup
            && let Some(recovery) = self.inner.queue.recovery()
        {
            match recovery
                .recover_inflight_if_idle(&self.inner.worker_id)
                .await
            {
                Ok(moved) if moved > 0 => {
                    self.inner
                        .metrics
                        .incr("queue_worker_recovered_inflight_total", moved as u64);
                    info!(
                        moved,
                        worker_id = %short(&self.inner.worker_id),
                        "Recovered in-flight task(s) on startup",
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "Startup in-flight recovery failed");
                }
            }
        }

        let dispatcher = tokio::spawn(Arc::clone(&self.inner).dispatch_loop());
        *self.dispatcher.lock().await = Some(dispatcher);
        if self.inner.queue.presence().is_some() {
            let heartbeat = tokio::spawn(Arc::clone(&self.inner).heartbeat_loop());
            *self.heartbeat.lock().await = Some(heartbeat);
        }

        info!(
            max_concurrent = self.inner.config.max_concurrent_tasks,
            poll_s = self.inner.config.poll_interval_s,
            worker_id = %short(&self.inner.worker_id),
            "TaskWorker started",
        );
        Ok(())
    }

    /// Gracefully shut down: stop the dispatcher, wait for in-flight tasks
    /// up to the shutdown timeout, cancel survivors, unregister presence.
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        if let Some(heartbeat) = self.heartbeat.lock().await.take() {
            heartbeat.abort();
            let _ = heartbeat.await;
        }
        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            dispatcher.abort();
            let _ = dispatcher.await;
        }

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs_f64(self.inner.config.shutdown_timeout_s);
        let mut active = self.inner.active.lock().await;
        if !active.is_empty() {
            info!(active = active.len(), "Waiting for active tasks...");
        }
        loop {
            if active.is_empty() {
                break;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                active.abort_all();
                while active.join_next().await.is_some() {}
                break;
            }
            match tokio::time::timeout(remaining, active.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    active.abort_all();
                    while active.join_next().await.is_some() {}
                    break;
                }
            }
        }
        drop(active);

        if let Some(presence) = self.inner.queue.presence()
            && let Err(err) = presence.unregister_worker(&self.inner.worker_id).await
        {
            warn!(%err, "Failed to unregister worker presence on shutdown");
        }
        info!(worker_id = %short(&self.inner.worker_id), "TaskWorker shut down");
    }
}
