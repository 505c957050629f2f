//! Run executor.
//!
//! The [`Runner`] drives an [`Agent`] through its step loop:
//!
//! 1. Resolve the effective instruction text
//! 2. Call the model transport with the current transcript and tools
//! 3. Execute policy-approved tool calls (bounded parallelism)
//! 4. Route and fan out subagents through the delegation engine
//! 5. Checkpoint the phase boundary and loop
//!
//! Every run executes in its own task behind a [`RunHandle`] exposing the
//! ordered event stream plus pause / resume / cancel / interrupt controls.
//! Phase boundaries are checkpointed so runs can resume from the latest
//! frame; terminal results are recorded in a `run_terminal` frame.

mod executor;
mod handle;
mod result;
mod subagents;

pub use handle::RunHandle;
pub use result::{AgentResult, SubagentExecutionRecord, UsageAggregate};

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::agent::Agent;
use crate::checkpoint::{CheckpointJournal, CheckpointPhase, parse_frame_key};
use crate::delegation::scheduler::{DelegationScheduler, SchedulerLimits};
use crate::error::{Error, Result};
use crate::event::{EventSink, RunEventType};
use crate::instructions::InstructionStore;
use crate::interaction::{DecisionKind, HeadlessInteractionProvider, InteractionProvider};
use crate::memory::compaction::{
    CompactionSummary, RetentionPolicy, StateRetentionPolicy, compact_thread_memory,
};
use crate::memory::in_memory::InMemoryMemoryStore;
use crate::memory::MemoryStore;
use crate::policy::PolicyEngine;
use crate::tool::ToolExecutionRecord;

use handle::{ResultSlot, RunControl};

/// Runner-level configuration shared by all runs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Global cap on concurrently running subagent nodes.
    pub max_parallel_subagents_global: usize,
    /// Per-parent cap on concurrently running subagent nodes.
    pub max_parallel_subagents_per_parent: usize,
    /// Per-target-agent cap across concurrent delegations.
    pub max_parallel_subagents_per_target_agent: usize,
    /// Delegation ready-queue back-pressure limit.
    pub subagent_queue_backpressure_limit: usize,
    /// How long to wait for a deferred approval, in seconds.
    pub approval_timeout_s: f64,
    /// How long to wait for deferred user input, in seconds.
    pub input_timeout_s: f64,
    /// Decision applied when a deferred approval times out.
    pub approval_fallback: DecisionKind,
    /// Decision applied when deferred user input times out.
    pub input_fallback: DecisionKind,
    /// Prompts root for file-based instructions.
    pub prompts_dir: Option<PathBuf>,
    /// Optional user id attached to persisted events.
    pub user_id: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel_subagents_global: 16,
            max_parallel_subagents_per_parent: 4,
            max_parallel_subagents_per_target_agent: 2,
            subagent_queue_backpressure_limit: 64,
            approval_timeout_s: 300.0,
            input_timeout_s: 300.0,
            approval_fallback: DecisionKind::Deny,
            input_fallback: DecisionKind::Deny,
            prompts_dir: None,
            user_id: None,
        }
    }
}

/// Periodic transcript snapshot persisted under `runtime_state` frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct RuntimeSnapshot {
    pub step: u64,
    pub transcript: Vec<crate::message::Message>,
    pub usage: UsageAggregate,
    pub llm_calls: u32,
    pub tool_calls_made: u32,
    #[serde(default)]
    pub total_cost_usd: f64,
    pub tool_executions: Vec<ToolExecutionRecord>,
    pub subagent_executions: Vec<SubagentExecutionRecord>,
}

/// Internal per-run options threaded through `spawn_run`.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunOptions {
    pub user_message: Option<String>,
    pub context: Map<String, Value>,
    pub thread_id: Option<String>,
    pub depth: u32,
    pub lineage: Vec<u64>,
    pub resume_run_id: Option<String>,
    pub resume_snapshot: Option<RuntimeSnapshot>,
}

pub(crate) struct RunnerCore {
    pub(crate) memory: Arc<dyn MemoryStore>,
    pub(crate) interaction: Arc<dyn InteractionProvider>,
    pub(crate) policy_engine: Option<Arc<PolicyEngine>>,
    pub(crate) scheduler: Arc<DelegationScheduler>,
    pub(crate) instructions: InstructionStore,
    pub(crate) config: RunnerConfig,
}

impl RunnerCore {
    /// Start one run task and return its handle.
    pub(crate) fn spawn_run(
        self: &Arc<Self>,
        agent: Arc<Agent>,
        options: RunOptions,
    ) -> Result<Arc<RunHandle>> {
        let run_id = options
            .resume_run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let thread_id = options
            .thread_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        crate::checkpoint::validate_key_component("run_id", &run_id)?;
        crate::checkpoint::validate_key_component("thread_id", &thread_id)?;

        let (sink, events) = EventSink::new(
            Some(Arc::clone(&self.memory)),
            self.config.user_id.clone(),
        );
        let control = Arc::new(RunControl::default());
        let slot = Arc::new(ResultSlot::default());
        let handle = Arc::new(RunHandle::new(
            run_id.clone(),
            thread_id.clone(),
            Arc::clone(&control),
            events,
            Arc::clone(&slot),
        ));

        let task = tokio::spawn(executor::execute(
            Arc::clone(self),
            agent,
            options,
            run_id,
            thread_id,
            sink,
            control,
            slot,
        ));
        handle.attach_task(task);
        Ok(handle)
    }
}

/// Event stream item produced by [`Runner::run_stream`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum StreamEvent {
    /// Assistant text produced by a completed model call.
    TextDelta(String),
    /// A tool started executing.
    ToolStarted {
        /// Tool name.
        name: String,
    },
    /// A tool finished executing.
    ToolCompleted {
        /// Tool name.
        name: String,
        /// Whether it succeeded.
        success: bool,
        /// Output payload, when present.
        output: Option<Value>,
        /// Error message, when failed.
        error: Option<String>,
    },
    /// A loop step started.
    StepStarted {
        /// Step index.
        step: u64,
    },
    /// The run failed or was interrupted.
    Error(String),
    /// Terminal result.
    Completed(Box<AgentResult>),
}

/// Builder for [`Runner`].
pub struct RunnerBuilder {
    memory: Option<Arc<dyn MemoryStore>>,
    interaction: Option<Arc<dyn InteractionProvider>>,
    policy_engine: Option<Arc<PolicyEngine>>,
    config: RunnerConfig,
}

impl std::fmt::Debug for RunnerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerBuilder").finish_non_exhaustive()
    }
}

impl RunnerBuilder {
    /// Set the memory store (defaults to in-memory).
    #[must_use]
    pub fn memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Set the interaction provider (defaults to headless with the
    /// configured fallbacks).
    #[must_use]
    pub fn interaction(mut self, interaction: Arc<dyn InteractionProvider>) -> Self {
        self.interaction = Some(interaction);
        self
    }

    /// Set the runner-level policy engine.
    #[must_use]
    pub fn policy_engine(mut self, engine: Arc<PolicyEngine>) -> Self {
        self.policy_engine = Some(engine);
        self
    }

    /// Override the runner configuration.
    #[must_use]
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the runner.
    pub fn build(self) -> Result<Runner> {
        let config = self.config;
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(InMemoryMemoryStore::new()));
        let interaction = self.interaction.unwrap_or_else(|| {
            Arc::new(HeadlessInteractionProvider::new(
                config.approval_fallback,
                config.input_fallback,
            ))
        });
        let instructions = InstructionStore::new(config.prompts_dir.clone())?;
        let scheduler = Arc::new(DelegationScheduler::new(SchedulerLimits {
            max_parallel_global: config.max_parallel_subagents_global,
            max_parallel_per_parent: config.max_parallel_subagents_per_parent,
            max_parallel_per_target: config.max_parallel_subagents_per_target_agent,
            backpressure_limit: config.subagent_queue_backpressure_limit,
        }));
        Ok(Runner {
            core: Arc::new(RunnerCore {
                memory,
                interaction,
                policy_engine: self.policy_engine,
                scheduler,
                instructions,
                config,
            }),
        })
    }
}

/// Public runner API: start, resume, stream, and compact agent runs.
#[derive(Clone)]
pub struct Runner {
    core: Arc<RunnerCore>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner").finish_non_exhaustive()
    }
}

impl Runner {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> RunnerBuilder {
        RunnerBuilder {
            memory: None,
            interaction: None,
            policy_engine: None,
            config: RunnerConfig::default(),
        }
    }

    /// Create a runner with default configuration.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// The memory store backing this runner.
    #[must_use]
    pub fn memory(&self) -> &Arc<dyn MemoryStore> {
        &self.core.memory
    }

    /// Execute an agent run and wait for its terminal result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when the run is cancelled before
    /// producing a result.
    pub async fn run(
        &self,
        agent: Arc<Agent>,
        user_message: Option<String>,
        context: Option<Map<String, Value>>,
        thread_id: Option<String>,
    ) -> Result<AgentResult> {
        let handle = self.run_handle(agent, user_message, context, thread_id)?;
        handle.await_result().await.ok_or(Error::Cancelled)
    }

    /// Start an agent run and return a live handle.
    pub fn run_handle(
        &self,
        agent: Arc<Agent>,
        user_message: Option<String>,
        context: Option<Map<String, Value>>,
        thread_id: Option<String>,
    ) -> Result<Arc<RunHandle>> {
        self.core.spawn_run(
            agent,
            RunOptions {
                user_message,
                context: context.unwrap_or_default(),
                thread_id,
                ..RunOptions::default()
            },
        )
    }

    /// Resume a checkpointed run and wait for its terminal result.
    pub async fn resume(
        &self,
        agent: Arc<Agent>,
        run_id: &str,
        thread_id: &str,
        context: Option<Map<String, Value>>,
    ) -> Result<AgentResult> {
        let handle = self.resume_handle(agent, run_id, thread_id, context).await?;
        handle.await_result().await.ok_or(Error::Cancelled)
    }

    /// Resume a checkpointed run and return a live handle.
    ///
    /// When the latest checkpoint already holds a terminal result, the
    /// returned handle is pre-resolved with it and nothing re-executes.
    pub async fn resume_handle(
        &self,
        agent: Arc<Agent>,
        run_id: &str,
        thread_id: &str,
        context: Option<Map<String, Value>>,
    ) -> Result<Arc<RunHandle>> {
        if run_id.trim().is_empty() {
            return Err(Error::configuration("run_id must be a non-empty string"));
        }
        if thread_id.trim().is_empty() {
            return Err(Error::configuration("thread_id must be a non-empty string"));
        }

        let journal =
            CheckpointJournal::new(Arc::clone(&self.core.memory), thread_id, run_id)?;
        let latest = journal.latest().await?.ok_or_else(|| {
            Error::checkpoint(format!(
                "No checkpoint found for run_id={run_id} thread_id={thread_id}"
            ))
        })?;

        if latest.phase == CheckpointPhase::RunTerminal
            && let Some(terminal) = latest.payload.get("terminal_result")
        {
            let result: AgentResult = serde_json::from_value(terminal.clone())
                .map_err(|e| Error::checkpoint(format!("invalid terminal result: {e}")))?;
            info!(run_id, thread_id, "Resume served from terminal checkpoint");
            return Ok(RunHandle::resolved(
                run_id.to_owned(),
                thread_id.to_owned(),
                result,
            ));
        }

        let snapshot = self.load_latest_runtime_snapshot(run_id, thread_id).await?;
        self.core.spawn_run(
            agent,
            RunOptions {
                user_message: None,
                context: context.unwrap_or_default(),
                thread_id: Some(thread_id.to_owned()),
                resume_run_id: Some(run_id.to_owned()),
                resume_snapshot: snapshot,
                ..RunOptions::default()
            },
        )
    }

    async fn load_latest_runtime_snapshot(
        &self,
        run_id: &str,
        thread_id: &str,
    ) -> Result<Option<RuntimeSnapshot>> {
        let state = self.core.memory.list_state(thread_id).await?;
        let mut best: Option<(u64, RuntimeSnapshot)> = None;
        for (key, value) in &state {
            let Some((frame_run, step, phase)) = parse_frame_key(key) else {
                continue;
            };
            if frame_run != run_id || phase != "runtime_state" {
                continue;
            }
            let Some(payload) = value.get("payload") else {
                continue;
            };
            let Ok(snapshot) = serde_json::from_value::<RuntimeSnapshot>(payload.clone()) else {
                continue;
            };
            if best.as_ref().is_none_or(|(best_step, _)| step > *best_step) {
                best = Some((step, snapshot));
            }
        }
        Ok(best.map(|(_, snapshot)| snapshot))
    }

    /// Start a run and adapt its event stream into [`StreamEvent`]s.
    pub fn run_stream(
        &self,
        agent: Arc<Agent>,
        user_message: Option<String>,
        context: Option<Map<String, Value>>,
        thread_id: Option<String>,
    ) -> Result<std::pin::Pin<Box<dyn futures::Stream<Item = StreamEvent> + Send>>> {
        let handle = self.run_handle(agent, user_message, context, thread_id)?;
        Ok(Box::pin(async_stream::stream! {
            while let Some(event) = handle.next_event().await {
                match event.event_type {
                    RunEventType::LlmCompleted => {
                        if let Some(text) = event.data.get("text").and_then(Value::as_str)
                            && !text.is_empty()
                        {
                            yield StreamEvent::TextDelta(text.to_owned());
                        }
                    }
                    RunEventType::ToolBatchStarted => {
                        if let Some(names) = event.data.get("tool_names").and_then(Value::as_array)
                        {
                            for name in names {
                                if let Some(name) = name.as_str() {
                                    yield StreamEvent::ToolStarted {
                                        name: name.to_owned(),
                                    };
                                }
                            }
                        }
                    }
                    RunEventType::ToolCompleted => {
                        yield StreamEvent::ToolCompleted {
                            name: event
                                .data
                                .get("tool_name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_owned(),
                            success: event
                                .data
                                .get("success")
                                .and_then(Value::as_bool)
                                .unwrap_or(false),
                            output: event.data.get("output").cloned(),
                            error: event
                                .data
                                .get("error")
                                .and_then(Value::as_str)
                                .map(str::to_owned),
                        };
                    }
                    RunEventType::StepStarted => {
                        yield StreamEvent::StepStarted {
                            step: event.step.unwrap_or(0),
                        };
                    }
                    RunEventType::RunFailed | RunEventType::RunInterrupted => {
                        let message = event
                            .message
                            .clone()
                            .or_else(|| {
                                event
                                    .data
                                    .get("error")
                                    .and_then(Value::as_str)
                                    .map(str::to_owned)
                            })
                            .unwrap_or_else(|| event.event_type.to_string());
                        yield StreamEvent::Error(message);
                    }
                    _ => {}
                }
            }
            if let Some(result) = handle.await_result().await {
                yield StreamEvent::Completed(Box::new(result));
            }
        }))
    }

    /// Compact retained memory records for a thread.
    pub async fn compact_thread(
        &self,
        thread_id: &str,
        event_policy: Option<RetentionPolicy>,
        state_policy: Option<StateRetentionPolicy>,
    ) -> Result<CompactionSummary> {
        if thread_id.trim().is_empty() {
            return Err(Error::configuration("thread_id must be a non-empty string"));
        }
        compact_thread_memory(
            self.core.memory.as_ref(),
            thread_id,
            event_policy,
            state_policy,
        )
        .await
    }
}
