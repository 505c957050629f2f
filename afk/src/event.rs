//! Run lifecycle events.
//!
//! Every observable transition in a run is emitted as a typed [`RunEvent`]:
//! pushed to the run handle's subscriber queue in emission order and, when a
//! memory store is attached, persisted to the thread's event log.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::memory::{MemoryEvent, MemoryStore};
use crate::util::now_ms;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, not yet running.
    Pending,
    /// Executing steps.
    Running,
    /// Suspended at a safe boundary.
    Paused,
    /// Cancel requested, winding down.
    Cancelling,
    /// Terminal: cancelled by the user.
    Cancelled,
    /// Terminal: partial output with recovered failures.
    Degraded,
    /// Terminal: no usable output.
    Failed,
    /// Terminal: success.
    Completed,
}

impl RunState {
    /// Whether the state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Degraded | Self::Failed | Self::Completed
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Typed run lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum RunEventType {
    /// Run accepted and started.
    RunStarted,
    /// A loop step started.
    StepStarted,
    /// A policy decision was made.
    PolicyDecision,
    /// A model call is being made.
    LlmCalled,
    /// A model call completed.
    LlmCompleted,
    /// A tool batch is starting.
    ToolBatchStarted,
    /// One tool execution completed.
    ToolCompleted,
    /// A subagent invocation started.
    SubagentStarted,
    /// A subagent invocation completed.
    SubagentCompleted,
    /// The run paused.
    RunPaused,
    /// The run resumed.
    RunResumed,
    /// The run was cancelled.
    RunCancelled,
    /// The run was interrupted.
    RunInterrupted,
    /// The run failed.
    RunFailed,
    /// The run completed.
    RunCompleted,
    /// A non-fatal anomaly worth surfacing.
    Warning,
}

impl std::fmt::Display for RunEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RunStarted => "run_started",
            Self::StepStarted => "step_started",
            Self::PolicyDecision => "policy_decision",
            Self::LlmCalled => "llm_called",
            Self::LlmCompleted => "llm_completed",
            Self::ToolBatchStarted => "tool_batch_started",
            Self::ToolCompleted => "tool_completed",
            Self::SubagentStarted => "subagent_started",
            Self::SubagentCompleted => "subagent_completed",
            Self::RunPaused => "run_paused",
            Self::RunResumed => "run_resumed",
            Self::RunCancelled => "run_cancelled",
            Self::RunInterrupted => "run_interrupted",
            Self::RunFailed => "run_failed",
            Self::RunCompleted => "run_completed",
            Self::Warning => "warning",
        };
        f.write_str(name)
    }
}

/// One event emitted during run execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Event schema version.
    pub schema_version: String,
    /// Event category.
    #[serde(rename = "type")]
    pub event_type: RunEventType,
    /// Owning run.
    pub run_id: String,
    /// Owning thread.
    pub thread_id: String,
    /// Run state at emission.
    pub state: RunState,
    /// Loop step index, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
    /// Optional human-readable message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Structured event payload.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl RunEvent {
    /// Create an event with schema version v1.
    #[must_use]
    pub fn new(
        event_type: RunEventType,
        run_id: impl Into<String>,
        thread_id: impl Into<String>,
        state: RunState,
    ) -> Self {
        Self {
            schema_version: "v1".to_owned(),
            event_type,
            run_id: run_id.into(),
            thread_id: thread_id.into(),
            state,
            step: None,
            message: None,
            data: Map::new(),
        }
    }

    /// Attach the step index.
    #[must_use]
    pub const fn with_step(mut self, step: u64) -> Self {
        self.step = Some(step);
        self
    }

    /// Attach a human-readable message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach structured payload data.
    #[must_use]
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }
}

/// Sink that delivers events to the handle's subscriber queue and persists
/// them when a memory store is attached.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RunEvent>,
    memory: Option<Arc<dyn MemoryStore>>,
    user_id: Option<String>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("persists", &self.memory.is_some())
            .finish_non_exhaustive()
    }
}

impl EventSink {
    /// Create a sink. Returns the sink and the subscriber side of the queue.
    #[must_use]
    pub fn new(
        memory: Option<Arc<dyn MemoryStore>>,
        user_id: Option<String>,
    ) -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                memory,
                user_id,
            },
            rx,
        )
    }

    /// Emit one event: enqueue for subscribers, then persist.
    pub async fn emit(&self, event: RunEvent) {
        // Subscribers may have hung up; persistence still proceeds.
        let _ = self.tx.send(event.clone());

        if let Some(memory) = &self.memory {
            let data = serde_json::to_value(&event).unwrap_or(Value::Null);
            let record = MemoryEvent {
                id: uuid::Uuid::new_v4().to_string(),
                thread_id: event.thread_id.clone(),
                event_type: event.event_type.to_string(),
                data,
                user_id: self.user_id.clone(),
                timestamp_ms: now_ms(),
            };
            if let Err(error) = memory.append_event(record).await {
                warn!(%error, run_id = %event.run_id, "Failed to persist run event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::in_memory::InMemoryMemoryStore;

    #[tokio::test]
    async fn events_reach_subscribers_in_order() {
        let (sink, mut rx) = EventSink::new(None, None);
        for event_type in [
            RunEventType::RunStarted,
            RunEventType::StepStarted,
            RunEventType::RunCompleted,
        ] {
            sink.emit(RunEvent::new(event_type, "r1", "t1", RunState::Running))
                .await;
        }
        assert_eq!(rx.recv().await.unwrap().event_type, RunEventType::RunStarted);
        assert_eq!(
            rx.recv().await.unwrap().event_type,
            RunEventType::StepStarted
        );
        assert_eq!(
            rx.recv().await.unwrap().event_type,
            RunEventType::RunCompleted
        );
    }

    #[tokio::test]
    async fn events_persist_to_memory() {
        let memory = Arc::new(InMemoryMemoryStore::new());
        let (sink, _rx) = EventSink::new(Some(memory.clone()), Some("u1".into()));
        sink.emit(RunEvent::new(
            RunEventType::RunStarted,
            "r1",
            "t1",
            RunState::Running,
        ))
        .await;
        let events = memory.get_recent_events("t1", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "run_started");
        assert_eq!(events[0].user_id.as_deref(), Some("u1"));
    }
}
