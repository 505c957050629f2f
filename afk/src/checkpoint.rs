//! Checkpoint journal.
//!
//! Append-only per-run phase snapshots persisted through the memory store.
//! Two key families:
//!
//! - `checkpoint:{run_id}:latest` — pointer holding the most recent frame
//! - `checkpoint:{run_id}:{step}:{phase}` — one frame per phase boundary
//!
//! Plus an effect journal under `effect:{run_id}:{step}:{effect_id}`.
//! Colons are reserved separators; run/step/phase/effect-id components must
//! not contain them. The frame is written before the latest pointer so the
//! pointer always references an existing frame.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::MemoryStore;
use crate::util::now_ms;

/// Phase boundaries recorded by the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPhase {
    /// Run accepted and started.
    RunStarted,
    /// About to call the model.
    PreLlm,
    /// Model call completed.
    PostLlm,
    /// About to execute a tool batch.
    PreToolBatch,
    /// Tool batch completed.
    PostToolBatch,
    /// Periodic transcript snapshot.
    RuntimeState,
    /// Run paused at a safe boundary.
    Paused,
    /// Run resumed after a pause.
    Resumed,
    /// Terminal result recorded.
    RunTerminal,
}

impl CheckpointPhase {
    /// Stable string form used in state keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::PreLlm => "pre_llm",
            Self::PostLlm => "post_llm",
            Self::PreToolBatch => "pre_tool_batch",
            Self::PostToolBatch => "post_tool_batch",
            Self::RuntimeState => "runtime_state",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::RunTerminal => "run_terminal",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run_started" => Some(Self::RunStarted),
            "pre_llm" => Some(Self::PreLlm),
            "post_llm" => Some(Self::PostLlm),
            "pre_tool_batch" => Some(Self::PreToolBatch),
            "post_tool_batch" => Some(Self::PostToolBatch),
            "runtime_state" => Some(Self::RuntimeState),
            "paused" => Some(Self::Paused),
            "resumed" => Some(Self::Resumed),
            "run_terminal" => Some(Self::RunTerminal),
            _ => None,
        }
    }
}

impl std::fmt::Display for CheckpointPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One checkpoint frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFrame {
    /// Owning run.
    pub run_id: String,
    /// Step index at the boundary.
    pub step: u64,
    /// Phase name.
    pub phase: CheckpointPhase,
    /// Write timestamp in epoch milliseconds.
    pub timestamp_ms: i64,
    /// Compact phase payload (terminal result, transcript snapshot, ...).
    pub payload: Value,
}

/// Build the latest-pointer key for a run.
#[must_use]
pub fn latest_key(run_id: &str) -> String {
    format!("checkpoint:{run_id}:latest")
}

/// Build the frame key for a run/step/phase.
#[must_use]
pub fn frame_key(run_id: &str, step: u64, phase: CheckpointPhase) -> String {
    format!("checkpoint:{run_id}:{step}:{}", phase.as_str())
}

/// Build the effect-journal key for a run/step/effect.
#[must_use]
pub fn effect_key(run_id: &str, step: u64, effect_id: &str) -> String {
    format!("effect:{run_id}:{step}:{effect_id}")
}

/// Reject key components containing the reserved `:` separator.
pub fn validate_key_component(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::configuration(format!("{name} must be non-empty")));
    }
    if value.contains(':') {
        return Err(Error::configuration(format!(
            "{name} must not contain ':' (got '{value}')"
        )));
    }
    Ok(())
}

/// Parse `checkpoint:{run_id}:latest`, returning the run id.
#[must_use]
pub fn parse_latest_key(key: &str) -> Option<&str> {
    let mut parts = key.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("checkpoint"), Some(run_id), Some("latest")) if !run_id.is_empty() => Some(run_id),
        _ => None,
    }
}

/// Parse `checkpoint:{run_id}:{step}:{phase}` into `(run_id, step, phase)`.
#[must_use]
pub fn parse_frame_key(key: &str) -> Option<(&str, u64, &str)> {
    let mut parts = key.splitn(4, ':');
    let (prefix, run_id, step, phase) =
        (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    if prefix != "checkpoint" || run_id.is_empty() || phase.is_empty() {
        return None;
    }
    let step: u64 = step.parse().ok()?;
    Some((run_id, step, phase))
}

/// Parse `effect:{run_id}:{step}:{effect_id}` into `(run_id, step)`.
#[must_use]
pub fn parse_effect_key(key: &str) -> Option<(&str, u64)> {
    let mut parts = key.splitn(4, ':');
    let (prefix, run_id, step, effect_id) =
        (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    if prefix != "effect" || run_id.is_empty() || effect_id.is_empty() {
        return None;
    }
    let step: u64 = step.parse().ok()?;
    Some((run_id, step))
}

/// Per-run journal bound to a memory store and thread.
#[derive(Clone)]
pub struct CheckpointJournal {
    memory: Arc<dyn MemoryStore>,
    thread_id: String,
    run_id: String,
}

impl std::fmt::Debug for CheckpointJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointJournal")
            .field("thread_id", &self.thread_id)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl CheckpointJournal {
    /// Create a journal for one run. Rejects ids containing `:`.
    pub fn new(
        memory: Arc<dyn MemoryStore>,
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Result<Self> {
        let thread_id = thread_id.into();
        let run_id = run_id.into();
        validate_key_component("thread_id", &thread_id)?;
        validate_key_component("run_id", &run_id)?;
        Ok(Self {
            memory,
            thread_id,
            run_id,
        })
    }

    /// The owning run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Write a frame for `step`/`phase`, then swap the latest pointer.
    pub async fn write(&self, step: u64, phase: CheckpointPhase, payload: Value) -> Result<()> {
        let frame = CheckpointFrame {
            run_id: self.run_id.clone(),
            step,
            phase,
            timestamp_ms: now_ms(),
            payload,
        };
        let record = serde_json::to_value(&frame)?;
        self.memory
            .put_state(
                &self.thread_id,
                &frame_key(&self.run_id, step, phase),
                record.clone(),
            )
            .await?;
        self.memory
            .put_state(&self.thread_id, &latest_key(&self.run_id), record)
            .await?;
        debug!(run_id = %self.run_id, step, phase = %phase, "Checkpoint written");
        Ok(())
    }

    /// Read the latest frame, verifying the pointer references an existing
    /// frame record.
    pub async fn latest(&self) -> Result<Option<CheckpointFrame>> {
        let raw = self
            .memory
            .get_state(&self.thread_id, &latest_key(&self.run_id))
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let frame: CheckpointFrame = serde_json::from_value(raw)
            .map_err(|e| Error::checkpoint(format!("invalid latest pointer: {e}")))?;
        let stored = self
            .memory
            .get_state(
                &self.thread_id,
                &frame_key(&self.run_id, frame.step, frame.phase),
            )
            .await?;
        if stored.is_none() {
            return Err(Error::checkpoint(format!(
                "latest pointer for run '{}' references missing frame (step={}, phase={})",
                self.run_id, frame.step, frame.phase
            )));
        }
        Ok(Some(frame))
    }

    /// Read one specific frame.
    pub async fn frame(&self, step: u64, phase: CheckpointPhase) -> Result<Option<CheckpointFrame>> {
        let raw = self
            .memory
            .get_state(&self.thread_id, &frame_key(&self.run_id, step, phase))
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
            None => Ok(None),
        }
    }

    /// Append an effect-journal entry. Effect ids must not contain `:`.
    pub async fn record_effect(&self, step: u64, effect_id: &str, payload: Value) -> Result<()> {
        validate_key_component("effect_id", effect_id)?;
        self.memory
            .put_state(
                &self.thread_id,
                &effect_key(&self.run_id, step, effect_id),
                payload,
            )
            .await
    }
}
