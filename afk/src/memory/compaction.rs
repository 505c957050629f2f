//! Memory retention and compaction.
//!
//! Compaction bounds a thread's stored history: the event log is trimmed to
//! a retention policy (protected event types are always preserved), and
//! checkpoint/effect state keys are pruned so only the most recent runs and
//! their relevant frames survive. Keys that do not match a recognized
//! pattern pass through untouched.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;
use tracing::info;

use crate::checkpoint::{latest_key, parse_effect_key, parse_frame_key, parse_latest_key};
use crate::error::Result;
use crate::memory::{MemoryEvent, MemoryStore};

/// Event retention rules for one thread.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Maximum events retained per thread.
    pub max_events_per_thread: usize,
    /// Event types that are always preserved (still count toward the cap).
    pub keep_event_types: Vec<String>,
    /// Upper bound on how many recent events compaction fetches.
    pub scan_limit: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_events_per_thread: 5000,
            keep_event_types: vec!["trace".to_owned()],
            scan_limit: 20_000,
        }
    }
}

/// Retention rules for checkpoint and runtime state keys.
#[derive(Debug, Clone)]
pub struct StateRetentionPolicy {
    /// Keep metadata for up to this many most-recent runs.
    pub max_runs: usize,
    /// Most-recent `runtime_state` frames kept per run.
    pub max_runtime_states_per_run: usize,
    /// Most-recent effect entries kept per run.
    pub max_effect_entries_per_run: usize,
    /// Checkpoint phases always retained for kept runs.
    pub always_keep_phases: Vec<String>,
    /// State-key prefixes always retained.
    pub keep_state_prefixes: Vec<String>,
}

impl Default for StateRetentionPolicy {
    fn default() -> Self {
        Self {
            max_runs: 100,
            max_runtime_states_per_run: 3,
            max_effect_entries_per_run: 3000,
            always_keep_phases: vec![
                "run_terminal".to_owned(),
                "runtime_state".to_owned(),
                "pre_tool_batch".to_owned(),
                "post_tool_batch".to_owned(),
                "pre_llm".to_owned(),
                "post_llm".to_owned(),
                "run_started".to_owned(),
                "paused".to_owned(),
                "resumed".to_owned(),
            ],
            keep_state_prefixes: Vec::new(),
        }
    }
}

/// Summary returned by [`compact_thread_memory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionSummary {
    /// Events before compaction.
    pub events_before: usize,
    /// Events after compaction.
    pub events_after: usize,
    /// Events removed.
    pub events_removed: usize,
    /// State keys before compaction.
    pub state_keys_before: usize,
    /// State keys selected for retention.
    pub state_keys_after: usize,
    /// State keys selected for removal.
    pub state_keys_removed: usize,
    /// State keys actually deleted from the store.
    pub state_keys_removed_effective: usize,
}

/// Produce the bounded, prioritized event list to retain for a thread.
///
/// Protected event types are always preserved; the most recent remaining
/// events fill the budget. The result is sorted oldest first.
#[must_use]
pub fn apply_event_retention(
    events: &[MemoryEvent],
    policy: &RetentionPolicy,
) -> Vec<MemoryEvent> {
    if events.is_empty() {
        return Vec::new();
    }
    let protected: HashSet<&str> = policy
        .keep_event_types
        .iter()
        .map(String::as_str)
        .collect();

    let preserved: Vec<MemoryEvent> = events
        .iter()
        .filter(|event| protected.contains(event.event_type.as_str()))
        .cloned()
        .collect();
    if preserved.len() >= policy.max_events_per_thread {
        let start = preserved.len() - policy.max_events_per_thread;
        return preserved[start..].to_vec();
    }

    let remainder: Vec<MemoryEvent> = events
        .iter()
        .filter(|event| !protected.contains(event.event_type.as_str()))
        .cloned()
        .collect();
    let budget = policy.max_events_per_thread - preserved.len();
    let start = remainder.len().saturating_sub(budget);

    let mut retained: Vec<MemoryEvent> = preserved;
    retained.extend_from_slice(&remainder[start..]);
    retained.sort_by_key(|event| event.timestamp_ms);
    retained
}

fn extract_timestamp_ms(value: &Value) -> i64 {
    value
        .get("timestamp_ms")
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn extract_step(value: &Value) -> Option<u64> {
    value.get("step").and_then(Value::as_u64)
}

fn extract_phase(value: &Value) -> Option<&str> {
    value.get("phase").and_then(Value::as_str)
}

/// Filter checkpoint/runtime state keys according to `policy`, returning the
/// subset to keep.
#[must_use]
pub fn apply_state_retention(
    state: &BTreeMap<String, Value>,
    policy: &StateRetentionPolicy,
) -> BTreeMap<String, Value> {
    if state.is_empty() {
        return BTreeMap::new();
    }

    let always_keep: HashSet<&str> = policy
        .always_keep_phases
        .iter()
        .map(String::as_str)
        .collect();

    // (timestamp, run_id, payload) per latest pointer.
    let mut latest_rows: Vec<(i64, String, Value)> = Vec::new();
    // run_id -> (step, phase, key) frame rows.
    let mut frame_rows: HashMap<String, Vec<(u64, String, String)>> = HashMap::new();
    // run_id -> (step, key) effect rows.
    let mut effect_rows: HashMap<String, Vec<(u64, String)>> = HashMap::new();
    let mut keep: HashSet<String> = HashSet::new();

    for (key, value) in state {
        if let Some(run_id) = parse_latest_key(key) {
            latest_rows.push((extract_timestamp_ms(value), run_id.to_owned(), value.clone()));
        } else if let Some((run_id, step, phase)) = parse_frame_key(key) {
            frame_rows.entry(run_id.to_owned()).or_default().push((
                step,
                phase.to_owned(),
                key.clone(),
            ));
        } else if let Some((run_id, step)) = parse_effect_key(key) {
            effect_rows
                .entry(run_id.to_owned())
                .or_default()
                .push((step, key.clone()));
        } else {
            // Unrecognized keys pass through.
            keep.insert(key.clone());
        }
    }

    for prefix in &policy.keep_state_prefixes {
        for key in state.keys() {
            if key.starts_with(prefix) {
                keep.insert(key.clone());
            }
        }
    }

    latest_rows.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    let kept_runs: HashSet<&str> = latest_rows
        .iter()
        .take(policy.max_runs.max(1))
        .map(|(_, run_id, _)| run_id.as_str())
        .collect();

    for (_, run_id, payload) in &latest_rows {
        if !kept_runs.contains(run_id.as_str()) {
            continue;
        }
        let pointer = latest_key(run_id);
        if state.contains_key(&pointer) {
            keep.insert(pointer);
        }

        let latest_step = extract_step(payload);
        let latest_phase = extract_phase(payload).unwrap_or("");
        if let Some(step) = latest_step
            && !latest_phase.is_empty()
        {
            let boundary = format!("checkpoint:{run_id}:{step}:{latest_phase}");
            if state.contains_key(&boundary) {
                keep.insert(boundary);
            }
        }

        let Some(rows) = frame_rows.get(run_id) else {
            continue;
        };

        let mut runtime_rows: Vec<&(u64, String, String)> =
            rows.iter().filter(|row| row.1 == "runtime_state").collect();
        runtime_rows.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.2.cmp(&b.2)));
        for row in runtime_rows
            .iter()
            .take(policy.max_runtime_states_per_run.max(1))
        {
            keep.insert(row.2.clone());
        }

        for (step, phase, key) in rows {
            if phase == "run_terminal" || always_keep.contains(phase.as_str()) {
                keep.insert(key.clone());
            }
            if latest_step == Some(*step) {
                keep.insert(key.clone());
            }
        }
    }

    for run_id in &kept_runs {
        let mut rows: Vec<&(u64, String)> = effect_rows
            .get(*run_id)
            .map(|rows| rows.iter().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        for row in rows.iter().take(policy.max_effect_entries_per_run.max(1)) {
            keep.insert(row.1.clone());
        }
    }

    state
        .iter()
        .filter(|(key, _)| keep.contains(*key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Compact one thread: trim events, prune state keys, persist the result.
pub async fn compact_thread_memory(
    memory: &dyn MemoryStore,
    thread_id: &str,
    event_policy: Option<RetentionPolicy>,
    state_policy: Option<StateRetentionPolicy>,
) -> Result<CompactionSummary> {
    let event_policy = event_policy.unwrap_or_default();
    let state_policy = state_policy.unwrap_or_default();

    let events = memory
        .get_recent_events(thread_id, event_policy.scan_limit)
        .await?;
    let retained_events = apply_event_retention(&events, &event_policy);

    let before_ids: Vec<&str> = events.iter().map(|event| event.id.as_str()).collect();
    let after_ids: Vec<&str> = retained_events
        .iter()
        .map(|event| event.id.as_str())
        .collect();
    if before_ids != after_ids {
        memory
            .replace_thread_events(thread_id, retained_events.clone())
            .await?;
    }

    let state = memory.list_state(thread_id).await?;
    let retained_state = apply_state_retention(&state, &state_policy);
    let removed: Vec<&String> = state
        .keys()
        .filter(|key| !retained_state.contains_key(*key))
        .collect();

    let mut removed_effective = 0usize;
    for key in &removed {
        memory.delete_state(thread_id, key).await?;
        removed_effective += 1;
    }

    let summary = CompactionSummary {
        events_before: events.len(),
        events_after: retained_events.len(),
        events_removed: events.len().saturating_sub(retained_events.len()),
        state_keys_before: state.len(),
        state_keys_after: retained_state.len(),
        state_keys_removed: state.len().saturating_sub(retained_state.len()),
        state_keys_removed_effective: removed_effective,
    };
    info!(
        thread_id,
        events_removed = summary.events_removed,
        state_keys_removed = summary.state_keys_removed,
        "Thread memory compacted",
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::in_memory::InMemoryMemoryStore;

    fn event(id: &str, event_type: &str, ts: i64) -> MemoryEvent {
        MemoryEvent {
            id: id.to_owned(),
            thread_id: "t1".to_owned(),
            event_type: event_type.to_owned(),
            data: Value::Null,
            user_id: None,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn protected_types_survive_retention() {
        let events: Vec<MemoryEvent> = (0..10)
            .map(|index| {
                let event_type = if index == 0 { "trace" } else { "message" };
                event(&format!("e{index}"), event_type, index)
            })
            .collect();
        let policy = RetentionPolicy {
            max_events_per_thread: 3,
            ..RetentionPolicy::default()
        };
        let retained = apply_event_retention(&events, &policy);
        assert_eq!(retained.len(), 3);
        assert!(retained.iter().any(|e| e.event_type == "trace"));
        assert_eq!(retained.last().unwrap().id, "e9");
    }

    #[test]
    fn state_retention_keeps_recent_runs_and_terminals() {
        let mut state = BTreeMap::new();
        for (run, ts) in [("r-old", 100), ("r-new", 200)] {
            state.insert(
                format!("checkpoint:{run}:latest"),
                serde_json::json!({"run_id": run, "step": 1, "phase": "run_terminal", "timestamp_ms": ts}),
            );
            state.insert(
                format!("checkpoint:{run}:1:run_terminal"),
                serde_json::json!({"run_id": run, "step": 1, "phase": "run_terminal", "timestamp_ms": ts}),
            );
        }
        state.insert("custom:key".to_owned(), Value::from(1));

        let policy = StateRetentionPolicy {
            max_runs: 1,
            ..StateRetentionPolicy::default()
        };
        let retained = apply_state_retention(&state, &policy);
        assert!(retained.contains_key("checkpoint:r-new:latest"));
        assert!(retained.contains_key("checkpoint:r-new:1:run_terminal"));
        assert!(!retained.contains_key("checkpoint:r-old:latest"));
        // Unrecognized keys pass through.
        assert!(retained.contains_key("custom:key"));
    }

    #[test]
    fn runtime_state_frames_are_bounded() {
        let mut state = BTreeMap::new();
        state.insert(
            "checkpoint:r1:latest".to_owned(),
            serde_json::json!({"run_id": "r1", "step": 5, "phase": "runtime_state", "timestamp_ms": 50}),
        );
        for step in 1..=5u64 {
            state.insert(
                format!("checkpoint:r1:{step}:runtime_state"),
                serde_json::json!({"run_id": "r1", "step": step, "phase": "runtime_state"}),
            );
        }
        let policy = StateRetentionPolicy {
            max_runtime_states_per_run: 2,
            always_keep_phases: vec!["run_terminal".to_owned()],
            ..StateRetentionPolicy::default()
        };
        let retained = apply_state_retention(&state, &policy);
        let runtime_frames = retained
            .keys()
            .filter(|key| key.ends_with(":runtime_state") && key.starts_with("checkpoint:r1:"))
            .count();
        // Two most-recent frames plus the latest-step boundary frame.
        assert_eq!(runtime_frames, 2);
    }

    #[tokio::test]
    async fn compact_reports_counts() {
        let store = InMemoryMemoryStore::new();
        for index in 0..10 {
            store
                .append_event(event(&format!("e{index}"), "message", index))
                .await
                .unwrap();
        }
        let policy = RetentionPolicy {
            max_events_per_thread: 4,
            ..RetentionPolicy::default()
        };
        let summary = compact_thread_memory(&store, "t1", Some(policy), None)
            .await
            .unwrap();
        assert_eq!(summary.events_before, 10);
        assert_eq!(summary.events_after, 4);
        assert_eq!(summary.events_removed, 6);
        let remaining = store.get_recent_events("t1", usize::MAX).await.unwrap();
        assert_eq!(remaining.len(), 4);
    }
}
