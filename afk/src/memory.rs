//! Memory store capability surface.
//!
//! The runtime persists run events, checkpoint/runtime state keys, and
//! long-term memory records through the [`MemoryStore`] trait. Concrete
//! backends (sqlite, redis, postgres) are external collaborators; the core
//! ships the in-memory implementation used by default and in tests.

pub mod compaction;
pub mod factory;
pub mod in_memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// One persisted run event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// Unique event identifier.
    pub id: String,
    /// Thread the event belongs to.
    pub thread_id: String,
    /// Event type tag (run lifecycle type, `trace`, etc.).
    #[serde(rename = "type")]
    pub event_type: String,
    /// JSON event payload.
    pub data: Value,
    /// Optional user attribution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Emission timestamp in epoch milliseconds.
    pub timestamp_ms: i64,
}

/// One long-term memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Stable record identifier (upsert key).
    pub id: String,
    /// Text content.
    pub text: String,
    /// JSON-safe metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Optional embedding vector for similarity search.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Last-update timestamp in epoch milliseconds.
    pub updated_at_ms: i64,
}

/// Optional capability flags advertised by a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCapabilities {
    /// Upserts are atomic (no read-modify-write races).
    pub atomic_upsert: bool,
}

/// Persistence surface consumed by the run executor and checkpoint journal.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Capability flags for this store.
    fn capabilities(&self) -> MemoryCapabilities {
        MemoryCapabilities::default()
    }

    /// Append one event to a thread's event log.
    async fn append_event(&self, event: MemoryEvent) -> Result<()>;

    /// Return up to `limit` most recent events for a thread, oldest first.
    async fn get_recent_events(&self, thread_id: &str, limit: usize) -> Result<Vec<MemoryEvent>>;

    /// Return events with `timestamp_ms >= since_ms`, oldest first.
    async fn get_events_since(
        &self,
        thread_id: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<MemoryEvent>>;

    /// Replace a thread's entire event log (used by compaction).
    async fn replace_thread_events(&self, thread_id: &str, events: Vec<MemoryEvent>) -> Result<()>;

    /// Read one state key.
    async fn get_state(&self, thread_id: &str, key: &str) -> Result<Option<Value>>;

    /// Write one state key.
    async fn put_state(&self, thread_id: &str, key: &str, value: Value) -> Result<()>;

    /// List all state keys for a thread.
    async fn list_state(&self, thread_id: &str) -> Result<BTreeMap<String, Value>>;

    /// Delete one state key.
    async fn delete_state(&self, thread_id: &str, key: &str) -> Result<()>;

    /// Insert or update one long-term memory record.
    async fn upsert_memory(&self, record: MemoryRecord) -> Result<()>;

    /// Text search over long-term memory.
    async fn search_memory_text(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>>;

    /// Vector similarity search over long-term memory. Returns
    /// `(score, record)` pairs, best first.
    async fn search_memory_vector(
        &self,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<(f64, MemoryRecord)>>;
}
