//! In-memory memory store.
//!
//! Default backend for single-process systems and tests. All tables live
//! behind a single lock; contents are lost on process exit.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{MemoryCapabilities, MemoryEvent, MemoryRecord, MemoryStore};
use crate::error::Result;

#[derive(Default)]
struct Tables {
    events: HashMap<String, Vec<MemoryEvent>>,
    state: HashMap<String, BTreeMap<String, Value>>,
    records: BTreeMap<String, MemoryRecord>,
}

/// In-process [`MemoryStore`] implementation.
#[derive(Default)]
pub struct InMemoryMemoryStore {
    tables: Mutex<Tables>,
}

impl std::fmt::Debug for InMemoryMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMemoryStore").finish_non_exhaustive()
    }
}

impl InMemoryMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    fn capabilities(&self) -> MemoryCapabilities {
        MemoryCapabilities {
            atomic_upsert: true,
        }
    }

    async fn append_event(&self, event: MemoryEvent) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables
            .events
            .entry(event.thread_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn get_recent_events(&self, thread_id: &str, limit: usize) -> Result<Vec<MemoryEvent>> {
        let tables = self.tables.lock().await;
        let events = tables.events.get(thread_id).cloned().unwrap_or_default();
        let start = events.len().saturating_sub(limit);
        Ok(events[start..].to_vec())
    }

    async fn get_events_since(
        &self,
        thread_id: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<MemoryEvent>> {
        let tables = self.tables.lock().await;
        let events = tables
            .events
            .get(thread_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|event| event.timestamp_ms >= since_ms)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(events)
    }

    async fn replace_thread_events(&self, thread_id: &str, events: Vec<MemoryEvent>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.events.insert(thread_id.to_owned(), events);
        Ok(())
    }

    async fn get_state(&self, thread_id: &str, key: &str) -> Result<Option<Value>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .state
            .get(thread_id)
            .and_then(|keys| keys.get(key))
            .cloned())
    }

    async fn put_state(&self, thread_id: &str, key: &str, value: Value) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables
            .state
            .entry(thread_id.to_owned())
            .or_default()
            .insert(key.to_owned(), value);
        Ok(())
    }

    async fn list_state(&self, thread_id: &str) -> Result<BTreeMap<String, Value>> {
        let tables = self.tables.lock().await;
        Ok(tables.state.get(thread_id).cloned().unwrap_or_default())
    }

    async fn delete_state(&self, thread_id: &str, key: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(keys) = tables.state.get_mut(thread_id) {
            keys.remove(key);
        }
        Ok(())
    }

    async fn upsert_memory(&self, record: MemoryRecord) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn search_memory_text(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        let needle = query.to_lowercase();
        let tables = self.tables.lock().await;
        Ok(tables
            .records
            .values()
            .filter(|record| record.text.to_lowercase().contains(&needle))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn search_memory_vector(
        &self,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<(f64, MemoryRecord)>> {
        let tables = self.tables.lock().await;
        let mut scored: Vec<(f64, MemoryRecord)> = tables
            .records
            .values()
            .filter_map(|record| {
                record
                    .embedding
                    .as_ref()
                    .map(|embedding| (cosine_similarity(vector, embedding), record.clone()))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::now_ms;

    fn event(thread: &str, id: &str, event_type: &str) -> MemoryEvent {
        MemoryEvent {
            id: id.to_owned(),
            thread_id: thread.to_owned(),
            event_type: event_type.to_owned(),
            data: Value::Null,
            user_id: None,
            timestamp_ms: now_ms(),
        }
    }

    #[tokio::test]
    async fn replace_with_recent_events_is_identity() {
        let store = InMemoryMemoryStore::new();
        for index in 0..5 {
            store
                .append_event(event("t1", &format!("e{index}"), "message"))
                .await
                .unwrap();
        }
        let all = store.get_recent_events("t1", usize::MAX).await.unwrap();
        store
            .replace_thread_events("t1", all.clone())
            .await
            .unwrap();
        let again = store.get_recent_events("t1", usize::MAX).await.unwrap();
        assert_eq!(all, again);
    }

    #[tokio::test]
    async fn state_round_trip() {
        let store = InMemoryMemoryStore::new();
        store
            .put_state("t1", "k1", Value::from(42))
            .await
            .unwrap();
        assert_eq!(
            store.get_state("t1", "k1").await.unwrap(),
            Some(Value::from(42))
        );
        store.delete_state("t1", "k1").await.unwrap();
        assert_eq!(store.get_state("t1", "k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn vector_search_ranks_by_similarity() {
        let store = InMemoryMemoryStore::new();
        for (id, embedding) in [
            ("a", vec![1.0f32, 0.0]),
            ("b", vec![0.0f32, 1.0]),
            ("c", vec![0.7f32, 0.7]),
        ] {
            store
                .upsert_memory(MemoryRecord {
                    id: id.to_owned(),
                    text: id.to_owned(),
                    metadata: serde_json::Map::new(),
                    embedding: Some(embedding),
                    updated_at_ms: now_ms(),
                })
                .await
                .unwrap();
        }
        let hits = store.search_memory_vector(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].1.id, "a");
        assert_eq!(hits[1].1.id, "c");
    }
}
