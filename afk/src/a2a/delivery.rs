//! Delivery durability stores for A2A dedupe and dead-letter tracking.
//!
//! The success cache is what makes retries safe: the first successful
//! response for an idempotency key is persisted and replayed for every
//! later invocation with the same key. The dead-letter log is append-only.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{DeadLetter, InvocationResponse};
use crate::error::Result;

/// Durability store contract for A2A delivery metadata.
///
/// Distributed implementations must make `record_success` atomic per key;
/// the in-memory store takes a single lock around all mutations.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Return the previously successful response for an idempotency key.
    async fn get_success(&self, idempotency_key: &str) -> Result<Option<InvocationResponse>>;

    /// Record a successful response for dedupe replay.
    async fn record_success(
        &self,
        idempotency_key: &str,
        response: InvocationResponse,
    ) -> Result<()>;

    /// Persist one dead-letter record.
    async fn record_dead_letter(&self, dead_letter: DeadLetter) -> Result<()>;

    /// List accumulated dead-letter records.
    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>>;
}

#[derive(Default)]
struct Tables {
    success: HashMap<String, InvocationResponse>,
    dead_letters: Vec<DeadLetter>,
}

/// In-memory durability store used by default and in tests.
#[derive(Default)]
pub struct InMemoryDeliveryStore {
    tables: Mutex<Tables>,
}

impl std::fmt::Debug for InMemoryDeliveryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDeliveryStore").finish_non_exhaustive()
    }
}

impl InMemoryDeliveryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn get_success(&self, idempotency_key: &str) -> Result<Option<InvocationResponse>> {
        let tables = self.tables.lock().await;
        Ok(tables.success.get(idempotency_key).cloned())
    }

    async fn record_success(
        &self,
        idempotency_key: &str,
        response: InvocationResponse,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.success.insert(idempotency_key.to_owned(), response);
        Ok(())
    }

    async fn record_dead_letter(&self, dead_letter: DeadLetter) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.dead_letters.push(dead_letter);
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let tables = self.tables.lock().await;
        Ok(tables.dead_letters.clone())
    }
}
