//! Memory backend selection from environment variables.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::memory::MemoryStore;
use crate::memory::in_memory::InMemoryMemoryStore;

/// Environment variable selecting the memory backend.
pub const MEMORY_BACKEND_ENV: &str = "AFK_MEMORY_BACKEND";

/// Create a memory store from `AFK_MEMORY_BACKEND`.
///
/// Only `in_memory` ships with the core runtime; `sqlite`, `redis`, and
/// `postgres` name external backends that must be wired in by the embedding
/// application, so selecting one here is a configuration error.
pub fn memory_store_from_env() -> Result<Arc<dyn MemoryStore>> {
    let backend = std::env::var(MEMORY_BACKEND_ENV)
        .unwrap_or_else(|_| "in_memory".to_owned())
        .trim()
        .to_lowercase();

    match backend.as_str() {
        "" | "in_memory" | "inmemory" | "mem" | "memory" => {
            Ok(Arc::new(InMemoryMemoryStore::new()))
        }
        "sqlite" | "redis" | "postgres" => Err(Error::configuration(format!(
            "memory backend '{backend}' requires an external MemoryStore implementation"
        ))),
        other => Err(Error::configuration(format!(
            "Unknown {MEMORY_BACKEND_ENV}: {other}"
        ))),
    }
}
