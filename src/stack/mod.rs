//! GT-040: Cross-system references.
//!
//! A stack consumes outputs published by independently deployed stacks
//! through the injected [`StackResolver`] capability. Within one
//! reconciliation pass every lookup goes through [`CachedStacks`], so a
//! given `(system, output)` pair is resolved once.

pub mod file;

pub use file::FileStackResolver;

use crate::core::error::GantryError;
use crate::core::retry::Backoff;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

/// Answer to a cross-system lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum StackLookup {
    Value(serde_json::Value),
    /// The system or its output does not exist
    NotFound,
    /// The system is mid-deployment; ask again later
    Pending,
}

/// `resolve(systemId, outputKey) -> value | NotFound | Pending`.
#[async_trait]
pub trait StackResolver: Send + Sync {
    async fn resolve(&self, system_id: &str, output_key: &str) -> Result<StackLookup, GantryError>;
}

#[derive(Debug, Clone)]
struct StaticEntry {
    pending: u32,
    value: Option<serde_json::Value>,
}

/// In-memory stack outputs.
#[derive(Debug, Default)]
pub struct StaticStackResolver {
    entries: Mutex<HashMap<(String, String), StaticEntry>>,
    calls: Mutex<u32>,
}

impl StaticStackResolver {
    pub fn with(self, system_id: &str, output_key: &str, value: serde_json::Value) -> Self {
        self.insert(system_id, output_key, 0, Some(value));
        self
    }

    /// Answer `Pending` `times` times before yielding the value, or forever
    /// when `value` is `None`.
    pub fn pending(self, system_id: &str, output_key: &str, times: u32, value: Option<serde_json::Value>) -> Self {
        self.insert(system_id, output_key, times, value);
        self
    }

    fn insert(&self, system_id: &str, output_key: &str, pending: u32, value: Option<serde_json::Value>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (system_id.to_string(), output_key.to_string()),
                StaticEntry { pending, value },
            );
    }

    /// Number of `resolve` calls made.
    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StackResolver for StaticStackResolver {
    async fn resolve(&self, system_id: &str, output_key: &str) -> Result<StackLookup, GantryError> {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get_mut(&(system_id.to_string(), output_key.to_string())) else {
            return Ok(StackLookup::NotFound);
        };
        match &entry.value {
            None => Ok(StackLookup::Pending),
            Some(_) if entry.pending > 0 => {
                entry.pending -= 1;
                Ok(StackLookup::Pending)
            }
            Some(v) => Ok(StackLookup::Value(v.clone())),
        }
    }
}

type CachedLookup = Result<serde_json::Value, String>;

/// Per-pass cache over a stack resolver. `Pending` answers are retried with
/// backoff; the final outcome, success or failure, is cached.
pub struct CachedStacks {
    inner: Arc<dyn StackResolver>,
    backoff: Backoff,
    cells: Mutex<HashMap<(String, String), Arc<OnceCell<CachedLookup>>>>,
}

impl CachedStacks {
    pub fn new(inner: Arc<dyn StackResolver>, backoff: Backoff) -> Self {
        Self {
            inner,
            backoff,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve an output. The error is a human-readable reason.
    pub async fn lookup(&self, system_id: &str, output_key: &str) -> CachedLookup {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                cells
                    .entry((system_id.to_string(), output_key.to_string()))
                    .or_default(),
            )
        };
        cell.get_or_init(|| self.fetch(system_id, output_key))
            .await
            .clone()
    }

    async fn fetch(&self, system_id: &str, output_key: &str) -> CachedLookup {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.resolve(system_id, output_key).await {
                Ok(StackLookup::Value(v)) => return Ok(v),
                Ok(StackLookup::NotFound) => {
                    return Err(format!("system '{}' has no output '{}'", system_id, output_key))
                }
                Err(e) => return Err(e.to_string()),
                Ok(StackLookup::Pending) if attempt >= self.backoff.max_attempts => {
                    return Err(format!(
                        "system '{}' still pending after {} attempt(s)",
                        system_id, attempt
                    ))
                }
                Ok(StackLookup::Pending) => {
                    tracing::debug!(system_id, output_key, attempt, "stack output pending");
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                }
            }
        }
    }
}
