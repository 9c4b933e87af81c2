//! GT-030: Provider call interface and the per-type provider registry.
//!
//! A provider owns the control plane for one or more resource types. Every
//! call may complete immediately or hand back a token to poll; either way it
//! may signal `Throttled` (retried by the engine) or `Permanent`.
//! Resources owned elsewhere are read through [`CachedReads`], once per
//! reconciliation pass.

pub mod local;

pub use local::LocalCloud;

use crate::core::error::GantryError;
use crate::core::retry::{call_with_retry, Backoff};
use crate::core::types::{Outputs, ResourceType};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

/// Plaintext properties sent with a provider call.
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Result of a finished provider operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutput {
    pub provider_id: String,
    pub outputs: Outputs,
}

/// A provider call either finished or is still running.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Done(ProviderOutput),
    InProgress { token: String },
}

/// Provider-side failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("{0}")]
    Permanent(String),
}

/// Control plane for resource types.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Create a resource. `name` is the logical name, used for autonaming.
    async fn create(
        &self,
        resource_type: ResourceType,
        name: &str,
        properties: &Properties,
    ) -> Result<Completion, ProviderError>;

    /// Update a resource in place.
    async fn update(
        &self,
        resource_type: ResourceType,
        provider_id: &str,
        properties: &Properties,
    ) -> Result<Completion, ProviderError>;

    /// Delete a resource. Deleting an id that no longer exists succeeds.
    async fn delete(
        &self,
        resource_type: ResourceType,
        provider_id: &str,
    ) -> Result<Completion, ProviderError>;

    /// Whether a provider-assigned identifier still exists.
    async fn exists(&self, resource_type: ResourceType, provider_id: &str)
        -> Result<bool, ProviderError>;

    /// Current outputs of an existing resource; `None` if there is no
    /// resource of that type under the id.
    async fn read(&self, resource_type: ResourceType, provider_id: &str)
        -> Result<Option<Outputs>, ProviderError>;

    /// Poll a long-running operation.
    async fn poll(&self, token: &str) -> Result<Completion, ProviderError>;
}

/// Routes each resource type to its provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ResourceType, Arc<dyn Provider>>,
    fallback: Option<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// One provider for every type.
    pub fn uniform(provider: Arc<dyn Provider>) -> Self {
        Self {
            providers: HashMap::new(),
            fallback: Some(provider),
        }
    }

    /// Route one type to a dedicated provider.
    pub fn with(mut self, resource_type: ResourceType, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(resource_type, provider);
        self
    }

    pub fn get(&self, resource_type: ResourceType) -> Result<Arc<dyn Provider>, GantryError> {
        self.providers
            .get(&resource_type)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| GantryError::Config(format!("no provider for {}", resource_type)))
    }
}

type CachedRead = Result<Outputs, String>;

/// Per-pass cache of live reads. Throttling is retried with backoff; the
/// final outcome, success or failure, is cached.
pub struct CachedReads {
    providers: ProviderRegistry,
    backoff: Backoff,
    cells: Mutex<HashMap<(ResourceType, String), Arc<OnceCell<CachedRead>>>>,
}

impl CachedReads {
    pub fn new(providers: ProviderRegistry, backoff: Backoff) -> Self {
        Self {
            providers,
            backoff,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Outputs of an existing resource. The error is a human-readable reason.
    pub async fn read(&self, resource_type: ResourceType, provider_id: &str) -> CachedRead {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                cells
                    .entry((resource_type, provider_id.to_string()))
                    .or_default(),
            )
        };
        cell.get_or_init(|| self.fetch(resource_type, provider_id))
            .await
            .clone()
    }

    async fn fetch(&self, resource_type: ResourceType, provider_id: &str) -> CachedRead {
        let provider = self.providers.get(resource_type).map_err(|e| e.to_string())?;
        match call_with_retry(self.backoff, || provider.read(resource_type, provider_id)).await {
            Ok((Some(outputs), _)) => Ok(outputs),
            Ok((None, _)) => Err(format!("{} '{}' does not exist", resource_type, provider_id)),
            Err(e) => Err(e.to_string()),
        }
    }
}
