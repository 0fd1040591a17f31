//! Provider abstraction — create/update/delete/describe per resource kind.
//!
//! Concrete cloud providers are external collaborators; the engine only ever
//! speaks this trait. The crate ships an in-memory provider (tests) and a
//! file-backed local provider (CLI simulation runs).

pub mod local;
pub mod memory;

use crate::core::types::Attributes;
use async_trait::async_trait;
use thiserror::Error;

/// Provider call failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("no resource with physical id '{0}'")]
    NotFound(String),

    #[error("provider call failed: {0}")]
    CallFailed(String),

    #[error("provider call timed out after {seconds:.1}s")]
    Timeout { seconds: f64 },
}

/// A freshly created resource: provider-assigned physical id plus the
/// attributes it publishes.
#[derive(Debug, Clone)]
pub struct CreatedResource {
    pub physical_id: String,
    pub attributes: Attributes,
}

/// Abstract provisioning capability. The engine never assumes provider
/// semantics beyond these four operations.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Create a resource of the given kind from fully resolved properties.
    async fn create(
        &self,
        resource_type: &str,
        properties: &Attributes,
    ) -> Result<CreatedResource, ProviderError>;

    /// Update an existing resource in place, returning its new attributes.
    async fn update(
        &self,
        physical_id: &str,
        resource_type: &str,
        properties: &Attributes,
    ) -> Result<Attributes, ProviderError>;

    /// Delete a resource.
    async fn delete(&self, physical_id: &str) -> Result<(), ProviderError>;

    /// Fetch the current attributes of a resource.
    async fn describe(&self, physical_id: &str) -> Result<Attributes, ProviderError>;
}
