//! File-backed local provider — simulation target for CLI runs.
//!
//! Persists a YAML inventory under the state directory so repeated
//! invocations observe what earlier runs provisioned. No real infrastructure
//! is touched; this plays the role the local transport plays for on-host
//! execution.

use super::{CreatedResource, Provider, ProviderError};
use crate::core::types::Attributes;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InventoryRecord {
    #[serde(rename = "type")]
    resource_type: String,
    attributes: Attributes,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Inventory {
    #[serde(default)]
    seq: u64,
    #[serde(default)]
    resources: IndexMap<String, InventoryRecord>,
}

/// Provider that records resources in `<root>/provider.inventory.yaml`.
pub struct LocalProvider {
    path: PathBuf,
    // Serializes read-modify-write cycles across concurrent workers
    guard: Mutex<()>,
}

impl LocalProvider {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join("provider.inventory.yaml"),
            guard: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<Inventory, ProviderError> {
        if !self.path.exists() {
            return Ok(Inventory::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| ProviderError::CallFailed(format!("read inventory: {e}")))?;
        serde_yaml_ng::from_str(&content)
            .map_err(|e| ProviderError::CallFailed(format!("parse inventory: {e}")))
    }

    fn save(&self, inventory: &Inventory) -> Result<(), ProviderError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProviderError::CallFailed(format!("create inventory dir: {e}")))?;
        }
        let yaml = serde_yaml_ng::to_string(inventory)
            .map_err(|e| ProviderError::CallFailed(format!("serialize inventory: {e}")))?;
        let tmp = self.path.with_extension("yaml.tmp");
        std::fs::write(&tmp, yaml)
            .map_err(|e| ProviderError::CallFailed(format!("write inventory: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| ProviderError::CallFailed(format!("rename inventory: {e}")))?;
        Ok(())
    }
}

fn published_attributes(physical_id: &str, properties: &Attributes) -> Attributes {
    let mut attributes = IndexMap::new();
    attributes.insert(
        "id".to_string(),
        serde_yaml_ng::Value::String(physical_id.to_string()),
    );
    for (k, v) in properties {
        attributes.insert(k.clone(), v.clone());
    }
    attributes
}

#[async_trait]
impl Provider for LocalProvider {
    async fn create(
        &self,
        resource_type: &str,
        properties: &Attributes,
    ) -> Result<CreatedResource, ProviderError> {
        let _guard = self.guard.lock().await;
        let mut inventory = self.load()?;

        inventory.seq += 1;
        let physical_id = format!("{}-{:04}", resource_type, inventory.seq);
        let attributes = published_attributes(&physical_id, properties);
        inventory.resources.insert(
            physical_id.clone(),
            InventoryRecord {
                resource_type: resource_type.to_string(),
                attributes: attributes.clone(),
            },
        );
        self.save(&inventory)?;

        Ok(CreatedResource {
            physical_id,
            attributes,
        })
    }

    async fn update(
        &self,
        physical_id: &str,
        resource_type: &str,
        properties: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        let _guard = self.guard.lock().await;
        let mut inventory = self.load()?;

        if !inventory.resources.contains_key(physical_id) {
            return Err(ProviderError::NotFound(physical_id.to_string()));
        }
        let attributes = published_attributes(physical_id, properties);
        inventory.resources.insert(
            physical_id.to_string(),
            InventoryRecord {
                resource_type: resource_type.to_string(),
                attributes: attributes.clone(),
            },
        );
        self.save(&inventory)?;
        Ok(attributes)
    }

    async fn delete(&self, physical_id: &str) -> Result<(), ProviderError> {
        let _guard = self.guard.lock().await;
        let mut inventory = self.load()?;

        if inventory.resources.shift_remove(physical_id).is_none() {
            return Err(ProviderError::NotFound(physical_id.to_string()));
        }
        self.save(&inventory)
    }

    async fn describe(&self, physical_id: &str) -> Result<Attributes, ProviderError> {
        let _guard = self.guard.lock().await;
        let inventory = self.load()?;
        inventory
            .resources
            .get(physical_id)
            .map(|r| r.attributes.clone())
            .ok_or_else(|| ProviderError::NotFound(physical_id.to_string()))
    }
}
