//! In-memory provider for tests: deterministic physical ids, per-operation
//! call counters, failure injection, and an optional per-call delay.

use super::{CreatedResource, Provider, ProviderError};
use crate::core::types::Attributes;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredResource {
    resource_type: String,
    attributes: Attributes,
}

/// Per-operation call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
    pub describes: u64,
}

#[derive(Default)]
struct Inner {
    seq: u64,
    records: IndexMap<String, StoredResource>,
    fail_create_types: HashSet<String>,
    fail_delete_types: HashSet<String>,
    deleted: Vec<String>,
    counts: CallCounts,
}

/// In-memory provider. Physical ids are `<type>-<seq>`; attributes echo the
/// resolved properties plus an `id` attribute.
#[derive(Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    delay: Option<Duration>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call (timeout and cancellation tests).
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            delay: Some(delay),
        }
    }

    /// Inject a failure into every `create` of the given resource type.
    pub fn fail_creates(&self, resource_type: &str) {
        self.lock().fail_create_types.insert(resource_type.to_string());
    }

    /// Inject a failure into every `delete` of the given resource type.
    pub fn fail_deletes(&self, resource_type: &str) {
        self.lock().fail_delete_types.insert(resource_type.to_string());
    }

    pub fn counts(&self) -> CallCounts {
        self.lock().counts
    }

    /// Physical ids currently provisioned, in creation order.
    pub fn physical_ids(&self) -> Vec<String> {
        self.lock().records.keys().cloned().collect()
    }

    /// Physical ids deleted so far, in deletion order.
    pub fn deleted_ids(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    pub fn contains(&self, physical_id: &str) -> bool {
        self.lock().records.contains_key(physical_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn maybe_sleep(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
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
impl Provider for MemoryProvider {
    async fn create(
        &self,
        resource_type: &str,
        properties: &Attributes,
    ) -> Result<CreatedResource, ProviderError> {
        self.maybe_sleep().await;
        let mut inner = self.lock();
        inner.counts.creates += 1;

        if inner.fail_create_types.contains(resource_type) {
            return Err(ProviderError::CallFailed(format!(
                "injected failure creating {resource_type}"
            )));
        }

        inner.seq += 1;
        let physical_id = format!("{}-{:04}", resource_type, inner.seq);
        let attributes = published_attributes(&physical_id, properties);
        inner.records.insert(
            physical_id.clone(),
            StoredResource {
                resource_type: resource_type.to_string(),
                attributes: attributes.clone(),
            },
        );

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
        self.maybe_sleep().await;
        let mut inner = self.lock();
        inner.counts.updates += 1;

        if !inner.records.contains_key(physical_id) {
            return Err(ProviderError::NotFound(physical_id.to_string()));
        }
        let attributes = published_attributes(physical_id, properties);
        inner.records.insert(
            physical_id.to_string(),
            StoredResource {
                resource_type: resource_type.to_string(),
                attributes: attributes.clone(),
            },
        );
        Ok(attributes)
    }

    async fn delete(&self, physical_id: &str) -> Result<(), ProviderError> {
        self.maybe_sleep().await;
        let mut inner = self.lock();
        inner.counts.deletes += 1;

        let Some(record) = inner.records.get(physical_id) else {
            return Err(ProviderError::NotFound(physical_id.to_string()));
        };
        if inner.fail_delete_types.contains(&record.resource_type) {
            let resource_type = record.resource_type.clone();
            return Err(ProviderError::CallFailed(format!(
                "injected failure deleting {resource_type}"
            )));
        }

        inner.records.shift_remove(physical_id);
        inner.deleted.push(physical_id.to_string());
        Ok(())
    }

    async fn describe(&self, physical_id: &str) -> Result<Attributes, ProviderError> {
        self.maybe_sleep().await;
        let mut inner = self.lock();
        inner.counts.describes += 1;

        inner
            .records
            .get(physical_id)
            .map(|r| r.attributes.clone())
            .ok_or_else(|| ProviderError::NotFound(physical_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    serde_yaml_ng::Value::String(v.to_string()),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_create_assigns_sequential_ids() {
        let p = MemoryProvider::new();
        let a = p.create("storage_bucket", &props(&[])).await.unwrap();
        let b = p.create("storage_bucket", &props(&[])).await.unwrap();
        assert_eq!(a.physical_id, "storage_bucket-0001");
        assert_eq!(b.physical_id, "storage_bucket-0002");
    }

    #[tokio::test]
    async fn test_attributes_echo_properties_plus_id() {
        let p = MemoryProvider::new();
        let created = p
            .create("storage_bucket", &props(&[("bucket_name", "site-dev")]))
            .await
            .unwrap();
        assert_eq!(
            created.attributes["id"],
            serde_yaml_ng::Value::String(created.physical_id.clone())
        );
        assert_eq!(
            created.attributes["bucket_name"],
            serde_yaml_ng::Value::String("site-dev".into())
        );
    }

    #[tokio::test]
    async fn test_describe_and_delete() {
        let p = MemoryProvider::new();
        let created = p.create("dns_record", &props(&[])).await.unwrap();
        assert!(p.describe(&created.physical_id).await.is_ok());

        p.delete(&created.physical_id).await.unwrap();
        assert_eq!(
            p.describe(&created.physical_id).await.unwrap_err(),
            ProviderError::NotFound(created.physical_id.clone())
        );
        assert_eq!(p.deleted_ids(), vec![created.physical_id]);
    }

    #[tokio::test]
    async fn test_injected_create_failure() {
        let p = MemoryProvider::new();
        p.fail_creates("cdn_distribution");
        let err = p.create("cdn_distribution", &props(&[])).await.unwrap_err();
        assert!(matches!(err, ProviderError::CallFailed(_)));
        // Still counted as a call
        assert_eq!(p.counts().creates, 1);
        assert!(p.physical_ids().is_empty());
    }

    #[tokio::test]
    async fn test_injected_delete_failure_keeps_record() {
        let p = MemoryProvider::new();
        let created = p.create("storage_bucket", &props(&[])).await.unwrap();
        p.fail_deletes("storage_bucket");
        assert!(p.delete(&created.physical_id).await.is_err());
        assert!(p.contains(&created.physical_id));
    }

    #[tokio::test]
    async fn test_update_replaces_attributes() {
        let p = MemoryProvider::new();
        let created = p
            .create("storage_bucket", &props(&[("bucket_name", "old")]))
            .await
            .unwrap();
        let attrs = p
            .update(
                &created.physical_id,
                "storage_bucket",
                &props(&[("bucket_name", "new")]),
            )
            .await
            .unwrap();
        assert_eq!(
            attrs["bucket_name"],
            serde_yaml_ng::Value::String("new".into())
        );
        assert_eq!(p.counts().updates, 1);
    }
}
