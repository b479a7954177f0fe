//! Persistence seam for execution records.

use super::record::ExecutionRecord;
use crate::errors::StorageError;
use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

/// Where execution records are kept.
///
/// Every lookup is scoped to a tenant: a record owned by another tenant is
/// reported exactly like a missing one.
#[async_trait]
pub trait ExecutionRecordStore: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Inserts or replaces a record.
    async fn save(&self, record: &ExecutionRecord) -> Result<(), StorageError>;

    /// Loads a record.
    async fn get(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, StorageError>;

    /// Lists a project's records, newest first.
    async fn list_for_project(
        &self,
        tenant_id: &str,
        project_id: &str,
    ) -> Result<Vec<ExecutionRecord>, StorageError>;

    /// Removes a record. Returns false if it did not exist for the tenant.
    async fn delete(&self, tenant_id: &str, execution_id: Uuid) -> Result<bool, StorageError>;
}

/// Process-local record store.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: DashMap<Uuid, ExecutionRecord>,
}

impl InMemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records across tenants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ExecutionRecordStore for InMemoryRecordStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn save(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        self.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, StorageError> {
        Ok(self
            .records
            .get(&execution_id)
            .filter(|r| r.tenant_id == tenant_id)
            .map(|r| r.value().clone()))
    }

    async fn list_for_project(
        &self,
        tenant_id: &str,
        project_id: &str,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        let mut records: Vec<ExecutionRecord> = self
            .records
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.project_id == project_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(records)
    }

    async fn delete(&self, tenant_id: &str, execution_id: Uuid) -> Result<bool, StorageError> {
        Ok(self
            .records
            .remove_if(&execution_id, |_, r| r.tenant_id == tenant_id)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AgentType;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_save_and_get_is_tenant_scoped() {
        let store = InMemoryRecordStore::new();
        let record = ExecutionRecord::new("shop", "acme", vec![AgentType::Backend]);
        assert_ok!(store.save(&record).await);

        let found = store.get("acme", record.id).await.unwrap();
        assert_eq!(found.map(|r| r.id), Some(record.id));
        assert!(store.get("globex", record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_for_project_newest_first() {
        let store = InMemoryRecordStore::new();
        let first = ExecutionRecord::new("shop", "acme", vec![AgentType::Backend]);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = ExecutionRecord::new("shop", "acme", vec![AgentType::Backend]);
        let other = ExecutionRecord::new("blog", "acme", vec![AgentType::Backend]);
        for r in [&first, &second, &other] {
            store.save(r).await.unwrap();
        }

        let ids: Vec<Uuid> = store
            .list_for_project("acme", "shop")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn test_delete_respects_tenant() {
        let store = InMemoryRecordStore::new();
        let record = ExecutionRecord::new("shop", "acme", vec![AgentType::Backend]);
        store.save(&record).await.unwrap();

        assert!(!store.delete("globex", record.id).await.unwrap());
        assert!(store.delete("acme", record.id).await.unwrap());
        assert!(store.is_empty());
    }
}
