//! In-process store used by tests and local runs without a database.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use unisync_core::{
    Connection, CustomFieldMapping, EntityType, LinkedAccount, Project, Provider, RawPayload,
    StoredCustomValue, StoredRecord, Tenant,
};
use uuid::Uuid;

use crate::{AccountDirectory, PersistenceError, RecordStore, RecordTransaction};

/// Write step at which an injected failure fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    RecordWrite,
    CustomFields,
    RawPayload,
}

type RecordKey = (EntityType, Uuid, String);

#[derive(Debug, Default)]
struct Directory {
    tenants: Vec<Tenant>,
    projects: Vec<Project>,
    linked_accounts: Vec<LinkedAccount>,
    connections: Vec<Connection>,
    mappings: Vec<CustomFieldMapping>,
}

#[derive(Debug, Default)]
struct Records {
    rows: HashMap<Uuid, StoredRecord>,
    keys: HashMap<RecordKey, Uuid>,
    custom_values: HashMap<(Uuid, Uuid), StoredCustomValue>,
    raw_payloads: HashMap<Uuid, RawPayload>,
    failures: HashSet<(FailurePoint, String)>,
}

impl Records {
    fn upsert_row(&mut self, record: StoredRecord) -> StoredRecord {
        let key = (record.entity_type, record.id_connection, record.remote_id.clone());
        let persisted = match self.keys.get(&key).and_then(|id| self.rows.get(id)) {
            Some(existing) if existing.id != record.id => StoredRecord {
                id: existing.id,
                created_at: existing.created_at,
                ..record
            },
            _ => record,
        };
        self.keys.insert(key, persisted.id);
        self.rows.insert(persisted.id, persisted.clone());
        persisted
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    directory: Arc<RwLock<Directory>>,
    records: Arc<Mutex<Records>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_tenant(&self, tenant: Tenant) {
        self.directory.write().await.tenants.push(tenant);
    }

    pub async fn add_project(&self, project: Project) {
        self.directory.write().await.projects.push(project);
    }

    pub async fn add_linked_account(&self, account: LinkedAccount) {
        self.directory.write().await.linked_accounts.push(account);
    }

    pub async fn add_connection(&self, connection: Connection) {
        self.directory.write().await.connections.push(connection);
    }

    /// Adds a mapping, replacing any mapping with the same (slug, linked user, entity type).
    pub async fn put_mapping(&self, mapping: CustomFieldMapping) {
        let mut dir = self.directory.write().await;
        dir.mappings.retain(|m| {
            !(m.slug == mapping.slug
                && m.id_linked_user == mapping.id_linked_user
                && m.entity_type == mapping.entity_type)
        });
        dir.mappings.push(mapping);
    }

    pub async fn remove_mapping(&self, id: Uuid) {
        self.directory.write().await.mappings.retain(|m| m.id != id);
    }

    /// Makes every write at `point` for `remote_id` fail until cleared.
    pub async fn inject_failure(&self, point: FailurePoint, remote_id: impl Into<String>) {
        self.records
            .lock()
            .await
            .failures
            .insert((point, remote_id.into()));
    }

    pub async fn clear_failures(&self) {
        self.records.lock().await.failures.clear();
    }

    pub async fn records(&self, entity_type: EntityType) -> Vec<StoredRecord> {
        let records = self.records.lock().await;
        let mut rows: Vec<_> = records
            .rows
            .values()
            .filter(|r| r.entity_type == entity_type)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        rows
    }

    pub async fn record_count(&self) -> usize {
        self.records.lock().await.rows.len()
    }

    pub async fn stored_custom_values(&self, id_record: Uuid) -> Vec<StoredCustomValue> {
        let records = self.records.lock().await;
        let mut values: Vec<_> = records
            .custom_values
            .values()
            .filter(|v| v.id_record == id_record)
            .cloned()
            .collect();
        values.sort_by_key(|v| v.id_mapping);
        values
    }

    pub async fn stored_raw_payload(&self, id_record: Uuid) -> Option<RawPayload> {
        self.records.lock().await.raw_payloads.get(&id_record).cloned()
    }

    pub async fn raw_payload_count(&self) -> usize {
        self.records.lock().await.raw_payloads.len()
    }
}

#[async_trait]
impl AccountDirectory for MemoryStore {
    async fn tenants(&self, scope: Option<Uuid>) -> Result<Vec<Tenant>, PersistenceError> {
        let dir = self.directory.read().await;
        Ok(dir
            .tenants
            .iter()
            .filter(|t| scope.map_or(true, |id| t.id == id))
            .cloned()
            .collect())
    }

    async fn projects(&self, tenant_id: Uuid) -> Result<Vec<Project>, PersistenceError> {
        let dir = self.directory.read().await;
        Ok(dir
            .projects
            .iter()
            .filter(|p| p.id_tenant == tenant_id)
            .cloned()
            .collect())
    }

    async fn project(&self, project_id: Uuid) -> Result<Option<Project>, PersistenceError> {
        let dir = self.directory.read().await;
        Ok(dir.projects.iter().find(|p| p.id == project_id).cloned())
    }

    async fn linked_accounts(&self, project_id: Uuid) -> Result<Vec<LinkedAccount>, PersistenceError> {
        let dir = self.directory.read().await;
        Ok(dir
            .linked_accounts
            .iter()
            .filter(|l| l.id_project == project_id)
            .cloned()
            .collect())
    }

    async fn linked_account(&self, id: Uuid) -> Result<Option<LinkedAccount>, PersistenceError> {
        let dir = self.directory.read().await;
        Ok(dir.linked_accounts.iter().find(|l| l.id == id).cloned())
    }

    async fn connection(
        &self,
        linked_user_id: Uuid,
        provider: Provider,
    ) -> Result<Option<Connection>, PersistenceError> {
        let dir = self.directory.read().await;
        Ok(dir
            .connections
            .iter()
            .rev()
            .find(|c| c.id_linked_user == linked_user_id && provider.matches_slug(&c.provider_slug))
            .cloned())
    }

    async fn custom_field_mappings(
        &self,
        linked_user_id: Uuid,
        entity_type: EntityType,
    ) -> Result<Vec<CustomFieldMapping>, PersistenceError> {
        let dir = self.directory.read().await;
        Ok(dir
            .mappings
            .iter()
            .filter(|m| m.id_linked_user == linked_user_id && m.entity_type == entity_type)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>, PersistenceError> {
        let guard = self.records.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            guard,
            journal: Vec::new(),
        }))
    }
}

#[derive(Debug)]
enum Pending {
    Record(StoredRecord),
    CustomValue(StoredCustomValue),
    DeleteCustomValue(Uuid),
    RawPayload(RawPayload),
}

/// Holds the record lock for its whole lifetime; writes are journaled and
/// applied on commit.
struct MemoryTransaction {
    guard: OwnedMutexGuard<Records>,
    journal: Vec<Pending>,
}

impl MemoryTransaction {
    fn check(&self, point: FailurePoint, remote_id: &str) -> Result<(), PersistenceError> {
        if self.guard.failures.contains(&(point, remote_id.to_string())) {
            return Err(PersistenceError::Injected {
                point,
                remote_id: remote_id.to_string(),
            });
        }
        Ok(())
    }

    fn pending_record(&self, id: Uuid) -> Option<&StoredRecord> {
        self.journal.iter().rev().find_map(|p| match p {
            Pending::Record(r) if r.id == id => Some(r),
            _ => None,
        })
    }

    fn remote_id_of(&self, id_record: Uuid) -> Option<String> {
        self.pending_record(id_record)
            .or_else(|| self.guard.rows.get(&id_record))
            .map(|r| r.remote_id.clone())
    }
}

#[async_trait]
impl RecordTransaction for MemoryTransaction {
    async fn find_record(
        &mut self,
        entity_type: EntityType,
        id_connection: Uuid,
        remote_id: &str,
    ) -> Result<Option<StoredRecord>, PersistenceError> {
        let pending = self.journal.iter().rev().find_map(|p| match p {
            Pending::Record(r)
                if r.entity_type == entity_type
                    && r.id_connection == id_connection
                    && r.remote_id == remote_id =>
            {
                Some(r.clone())
            }
            _ => None,
        });
        if pending.is_some() {
            return Ok(pending);
        }
        let key = (entity_type, id_connection, remote_id.to_string());
        Ok(self
            .guard
            .keys
            .get(&key)
            .and_then(|id| self.guard.rows.get(id))
            .cloned())
    }

    async fn insert_record(&mut self, record: &StoredRecord) -> Result<StoredRecord, PersistenceError> {
        self.check(FailurePoint::RecordWrite, &record.remote_id)?;
        let persisted = match self
            .find_record(record.entity_type, record.id_connection, &record.remote_id)
            .await?
        {
            Some(existing) => StoredRecord {
                id: existing.id,
                created_at: existing.created_at,
                ..record.clone()
            },
            None => record.clone(),
        };
        self.journal.push(Pending::Record(persisted.clone()));
        Ok(persisted)
    }

    async fn update_record(&mut self, record: &StoredRecord) -> Result<StoredRecord, PersistenceError> {
        self.check(FailurePoint::RecordWrite, &record.remote_id)?;
        if self.pending_record(record.id).is_none() && !self.guard.rows.contains_key(&record.id) {
            return Err(PersistenceError::RecordNotFound { id: record.id });
        }
        self.journal.push(Pending::Record(record.clone()));
        Ok(record.clone())
    }

    async fn custom_values(&mut self, id_record: Uuid) -> Result<Vec<StoredCustomValue>, PersistenceError> {
        let mut values: HashMap<Uuid, StoredCustomValue> = self
            .guard
            .custom_values
            .values()
            .filter(|v| v.id_record == id_record)
            .map(|v| (v.id, v.clone()))
            .collect();
        for pending in &self.journal {
            match pending {
                Pending::CustomValue(v) if v.id_record == id_record => {
                    values.retain(|_, existing| existing.id_mapping != v.id_mapping);
                    values.insert(v.id, v.clone());
                }
                Pending::DeleteCustomValue(id) => {
                    values.remove(id);
                }
                _ => {}
            }
        }
        Ok(values.into_values().collect())
    }

    async fn upsert_custom_value(&mut self, value: &StoredCustomValue) -> Result<(), PersistenceError> {
        if let Some(remote_id) = self.remote_id_of(value.id_record) {
            self.check(FailurePoint::CustomFields, &remote_id)?;
        }
        self.journal.push(Pending::CustomValue(value.clone()));
        Ok(())
    }

    async fn delete_custom_value(&mut self, id: Uuid) -> Result<(), PersistenceError> {
        self.journal.push(Pending::DeleteCustomValue(id));
        Ok(())
    }

    async fn raw_payload(&mut self, id_record: Uuid) -> Result<Option<RawPayload>, PersistenceError> {
        let pending = self.journal.iter().rev().find_map(|p| match p {
            Pending::RawPayload(r) if r.id_record == id_record => Some(r.clone()),
            _ => None,
        });
        Ok(pending.or_else(|| self.guard.raw_payloads.get(&id_record).cloned()))
    }

    async fn upsert_raw_payload(&mut self, payload: &RawPayload) -> Result<(), PersistenceError> {
        if let Some(remote_id) = self.remote_id_of(payload.id_record) {
            self.check(FailurePoint::RawPayload, &remote_id)?;
        }
        self.journal.push(Pending::RawPayload(payload.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        let MemoryTransaction { mut guard, journal } = *self;
        for pending in journal {
            match pending {
                Pending::Record(record) => {
                    guard.upsert_row(record);
                }
                Pending::CustomValue(value) => {
                    let key = (value.id_mapping, value.id_record);
                    let merged = match guard.custom_values.get(&key) {
                        Some(existing) => StoredCustomValue {
                            id: existing.id,
                            created_at: existing.created_at,
                            ..value
                        },
                        None => value,
                    };
                    guard.custom_values.insert(key, merged);
                }
                Pending::DeleteCustomValue(id) => {
                    guard.custom_values.retain(|_, v| v.id != id);
                }
                Pending::RawPayload(payload) => {
                    let merged = match guard.raw_payloads.get(&payload.id_record) {
                        Some(existing) => RawPayload {
                            id: existing.id,
                            created_at: existing.created_at,
                            ..payload
                        },
                        None => payload,
                    };
                    guard.raw_payloads.insert(merged.id_record, merged);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn record(connection: Uuid, remote_id: &str) -> StoredRecord {
        StoredRecord {
            id: Uuid::new_v4(),
            entity_type: EntityType::Group,
            id_connection: connection,
            remote_id: remote_id.to_string(),
            fields: json!({"name": "Engineering"}).as_object().unwrap().clone(),
            remote_was_deleted: false,
            remote_created_at: None,
            created_at: ts(),
            modified_at: ts(),
        }
    }

    #[tokio::test]
    async fn uncommitted_writes_are_discarded() {
        let store = MemoryStore::new();
        let connection = Uuid::new_v4();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_record(&record(connection, "g-1")).await.unwrap();
        }
        assert_eq!(store.record_count().await, 0);

        let mut tx = store.begin().await.unwrap();
        tx.insert_record(&record(connection, "g-1")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.record_count().await, 1);
    }

    #[tokio::test]
    async fn insert_on_existing_key_keeps_original_identity() {
        let store = MemoryStore::new();
        let connection = Uuid::new_v4();
        let first = record(connection, "g-1");

        let mut tx = store.begin().await.unwrap();
        tx.insert_record(&first).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let second = tx.insert_record(&record(connection, "g-1")).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(store.records(EntityType::Group).await.len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_fire_at_their_point() {
        let store = MemoryStore::new();
        let connection = Uuid::new_v4();
        store.inject_failure(FailurePoint::RawPayload, "g-2").await;

        let rec = record(connection, "g-2");
        let mut tx = store.begin().await.unwrap();
        tx.insert_record(&rec).await.unwrap();
        let payload = RawPayload {
            id: Uuid::new_v4(),
            id_record: rec.id,
            payload: json!({"id": "g-2"}),
            content_hash: "x".into(),
            created_at: ts(),
            modified_at: ts(),
        };
        let err = tx.upsert_raw_payload(&payload).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Injected { point: FailurePoint::RawPayload, .. }));
    }

    #[tokio::test]
    async fn put_mapping_keeps_one_mapping_per_slug() {
        let store = MemoryStore::new();
        let linked = Uuid::new_v4();
        let mapping = |remote: &str| CustomFieldMapping {
            id: Uuid::new_v4(),
            slug: "cost_center".into(),
            remote_id: remote.into(),
            entity_type: EntityType::Group,
            id_linked_user: linked,
            provider_slug: "gusto".into(),
            required: false,
        };
        store.put_mapping(mapping("cc")).await;
        store.put_mapping(mapping("cost_center_code")).await;

        let mappings = store
            .custom_field_mappings(linked, EntityType::Group)
            .await
            .unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].remote_id, "cost_center_code");
    }
}
