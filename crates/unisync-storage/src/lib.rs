//! Persistence interfaces, storage backends and HTTP fetch utilities for unisync.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use unisync_core::{
    Connection, CustomFieldMapping, EntityType, LinkedAccount, Project, Provider, RawPayload,
    StoredCustomValue, StoredRecord, Tenant,
};
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{
    is_retryable_error, is_retryable_status, FetchError, FetchRequest, FetchedResponse,
    HttpClientConfig, HttpFetcher, RateLimit, RequestBudget, RetryPolicy,
};
pub use memory::{FailurePoint, MemoryStore};
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },
    #[error("record {id} not found")]
    RecordNotFound { id: Uuid },
    #[error("no raw payload supplied for record at index {index}")]
    MissingRawPayload { index: usize },
    #[error("injected {point:?} failure for remote_id={remote_id}")]
    Injected { point: FailurePoint, remote_id: String },
}

/// Hex encoded SHA-256 of a raw provider payload.
pub fn content_hash(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Read access to the account-management data the sync engine discovers work from.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// All tenants, or only `scope` when given.
    async fn tenants(&self, scope: Option<Uuid>) -> Result<Vec<Tenant>, PersistenceError>;

    async fn projects(&self, tenant_id: Uuid) -> Result<Vec<Project>, PersistenceError>;

    async fn project(&self, project_id: Uuid) -> Result<Option<Project>, PersistenceError>;

    async fn linked_accounts(&self, project_id: Uuid) -> Result<Vec<LinkedAccount>, PersistenceError>;

    async fn linked_account(&self, id: Uuid) -> Result<Option<LinkedAccount>, PersistenceError>;

    /// Most recent connection of the account whose slug names `provider`.
    async fn connection(
        &self,
        linked_user_id: Uuid,
        provider: Provider,
    ) -> Result<Option<Connection>, PersistenceError>;

    async fn custom_field_mappings(
        &self,
        linked_user_id: Uuid,
        entity_type: EntityType,
    ) -> Result<Vec<CustomFieldMapping>, PersistenceError>;
}

/// Write side used by ingestion. One transaction covers one canonical record.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>, PersistenceError>;
}

/// Dropping a transaction without calling `commit` discards every write made through it.
#[async_trait]
pub trait RecordTransaction: Send {
    async fn find_record(
        &mut self,
        entity_type: EntityType,
        id_connection: Uuid,
        remote_id: &str,
    ) -> Result<Option<StoredRecord>, PersistenceError>;

    /// Inserts a new row. A concurrent row with the same unique key is updated
    /// instead, and the row that ends up persisted is returned.
    async fn insert_record(&mut self, record: &StoredRecord) -> Result<StoredRecord, PersistenceError>;

    async fn update_record(&mut self, record: &StoredRecord) -> Result<StoredRecord, PersistenceError>;

    async fn custom_values(&mut self, id_record: Uuid) -> Result<Vec<StoredCustomValue>, PersistenceError>;

    /// Upserts on `(id_mapping, id_record)`.
    async fn upsert_custom_value(&mut self, value: &StoredCustomValue) -> Result<(), PersistenceError>;

    async fn delete_custom_value(&mut self, id: Uuid) -> Result<(), PersistenceError>;

    async fn raw_payload(&mut self, id_record: Uuid) -> Result<Option<RawPayload>, PersistenceError>;

    /// Upserts on `id_record`.
    async fn upsert_raw_payload(&mut self, payload: &RawPayload) -> Result<(), PersistenceError>;

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError>;
}

/// A complete backend: the directory to discover work and the record store to persist it.
pub trait Store: AccountDirectory + RecordStore {}

impl<T: AccountDirectory + RecordStore> Store for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_hash_is_stable() {
        let a = content_hash(&json!({"id": "b-1", "name": "Dental"}));
        let b = content_hash(&json!({"id": "b-1", "name": "Dental"}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash(&json!({"id": "b-1", "name": "Vision"})));
    }
}
