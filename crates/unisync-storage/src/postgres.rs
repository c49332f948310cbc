//! Postgres backend over sqlx.

use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use unisync_core::{
    Connection, CustomFieldMapping, EntityType, LinkedAccount, Project, Provider, RawPayload, Secret,
    StoredCustomValue, StoredRecord, Tenant,
};
use uuid::Uuid;

use crate::{AccountDirectory, PersistenceError, RecordStore, RecordTransaction};

const RECORD_COLUMNS: &str = "id, entity_type, id_connection, remote_id, fields, remote_was_deleted, remote_created_at, created_at, modified_at";
const CUSTOM_VALUE_COLUMNS: &str =
    "id, id_mapping, id_record, id_linked_user, origin_source, value, created_at, modified_at";
const RAW_PAYLOAD_COLUMNS: &str = "id, id_record, payload, content_hash, created_at, modified_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_entity_type(table: &'static str, raw: &str) -> Result<EntityType, PersistenceError> {
    EntityType::from_str(raw).map_err(|e| PersistenceError::Corrupt {
        table,
        message: e.to_string(),
    })
}

fn map_record(row: PgRow) -> Result<StoredRecord, PersistenceError> {
    let entity_type: String = row.try_get("entity_type")?;
    let fields: serde_json::Value = row.try_get("fields")?;
    let fields = match fields {
        serde_json::Value::Object(map) => map,
        other => {
            return Err(PersistenceError::Corrupt {
                table: "unified_records",
                message: format!("fields is not an object: {other}"),
            })
        }
    };
    Ok(StoredRecord {
        id: row.try_get("id")?,
        entity_type: parse_entity_type("unified_records", &entity_type)?,
        id_connection: row.try_get("id_connection")?,
        remote_id: row.try_get("remote_id")?,
        fields,
        remote_was_deleted: row.try_get("remote_was_deleted")?,
        remote_created_at: row.try_get("remote_created_at")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
    })
}

fn map_custom_value(row: PgRow) -> Result<StoredCustomValue, PersistenceError> {
    Ok(StoredCustomValue {
        id: row.try_get("id")?,
        id_mapping: row.try_get("id_mapping")?,
        id_record: row.try_get("id_record")?,
        id_linked_user: row.try_get("id_linked_user")?,
        origin_source: row.try_get("origin_source")?,
        value: row.try_get("value")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
    })
}

fn map_raw_payload(row: PgRow) -> Result<RawPayload, PersistenceError> {
    Ok(RawPayload {
        id: row.try_get("id")?,
        id_record: row.try_get("id_record")?,
        payload: row.try_get("payload")?,
        content_hash: row.try_get("content_hash")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
    })
}

fn map_mapping(row: PgRow) -> Result<CustomFieldMapping, PersistenceError> {
    let entity_type: String = row.try_get("entity_type")?;
    Ok(CustomFieldMapping {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        remote_id: row.try_get("remote_id")?,
        entity_type: parse_entity_type("custom_field_mappings", &entity_type)?,
        id_linked_user: row.try_get("id_linked_user")?,
        provider_slug: row.try_get("provider_slug")?,
        required: row.try_get("required")?,
    })
}

fn map_linked_account(row: PgRow) -> Result<LinkedAccount, PersistenceError> {
    Ok(LinkedAccount {
        id: row.try_get("id")?,
        id_project: row.try_get("id_project")?,
        status: row.try_get("status")?,
        origin_source: row.try_get("origin_source")?,
        remote_id: row.try_get("remote_id")?,
    })
}

fn map_project(row: PgRow) -> Result<Project, PersistenceError> {
    Ok(Project {
        id: row.try_get("id")?,
        id_tenant: row.try_get("id_tenant")?,
        name: row.try_get("name")?,
    })
}

#[async_trait]
impl AccountDirectory for PgStore {
    async fn tenants(&self, scope: Option<Uuid>) -> Result<Vec<Tenant>, PersistenceError> {
        let rows = sqlx::query(
            "select id, name from tenants
             where $1::uuid is null or id = $1
             order by created_at, id",
        )
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<Tenant, PersistenceError> {
                Ok(Tenant {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    async fn projects(&self, tenant_id: Uuid) -> Result<Vec<Project>, PersistenceError> {
        let rows = sqlx::query("select id, id_tenant, name from projects where id_tenant = $1 order by id")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(map_project).collect()
    }

    async fn project(&self, project_id: Uuid) -> Result<Option<Project>, PersistenceError> {
        let row = sqlx::query("select id, id_tenant, name from projects where id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_project).transpose()
    }

    async fn linked_accounts(&self, project_id: Uuid) -> Result<Vec<LinkedAccount>, PersistenceError> {
        let rows = sqlx::query(
            "select id, id_project, status, origin_source, remote_id
             from linked_users where id_project = $1 order by id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(map_linked_account).collect()
    }

    async fn linked_account(&self, id: Uuid) -> Result<Option<LinkedAccount>, PersistenceError> {
        let row = sqlx::query(
            "select id, id_project, status, origin_source, remote_id
             from linked_users where id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(map_linked_account).transpose()
    }

    async fn connection(
        &self,
        linked_user_id: Uuid,
        provider: Provider,
    ) -> Result<Option<Connection>, PersistenceError> {
        // Slugs may be stored under aliases, so matching happens here rather than in sql.
        let rows = sqlx::query(
            "select id, id_linked_user, provider_slug, status, base_url, account_id, access_token
             from connections
             where id_linked_user = $1
             order by created_at desc",
        )
        .bind(linked_user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut row = None;
        for candidate in rows {
            let slug: String = candidate.try_get("provider_slug")?;
            if provider.matches_slug(&slug) {
                row = Some(candidate);
                break;
            }
        }

        row.map(|row| -> Result<Connection, PersistenceError> {
            let token: Option<String> = row.try_get("access_token")?;
            Ok(Connection {
                id: row.try_get("id")?,
                id_linked_user: row.try_get("id_linked_user")?,
                provider_slug: row.try_get("provider_slug")?,
                status: row.try_get("status")?,
                base_url: row.try_get("base_url")?,
                account_id: row.try_get("account_id")?,
                access_token: token.map(Secret::new),
            })
        })
        .transpose()
    }

    async fn custom_field_mappings(
        &self,
        linked_user_id: Uuid,
        entity_type: EntityType,
    ) -> Result<Vec<CustomFieldMapping>, PersistenceError> {
        let rows = sqlx::query(
            "select id, slug, remote_id, entity_type, id_linked_user, provider_slug, required
             from custom_field_mappings
             where id_linked_user = $1 and entity_type = $2
             order by slug",
        )
        .bind(linked_user_id)
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(map_mapping).collect()
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>, PersistenceError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgRecordTransaction { tx }))
    }
}

/// Rolled back by sqlx when dropped uncommitted.
struct PgRecordTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RecordTransaction for PgRecordTransaction {
    async fn find_record(
        &mut self,
        entity_type: EntityType,
        id_connection: Uuid,
        remote_id: &str,
    ) -> Result<Option<StoredRecord>, PersistenceError> {
        let sql = format!(
            "select {RECORD_COLUMNS} from unified_records
             where entity_type = $1 and id_connection = $2 and remote_id = $3
             for update"
        );
        let row = sqlx::query(&sql)
            .bind(entity_type.as_str())
            .bind(id_connection)
            .bind(remote_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(map_record).transpose()
    }

    async fn insert_record(&mut self, record: &StoredRecord) -> Result<StoredRecord, PersistenceError> {
        let sql = format!(
            "insert into unified_records ({RECORD_COLUMNS})
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             on conflict (entity_type, id_connection, remote_id) do update set
               fields = excluded.fields,
               remote_was_deleted = excluded.remote_was_deleted,
               remote_created_at = excluded.remote_created_at,
               modified_at = excluded.modified_at
             returning {RECORD_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(record.id)
            .bind(record.entity_type.as_str())
            .bind(record.id_connection)
            .bind(&record.remote_id)
            .bind(serde_json::Value::Object(record.fields.clone()))
            .bind(record.remote_was_deleted)
            .bind(record.remote_created_at)
            .bind(record.created_at)
            .bind(record.modified_at)
            .fetch_one(&mut *self.tx)
            .await?;
        map_record(row)
    }

    async fn update_record(&mut self, record: &StoredRecord) -> Result<StoredRecord, PersistenceError> {
        let sql = format!(
            "update unified_records set
               fields = $1, remote_was_deleted = $2, remote_created_at = $3, modified_at = $4
             where id = $5
             returning {RECORD_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(serde_json::Value::Object(record.fields.clone()))
            .bind(record.remote_was_deleted)
            .bind(record.remote_created_at)
            .bind(record.modified_at)
            .bind(record.id)
            .fetch_optional(&mut *self.tx)
            .await?;
        match row {
            Some(row) => map_record(row),
            None => Err(PersistenceError::RecordNotFound { id: record.id }),
        }
    }

    async fn custom_values(&mut self, id_record: Uuid) -> Result<Vec<StoredCustomValue>, PersistenceError> {
        let sql = format!("select {CUSTOM_VALUE_COLUMNS} from custom_field_values where id_record = $1");
        let rows = sqlx::query(&sql)
            .bind(id_record)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.into_iter().map(map_custom_value).collect()
    }

    async fn upsert_custom_value(&mut self, value: &StoredCustomValue) -> Result<(), PersistenceError> {
        let sql = format!(
            "insert into custom_field_values ({CUSTOM_VALUE_COLUMNS})
             values ($1, $2, $3, $4, $5, $6, $7, $8)
             on conflict (id_mapping, id_record) do update set
               id_linked_user = excluded.id_linked_user,
               origin_source = excluded.origin_source,
               value = excluded.value,
               modified_at = excluded.modified_at"
        );
        sqlx::query(&sql)
            .bind(value.id)
            .bind(value.id_mapping)
            .bind(value.id_record)
            .bind(value.id_linked_user)
            .bind(&value.origin_source)
            .bind(&value.value)
            .bind(value.created_at)
            .bind(value.modified_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_custom_value(&mut self, id: Uuid) -> Result<(), PersistenceError> {
        sqlx::query("delete from custom_field_values where id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn raw_payload(&mut self, id_record: Uuid) -> Result<Option<RawPayload>, PersistenceError> {
        let sql = format!("select {RAW_PAYLOAD_COLUMNS} from remote_payloads where id_record = $1");
        let row = sqlx::query(&sql)
            .bind(id_record)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(map_raw_payload).transpose()
    }

    async fn upsert_raw_payload(&mut self, payload: &RawPayload) -> Result<(), PersistenceError> {
        let sql = format!(
            "insert into remote_payloads ({RAW_PAYLOAD_COLUMNS})
             values ($1, $2, $3, $4, $5, $6)
             on conflict (id_record) do update set
               payload = excluded.payload,
               content_hash = excluded.content_hash,
               modified_at = excluded.modified_at"
        );
        sqlx::query(&sql)
            .bind(payload.id)
            .bind(payload.id_record)
            .bind(&payload.payload)
            .bind(&payload.content_hash)
            .bind(payload.created_at)
            .bind(payload.modified_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        self.tx.commit().await?;
        Ok(())
    }
}
