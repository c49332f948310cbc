//! Idempotent persistence of unified records, their custom field values and raw payloads.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use unisync_core::{Clock, RawPayload, StoredCustomValue, StoredRecord, UnifiedRecord};
use unisync_storage::{content_hash, PersistenceError, RecordStore, RecordTransaction};
use uuid::Uuid;

/// What happens to stored custom field values that the current sync did not produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CustomFieldPolicy {
    /// Delete them, so a record carries exactly the values of its active mappings.
    #[default]
    Prune,
    /// Leave them untouched.
    Retain,
}

impl FromStr for CustomFieldPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prune" => Ok(CustomFieldPolicy::Prune),
            "retain" => Ok(CustomFieldPolicy::Retain),
            other => Err(format!("unknown custom field policy `{other}`")),
        }
    }
}

impl fmt::Display for CustomFieldPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CustomFieldPolicy::Prune => "prune",
            CustomFieldPolicy::Retain => "retain",
        })
    }
}

#[derive(Debug)]
pub struct IngestFailure {
    pub index: usize,
    pub remote_id: String,
    pub error: PersistenceError,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub persisted: Vec<StoredRecord>,
    pub failed: Vec<IngestFailure>,
}

impl IngestReport {
    pub fn persisted_count(&self) -> usize {
        self.persisted.len()
    }
}

/// The only writer of canonical rows. Every record gets its own transaction.
pub struct IngestService {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    policy: CustomFieldPolicy,
}

impl IngestService {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, policy: CustomFieldPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> CustomFieldPolicy {
        self.policy
    }

    /// Upserts `records[i]` together with `raw_payloads[i]`. A failing record is
    /// rolled back and reported; the remaining records are still attempted.
    pub async fn save_to_db(
        &self,
        connection_id: Uuid,
        linked_user_id: Uuid,
        records: &[UnifiedRecord],
        origin_source: &str,
        raw_payloads: &[JsonValue],
    ) -> IngestReport {
        let mut report = IngestReport::default();
        for (index, record) in records.iter().enumerate() {
            let outcome = match raw_payloads.get(index) {
                Some(raw) => {
                    self.save_one(connection_id, linked_user_id, record, origin_source, raw)
                        .await
                }
                None => Err(PersistenceError::MissingRawPayload { index }),
            };
            match outcome {
                Ok(stored) => report.persisted.push(stored),
                Err(error) => {
                    tracing::warn!(
                        connection_id = %connection_id,
                        linked_user_id = %linked_user_id,
                        entity_type = %record.entity_type(),
                        remote_id = %record.remote_id,
                        error = %error,
                        "failed to persist record"
                    );
                    report.failed.push(IngestFailure {
                        index,
                        remote_id: record.remote_id.clone(),
                        error,
                    });
                }
            }
        }
        tracing::debug!(
            connection_id = %connection_id,
            persisted = report.persisted.len(),
            failed = report.failed.len(),
            "ingested batch"
        );
        report
    }

    async fn save_one(
        &self,
        connection_id: Uuid,
        linked_user_id: Uuid,
        record: &UnifiedRecord,
        origin_source: &str,
        raw: &JsonValue,
    ) -> Result<StoredRecord, PersistenceError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let fields = record.body.normalized_fields();
        let stored = match tx
            .find_record(record.entity_type(), connection_id, &record.remote_id)
            .await?
        {
            Some(existing) => {
                tx.update_record(&StoredRecord {
                    fields,
                    remote_was_deleted: record.remote_was_deleted,
                    remote_created_at: record.remote_created_at,
                    modified_at: now,
                    ..existing
                })
                .await?
            }
            None => {
                tx.insert_record(&StoredRecord {
                    id: Uuid::new_v4(),
                    entity_type: record.entity_type(),
                    id_connection: connection_id,
                    remote_id: record.remote_id.clone(),
                    fields,
                    remote_was_deleted: record.remote_was_deleted,
                    remote_created_at: record.remote_created_at,
                    created_at: now,
                    modified_at: now,
                })
                .await?
            }
        };

        self.write_custom_values(tx.as_mut(), &stored, record, linked_user_id, origin_source)
            .await?;
        archive_raw_payload(tx.as_mut(), &stored, raw, now).await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn write_custom_values(
        &self,
        tx: &mut dyn RecordTransaction,
        stored: &StoredRecord,
        record: &UnifiedRecord,
        linked_user_id: Uuid,
        origin_source: &str,
    ) -> Result<(), PersistenceError> {
        let now = self.clock.now();
        let existing = tx.custom_values(stored.id).await?;

        for value in &record.custom_fields {
            let prior = existing.iter().find(|v| v.id_mapping == value.id_mapping);
            if let Some(prior) = prior {
                if prior.value == value.value
                    && prior.id_linked_user == linked_user_id
                    && prior.origin_source == origin_source
                {
                    continue;
                }
            }
            tx.upsert_custom_value(&StoredCustomValue {
                id: prior.map_or_else(Uuid::new_v4, |p| p.id),
                id_mapping: value.id_mapping,
                id_record: stored.id,
                id_linked_user: linked_user_id,
                origin_source: origin_source.to_string(),
                value: value.value.clone(),
                created_at: prior.map_or(now, |p| p.created_at),
                modified_at: now,
            })
            .await?;
        }

        if self.policy == CustomFieldPolicy::Prune {
            for stale in existing
                .iter()
                .filter(|v| !record.custom_fields.iter().any(|c| c.id_mapping == v.id_mapping))
            {
                tx.delete_custom_value(stale.id).await?;
            }
        }
        Ok(())
    }
}

/// One archived payload per record; an unchanged payload is not rewritten.
async fn archive_raw_payload(
    tx: &mut dyn RecordTransaction,
    stored: &StoredRecord,
    raw: &JsonValue,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(), PersistenceError> {
    let hash = content_hash(raw);
    let payload = match tx.raw_payload(stored.id).await? {
        Some(existing) if existing.content_hash == hash => return Ok(()),
        Some(existing) => RawPayload {
            payload: raw.clone(),
            content_hash: hash,
            modified_at: now,
            ..existing
        },
        None => RawPayload {
            id: Uuid::new_v4(),
            id_record: stored.id,
            payload: raw.clone(),
            content_hash: hash,
            created_at: now,
            modified_at: now,
        },
    };
    tx.upsert_raw_payload(&payload).await
}
