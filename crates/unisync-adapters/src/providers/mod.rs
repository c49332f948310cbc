//! Concrete HRIS providers: endpoint descriptions, raw shapes and mappers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};
use unisync_core::{CustomFieldMapping, EntityType, Provider, UnifiedRecord};
use unisync_storage::HttpFetcher;

use crate::rest::{Endpoint, RestAdapter};
use crate::{
    extract_custom_fields, Mapper, MappingError, RawProviderRecord, RegistryBuilder, RegistryError,
};

pub mod deel;
pub mod gusto;
pub mod sage;

/// Per-provider overrides applied when registering integrations.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub base_urls: BTreeMap<Provider, String>,
    pub disabled: BTreeSet<Provider>,
}

impl ProviderSettings {
    pub fn is_enabled(&self, provider: Provider) -> bool {
        !self.disabled.contains(&provider)
    }
}

/// A (entity type, endpoint, mapper) triple a provider supports.
pub struct Supported {
    pub entity_type: EntityType,
    pub endpoint: Endpoint,
    pub mapper: Arc<dyn Mapper>,
}

pub fn supported(provider: Provider) -> Vec<Supported> {
    match provider {
        Provider::Gusto => gusto::supported(),
        Provider::Deel => deel::supported(),
        Provider::Sage => sage::supported(),
    }
}

/// Registers every enabled provider's REST integrations. Returns how many were added.
pub fn register_all(
    builder: &mut RegistryBuilder,
    http: Arc<HttpFetcher>,
    settings: &ProviderSettings,
) -> Result<usize, RegistryError> {
    let mut added = 0;
    for provider in Provider::ALL {
        if !settings.is_enabled(provider) {
            tracing::info!(provider = %provider, "provider disabled, not registering");
            continue;
        }
        for Supported {
            entity_type,
            endpoint,
            mapper,
        } in supported(provider)
        {
            let adapter = RestAdapter::new(provider, entity_type, endpoint, http.clone())
                .with_base_url(settings.base_urls.get(&provider).cloned());
            builder.register(entity_type.category(), entity_type, Arc::new(adapter), mapper)?;
            added += 1;
        }
    }
    Ok(added)
}

pub(crate) fn mismatch(mapper: &dyn Mapper, actual: EntityType) -> MappingError {
    MappingError::EntityMismatch {
        provider: mapper.provider(),
        expected: mapper.entity_type(),
        actual,
    }
}

pub(crate) fn mismatched_raw(mapper: &dyn Mapper, raw: &RawProviderRecord) -> MappingError {
    mismatch(mapper, raw.body.entity_type())
}

pub(crate) fn check_record(mapper: &dyn Mapper, record: &UnifiedRecord) -> Result<(), MappingError> {
    if record.entity_type() == mapper.entity_type() {
        Ok(())
    } else {
        Err(mismatch(mapper, record.entity_type()))
    }
}

pub(crate) fn with_custom_fields(
    mut record: UnifiedRecord,
    raw: &RawProviderRecord,
    mappings: &[CustomFieldMapping],
) -> Result<UnifiedRecord, MappingError> {
    record.custom_fields = extract_custom_fields(&raw.remote_data, &record.remote_id, mappings)?;
    Ok(record)
}

pub(crate) fn insert_opt(target: &mut JsonMap<String, JsonValue>, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        target.insert(key.to_string(), JsonValue::String(value.clone()));
    }
}

pub(crate) fn require_id<'a>(id: Option<&'a str>, field: &str) -> Result<&'a str, MappingError> {
    match id {
        Some(id) if !id.trim().is_empty() => Ok(id),
        _ => Err(MappingError::missing(None, field)),
    }
}

/// Providers send amounts either as JSON numbers or decimal strings.
pub(crate) fn decimal(
    remote_id: &str,
    field: &str,
    value: Option<&JsonValue>,
) -> Result<Option<f64>, MappingError> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => Ok(n.as_f64()),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(None),
        Some(JsonValue::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| MappingError::invalid(Some(remote_id), field, format!("`{s}` is not a number"))),
        Some(other) => Err(MappingError::invalid(
            Some(remote_id),
            field,
            format!("expected a number, got {other}"),
        )),
    }
}

pub(crate) fn timestamp(
    remote_id: &str,
    field: &str,
    value: Option<&str>,
) -> Result<Option<DateTime<Utc>>, MappingError> {
    let Some(raw) = value.filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| Some(dt.with_timezone(&Utc)))
        .map_err(|err| MappingError::invalid(Some(remote_id), field, err.to_string()))
}

/// Canonical time-off policy labels shared across providers.
pub(crate) fn policy_type(raw: &str) -> String {
    let folded = raw.trim().to_ascii_uppercase().replace([' ', '-'], "_");
    match folded.as_str() {
        "VACATION" | "PTO" | "PAID_TIME_OFF" | "ANNUAL_LEAVE" | "HOLIDAY" => "VACATION".into(),
        "SICK" | "SICK_LEAVE" | "ILLNESS" => "SICK".into(),
        "PERSONAL" => "PERSONAL".into(),
        "JURY_DUTY" => "JURY_DUTY".into(),
        "VOLUNTEER" => "VOLUNTEER".into(),
        "BEREAVEMENT" => "BEREAVEMENT".into(),
        _ => folded,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::fs;
    use std::path::{Path, PathBuf};

    use serde_json::Value as JsonValue;
    use unisync_core::{CustomFieldMapping, EntityType, Provider, UnifiedRecord};
    use uuid::Uuid;

    use crate::rest::parse_page;
    use crate::{Mapper, RawPage};

    use super::supported;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    pub fn response(provider: Provider, entity_type: EntityType) -> JsonValue {
        let path = workspace_root()
            .join("fixtures")
            .join(provider.as_str())
            .join(format!("{}.json", entity_type.as_str()));
        let text = fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()));
        serde_json::from_str(&text).expect("parse fixture")
    }

    pub fn page(provider: Provider, entity_type: EntityType) -> RawPage {
        let support = supported(provider)
            .into_iter()
            .find(|s| s.entity_type == entity_type)
            .expect("supported pair");
        let (items, _) = parse_page(&support.endpoint, &response(provider, entity_type), None).unwrap();
        RawPage::decode_all(provider, entity_type, items)
    }

    pub fn unify_all(
        mapper: &dyn Mapper,
        page: &RawPage,
        mappings: &[CustomFieldMapping],
    ) -> Vec<UnifiedRecord> {
        page.records
            .iter()
            .flat_map(|raw| mapper.unify(raw, Uuid::nil(), mappings).unwrap())
            .collect()
    }

    pub fn mapping(provider: Provider, entity_type: EntityType, slug: &str, remote_id: &str) -> CustomFieldMapping {
        CustomFieldMapping {
            id: Uuid::new_v4(),
            slug: slug.into(),
            remote_id: remote_id.into(),
            entity_type,
            id_linked_user: Uuid::nil(),
            provider_slug: provider.as_str().into(),
            required: false,
        }
    }
}
