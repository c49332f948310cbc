//! Provider adapter + mapper contracts, the service registry, and the HRIS provider implementations.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use unisync_core::{
    Category, ConnectionContext, CustomFieldMapping, CustomFieldValue, EntityType, Provider,
    UnifiedRecord,
};
use unisync_storage::FetchError;
use uuid::Uuid;

pub mod providers;
pub mod raw;
pub mod rest;

pub use providers::{register_all, ProviderSettings};
pub use raw::{RawBody, RawPage, RawProviderRecord};
pub use rest::{Endpoint, Pagination, RestAdapter};

#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("unexpected response shape: {0}")]
    Decode(String),
    #[error("connection has no access token")]
    MissingCredentials,
    #[error("connection is misconfigured: {0}")]
    Misconfigured(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Network, auth or provider-side failure while pulling data for one (provider, entity type).
#[derive(Debug, Error)]
#[error("fetching {entity_type} from {provider} failed: {failure}")]
pub struct ProviderFetchError {
    pub provider: Provider,
    pub entity_type: EntityType,
    #[source]
    pub failure: FetchFailure,
}

impl ProviderFetchError {
    pub fn new(provider: Provider, entity_type: EntityType, failure: impl Into<FetchFailure>) -> Self {
        Self {
            provider,
            entity_type,
            failure: failure.into(),
        }
    }

    pub fn timeout(provider: Provider, entity_type: EntityType, after: Duration) -> Self {
        Self::new(provider, entity_type, FetchFailure::Timeout(after))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.failure, FetchFailure::Timeout(_))
    }
}

/// A single provider record could not be normalized.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    #[error("record {remote_id:?}: required field `{field}` is missing")]
    MissingField {
        remote_id: Option<String>,
        field: String,
    },
    #[error("record {remote_id:?}: field `{field}` is invalid: {message}")]
    InvalidField {
        remote_id: Option<String>,
        field: String,
        message: String,
    },
    #[error("record {remote_id:?} is malformed: {message}")]
    Malformed {
        remote_id: Option<String>,
        message: String,
    },
    #[error("{provider} {expected} mapper cannot handle {actual} records")]
    EntityMismatch {
        provider: Provider,
        expected: EntityType,
        actual: EntityType,
    },
}

impl MappingError {
    pub fn missing(remote_id: Option<&str>, field: impl Into<String>) -> Self {
        MappingError::MissingField {
            remote_id: remote_id.map(str::to_string),
            field: field.into(),
        }
    }

    pub fn invalid(remote_id: Option<&str>, field: impl Into<String>, message: impl Into<String>) -> Self {
        MappingError::InvalidField {
            remote_id: remote_id.map(str::to_string),
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn remote_id(&self) -> Option<&str> {
        match self {
            MappingError::MissingField { remote_id, .. }
            | MappingError::InvalidField { remote_id, .. }
            | MappingError::Malformed { remote_id, .. } => remote_id.as_deref(),
            MappingError::EntityMismatch { .. } => None,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            MappingError::MissingField { field, .. } | MappingError::InvalidField { field, .. } => {
                Some(field)
            }
            _ => None,
        }
    }
}

/// Where the next provider page starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    Cursor(String),
    Page(u32),
}

#[derive(Debug, Default)]
pub struct FetchedPage {
    pub page: RawPage,
    pub next: Option<PageCursor>,
}

/// Pulls provider-native records for one (provider, entity type).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;
    fn entity_type(&self) -> EntityType;

    /// Fetches one page; `cursor` is `None` for the first one.
    async fn fetch_page(
        &self,
        ctx: &ConnectionContext,
        cursor: Option<&PageCursor>,
    ) -> Result<FetchedPage, ProviderFetchError>;
}

impl<'x> dyn ProviderAdapter + 'x {
    /// Lazily paginated, one-shot sequence over every record visible through `ctx`.
    pub fn records<'a>(&'a self, ctx: &'a ConnectionContext) -> RecordSequence<'a> {
        RecordSequence {
            adapter: self,
            ctx,
            state: SequenceState::Start,
            pages: 0,
        }
    }
}

/// Upper bound on pages per sequence, against providers that hand back a cursor forever.
pub const MAX_PAGES: usize = 10_000;

enum SequenceState {
    Start,
    Next(PageCursor),
    Done,
}

pub struct RecordSequence<'a> {
    adapter: &'a dyn ProviderAdapter,
    ctx: &'a ConnectionContext,
    state: SequenceState,
    pages: usize,
}

impl RecordSequence<'_> {
    /// Next page of records, or `None` once the provider has no more. After
    /// returning `None` or an error the sequence stays exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<RawPage>, ProviderFetchError> {
        let cursor = match std::mem::replace(&mut self.state, SequenceState::Done) {
            SequenceState::Start => None,
            SequenceState::Next(cursor) => Some(cursor),
            SequenceState::Done => return Ok(None),
        };
        if self.pages >= MAX_PAGES {
            tracing::warn!(
                provider = %self.adapter.provider(),
                entity_type = %self.adapter.entity_type(),
                pages = self.pages,
                "page limit reached, stopping pagination"
            );
            return Ok(None);
        }

        let fetched = self.adapter.fetch_page(self.ctx, cursor.as_ref()).await?;
        self.pages += 1;
        if let Some(next) = fetched.next {
            if Some(&next) != cursor.as_ref() {
                self.state = SequenceState::Next(next);
            }
        }
        Ok(Some(fetched.page))
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }
}

/// Converts provider records to and from the canonical model.
pub trait Mapper: Send + Sync {
    fn provider(&self) -> Provider;
    fn entity_type(&self) -> EntityType;

    /// One raw record may produce several canonical records.
    fn unify(
        &self,
        raw: &RawProviderRecord,
        connection_id: Uuid,
        custom_field_mappings: &[CustomFieldMapping],
    ) -> Result<Vec<UnifiedRecord>, MappingError>;

    fn desunify(
        &self,
        record: &UnifiedRecord,
        custom_field_mappings: &[CustomFieldMapping],
    ) -> Result<JsonValue, MappingError>;
}

/// Looks up a provider field by top-level key or, when it starts with `/`, by JSON pointer.
pub fn remote_field<'v>(remote_data: &'v JsonValue, remote_id: &str) -> Option<&'v JsonValue> {
    if remote_id.starts_with('/') {
        remote_data.pointer(remote_id)
    } else {
        remote_data.get(remote_id)
    }
}

/// Custom field values for `remote_data`. A `required` mapping whose field is
/// absent or null fails the record.
pub fn extract_custom_fields(
    remote_data: &JsonValue,
    record_remote_id: &str,
    mappings: &[CustomFieldMapping],
) -> Result<Vec<CustomFieldValue>, MappingError> {
    let mut values = Vec::new();
    for mapping in mappings {
        match remote_field(remote_data, &mapping.remote_id) {
            Some(value) if !value.is_null() => values.push(CustomFieldValue {
                id_mapping: mapping.id,
                slug: mapping.slug.clone(),
                remote_id: mapping.remote_id.clone(),
                value: value.clone(),
            }),
            _ if mapping.required => {
                return Err(MappingError::missing(Some(record_remote_id), mapping.remote_id.clone()))
            }
            _ => {}
        }
    }
    Ok(values)
}

/// Writes a record's custom field values back at their mapped provider fields.
pub fn write_custom_fields(
    target: &mut JsonMap<String, JsonValue>,
    record: &UnifiedRecord,
    mappings: &[CustomFieldMapping],
) {
    for value in &record.custom_fields {
        let Some(mapping) = mappings
            .iter()
            .find(|m| m.id == value.id_mapping || m.slug == value.slug)
        else {
            continue;
        };
        if let Some(pointer) = mapping.remote_id.strip_prefix('/') {
            insert_at_pointer(target, pointer, value.value.clone());
        } else {
            target.insert(mapping.remote_id.clone(), value.value.clone());
        }
    }
}

/// Highest array index a pointer may pad an outbound array up to.
const MAX_POINTER_INDEX: usize = 1024;

fn insert_at_pointer(target: &mut JsonMap<String, JsonValue>, pointer: &str, value: JsonValue) {
    let segments: Vec<String> = pointer
        .split('/')
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect();
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let slot = target.entry(first.clone()).or_insert(JsonValue::Null);
    place_at(slot, rest, value);
}

/// Numeric segments index arrays; missing containers are created to match the
/// segment. An existing scalar on the path is left alone and the write dropped.
fn place_at(slot: &mut JsonValue, segments: &[String], value: JsonValue) {
    let Some((segment, rest)) = segments.split_first() else {
        *slot = value;
        return;
    };
    let index = segment.parse::<usize>().ok();
    if slot.is_null() {
        *slot = match index {
            Some(_) => JsonValue::Array(Vec::new()),
            None => JsonValue::Object(JsonMap::new()),
        };
    }
    match slot {
        JsonValue::Array(items) => {
            let Some(index) = index.filter(|i| *i <= MAX_POINTER_INDEX) else {
                return;
            };
            if items.len() <= index {
                items.resize(index + 1, JsonValue::Null);
            }
            place_at(&mut items[index], rest, value);
        }
        JsonValue::Object(map) => {
            let child = map.entry(segment.clone()).or_insert(JsonValue::Null);
            place_at(child, rest, value);
        }
        _ => {}
    }
}

/// An adapter paired with the mapper for the same (provider, entity type).
#[derive(Clone)]
pub struct Integration {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub mapper: Arc<dyn Mapper>,
}

impl Integration {
    pub fn provider(&self) -> Provider {
        self.adapter.provider()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{entity_type} is not part of the {category} category")]
    CategoryMismatch {
        category: Category,
        entity_type: EntityType,
    },
    #[error("registration for {entity_type} got an adapter/mapper for {actual_provider}/{actual_entity}")]
    Inconsistent {
        entity_type: EntityType,
        actual_provider: Provider,
        actual_entity: EntityType,
    },
    #[error("{provider}/{entity_type} registered twice")]
    Duplicate {
        provider: Provider,
        entity_type: EntityType,
    },
}

type Slots = [[Option<Integration>; Provider::COUNT]; EntityType::COUNT];

fn empty_slots() -> Slots {
    std::array::from_fn(|_| std::array::from_fn(|_| None))
}

/// Collects integrations during startup. `build` freezes them into a [`ServiceRegistry`].
pub struct RegistryBuilder {
    slots: Slots,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self { slots: empty_slots() }
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        category: Category,
        entity_type: EntityType,
        adapter: Arc<dyn ProviderAdapter>,
        mapper: Arc<dyn Mapper>,
    ) -> Result<&mut Self, RegistryError> {
        if entity_type.category() != category {
            return Err(RegistryError::CategoryMismatch {
                category,
                entity_type,
            });
        }
        for (provider, entity) in [
            (adapter.provider(), adapter.entity_type()),
            (mapper.provider(), mapper.entity_type()),
        ] {
            if entity != entity_type || provider != adapter.provider() {
                return Err(RegistryError::Inconsistent {
                    entity_type,
                    actual_provider: provider,
                    actual_entity: entity,
                });
            }
        }

        let provider = adapter.provider();
        let slot = &mut self.slots[entity_type.index()][provider.index()];
        if slot.is_some() {
            return Err(RegistryError::Duplicate {
                provider,
                entity_type,
            });
        }
        *slot = Some(Integration { adapter, mapper });
        Ok(self)
    }

    pub fn build(self) -> ServiceRegistry {
        ServiceRegistry { slots: self.slots }
    }
}

/// Immutable (entity type, provider) → integration table. Share it behind an `Arc`.
pub struct ServiceRegistry {
    slots: Slots,
}

impl ServiceRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// `None` when the provider id is unknown or not enabled for this entity type.
    pub fn resolve(&self, entity_type: EntityType, provider_id: &str) -> Option<&Integration> {
        let provider = provider_id.parse::<Provider>().ok()?;
        self.get(entity_type, provider)
    }

    pub fn get(&self, entity_type: EntityType, provider: Provider) -> Option<&Integration> {
        self.slots[entity_type.index()][provider.index()].as_ref()
    }

    pub fn providers_for(&self, entity_type: EntityType) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.get(entity_type, *p).is_some())
            .collect()
    }

    pub fn registered(&self) -> Vec<(EntityType, Provider)> {
        EntityType::ALL
            .into_iter()
            .flat_map(|e| self.providers_for(e).into_iter().map(move |p| (e, p)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registered().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("registered", &self.registered())
            .finish()
    }
}
