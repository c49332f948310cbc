//! Canonical model, account types and sync events for unisync.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

/// Vertical an entity type belongs to. Providers register per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Hris,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Hris => "hris",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseIdError {
    #[error("unknown entity type `{0}`")]
    EntityType(String),
    #[error("unknown provider `{0}`")]
    Provider(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    EmployerBenefit,
    Group,
    Location,
    TimeOffBalance,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::EmployerBenefit,
        EntityType::Group,
        EntityType::Location,
        EntityType::TimeOffBalance,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::EmployerBenefit => "employer_benefit",
            EntityType::Group => "group",
            EntityType::Location => "location",
            EntityType::TimeOffBalance => "time_off_balance",
        }
    }

    pub fn category(&self) -> Category {
        Category::Hris
    }

    /// Dense index used by fixed-size lookup tables.
    pub fn index(&self) -> usize {
        match self {
            EntityType::EmployerBenefit => 0,
            EntityType::Group => 1,
            EntityType::Location => 2,
            EntityType::TimeOffBalance => 3,
        }
    }

    /// Name of the queue job that runs a full sync of this entity type.
    pub fn job_name(&self) -> &'static str {
        match self {
            EntityType::EmployerBenefit => "hris-sync-employer-benefits",
            EntityType::Group => "hris-sync-groups",
            EntityType::Location => "hris-sync-locations",
            EntityType::TimeOffBalance => "hris-sync-time-off-balances",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ParseIdError;

    /// Accepts `employer_benefit`, `employer-benefit` and `employerbenefit` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match folded.as_str() {
            "employerbenefit" | "employerbenefits" => Ok(EntityType::EmployerBenefit),
            "group" | "groups" => Ok(EntityType::Group),
            "location" | "locations" => Ok(EntityType::Location),
            "timeoffbalance" | "timeoffbalances" => Ok(EntityType::TimeOffBalance),
            _ => Err(ParseIdError::EntityType(s.to_string())),
        }
    }
}

/// The enumerated provider set known at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Gusto,
    Deel,
    Sage,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Gusto, Provider::Deel, Provider::Sage];

    pub const COUNT: usize = Self::ALL.len();

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gusto => "gusto",
            Provider::Deel => "deel",
            Provider::Sage => "sage",
        }
    }

    /// True when a stored slug, aliases included, names this provider.
    pub fn matches_slug(&self, slug: &str) -> bool {
        slug.parse::<Provider>().is_ok_and(|p| p == *self)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Gusto => "Gusto",
            Provider::Deel => "Deel",
            Provider::Sage => "Sage HR",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Provider::Gusto => 0,
            Provider::Deel => 1,
            Provider::Sage => 2,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::Gusto => "https://api.gusto.com",
            Provider::Deel => "https://api.letsdeel.com/rest/v2",
            Provider::Sage => "https://subdomain.sage.hr/api",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gusto" => Ok(Provider::Gusto),
            "deel" => Ok(Provider::Deel),
            "sage" | "sagehr" | "sage_hr" => Ok(Provider::Sage),
            _ => Err(ParseIdError::Provider(s.to_string())),
        }
    }
}

/// String whose contents never show up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub id_tenant: Uuid,
    pub name: String,
}

pub const LINKED_ACCOUNT_ACTIVE: &str = "active";

/// A customer's link to one end user/org in a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedAccount {
    pub id: Uuid,
    pub id_project: Uuid,
    pub status: String,
    pub origin_source: String,
    pub remote_id: String,
}

impl LinkedAccount {
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case(LINKED_ACCOUNT_ACTIVE)
    }
}

/// Opaque credentials handed to an adapter for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub connection_id: Uuid,
    pub provider: Provider,
    pub base_url: Option<String>,
    /// Provider-side account (company) identifier, when the API is scoped by one.
    pub account_id: Option<String>,
    pub access_token: Option<Secret>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub id_linked_user: Uuid,
    pub provider_slug: String,
    pub status: String,
    pub base_url: Option<String>,
    pub account_id: Option<String>,
    pub access_token: Option<Secret>,
}

impl Connection {
    pub fn context(&self, provider: Provider) -> ConnectionContext {
        ConnectionContext {
            connection_id: self.id,
            provider,
            base_url: self.base_url.clone(),
            account_id: self.account_id.clone(),
            access_token: self.access_token.clone(),
        }
    }
}

/// Customer-defined link between a canonical extension slot and a provider field.
///
/// `remote_id` is either a top-level key of the provider record or a JSON
/// pointer (starting with `/`) into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFieldMapping {
    pub id: Uuid,
    pub slug: String,
    pub remote_id: String,
    pub entity_type: EntityType,
    pub id_linked_user: Uuid,
    pub provider_slug: String,
    #[serde(default)]
    pub required: bool,
}

/// Custom field value extracted by a mapper for one canonical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomFieldValue {
    pub id_mapping: Uuid,
    pub slug: String,
    pub remote_id: String,
    pub value: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmployerBenefit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benefit_plan_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduction_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub group_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street_1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street_2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeOffBalance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_type: Option<String>,
}

/// Entity-specific normalized fields of a canonical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "snake_case")]
pub enum UnifiedBody {
    EmployerBenefit(EmployerBenefit),
    Group(Group),
    Location(Location),
    TimeOffBalance(TimeOffBalance),
}

impl UnifiedBody {
    pub fn entity_type(&self) -> EntityType {
        match self {
            UnifiedBody::EmployerBenefit(_) => EntityType::EmployerBenefit,
            UnifiedBody::Group(_) => EntityType::Group,
            UnifiedBody::Location(_) => EntityType::Location,
            UnifiedBody::TimeOffBalance(_) => EntityType::TimeOffBalance,
        }
    }

    /// Normalized fields as a JSON object; fields the provider did not supply are absent.
    pub fn normalized_fields(&self) -> JsonMap<String, JsonValue> {
        let value = match self {
            UnifiedBody::EmployerBenefit(b) => serde_json::to_value(b),
            UnifiedBody::Group(g) => serde_json::to_value(g),
            UnifiedBody::Location(l) => serde_json::to_value(l),
            UnifiedBody::TimeOffBalance(t) => serde_json::to_value(t),
        };
        match value {
            Ok(JsonValue::Object(map)) => map,
            _ => JsonMap::new(),
        }
    }

    pub fn from_fields(
        entity_type: EntityType,
        fields: &JsonMap<String, JsonValue>,
    ) -> Result<Self, serde_json::Error> {
        let value = JsonValue::Object(fields.clone());
        Ok(match entity_type {
            EntityType::EmployerBenefit => UnifiedBody::EmployerBenefit(serde_json::from_value(value)?),
            EntityType::Group => UnifiedBody::Group(serde_json::from_value(value)?),
            EntityType::Location => UnifiedBody::Location(serde_json::from_value(value)?),
            EntityType::TimeOffBalance => UnifiedBody::TimeOffBalance(serde_json::from_value(value)?),
        })
    }
}

/// Canonical record produced by a mapper, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub remote_id: String,
    pub remote_created_at: Option<DateTime<Utc>>,
    pub remote_was_deleted: bool,
    pub body: UnifiedBody,
    #[serde(default)]
    pub custom_fields: Vec<CustomFieldValue>,
}

impl UnifiedRecord {
    pub fn new(remote_id: impl Into<String>, body: UnifiedBody) -> Self {
        Self {
            remote_id: remote_id.into(),
            remote_created_at: None,
            remote_was_deleted: false,
            body,
            custom_fields: Vec::new(),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.body.entity_type()
    }
}

/// A canonical row as persisted by the ingestion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub id_connection: Uuid,
    pub remote_id: String,
    pub fields: JsonMap<String, JsonValue>,
    pub remote_was_deleted: bool,
    pub remote_created_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn body(&self) -> Result<UnifiedBody, serde_json::Error> {
        UnifiedBody::from_fields(self.entity_type, &self.fields)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCustomValue {
    pub id: Uuid,
    pub id_mapping: Uuid,
    pub id_record: Uuid,
    pub id_linked_user: Uuid,
    pub origin_source: String,
    pub value: JsonValue,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Archived provider payload, 1:1 with a persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPayload {
    pub id: Uuid,
    pub id_record: Uuid,
    pub payload: JsonValue,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Minimal independently retryable unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SyncUnit {
    pub entity_type: EntityType,
    pub provider: Provider,
    pub linked_user_id: Uuid,
    pub tenant_id: Option<Uuid>,
}

impl fmt::Display for SyncUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.entity_type, self.provider, self.linked_user_id
        )?;
        if let Some(tenant) = self.tenant_id {
            write!(f, "@{tenant}")?;
        }
        Ok(())
    }
}

pub const ENTITY_SYNCED_EVENT: &str = "entity.synced";

/// Notification emitted after a batch of canonical records was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedEvent {
    pub event_type: String,
    pub entity_type: EntityType,
    pub connection_id: Uuid,
    pub record_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl SyncedEvent {
    pub fn new(
        entity_type: EntityType,
        connection_id: Uuid,
        record_count: usize,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: ENTITY_SYNCED_EVENT.to_string(),
            entity_type,
            connection_id,
            record_count,
            timestamp,
        }
    }
}

/// Time source for persisted timestamps and events.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
