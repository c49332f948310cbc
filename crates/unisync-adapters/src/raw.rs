//! Typed decoding of provider payloads, keeping the original JSON alongside.

use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use unisync_core::{EntityType, Provider};

use crate::providers::{deel, gusto, sage};
use crate::MappingError;

/// Provider-native record shapes, one variant per registered (provider, entity type).
#[derive(Debug, Clone, PartialEq)]
pub enum RawBody {
    GustoBenefit(gusto::CompanyBenefit),
    GustoDepartment(gusto::Department),
    GustoLocation(gusto::Location),
    GustoTimeOffPolicy(gusto::TimeOffPolicy),
    DeelGroup(deel::Group),
    DeelLocation(deel::LegalEntity),
    SageBenefit(sage::Benefit),
    SageAllowance(sage::LeaveAllowance),
}

impl RawBody {
    pub fn decode(
        provider: Provider,
        entity_type: EntityType,
        value: &JsonValue,
    ) -> Result<Self, MappingError> {
        use EntityType as E;
        use Provider as P;

        match (provider, entity_type) {
            (P::Gusto, E::EmployerBenefit) => typed(value).map(RawBody::GustoBenefit),
            (P::Gusto, E::Group) => typed(value).map(RawBody::GustoDepartment),
            (P::Gusto, E::Location) => typed(value).map(RawBody::GustoLocation),
            (P::Gusto, E::TimeOffBalance) => typed(value).map(RawBody::GustoTimeOffPolicy),
            (P::Deel, E::Group) => typed(value).map(RawBody::DeelGroup),
            (P::Deel, E::Location) => typed(value).map(RawBody::DeelLocation),
            (P::Sage, E::EmployerBenefit) => typed(value).map(RawBody::SageBenefit),
            (P::Sage, E::TimeOffBalance) => typed(value).map(RawBody::SageAllowance),
            _ => Err(MappingError::Malformed {
                remote_id: loose_remote_id(value),
                message: format!("{provider} has no {entity_type} record shape"),
            }),
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            RawBody::GustoBenefit(_)
            | RawBody::GustoDepartment(_)
            | RawBody::GustoLocation(_)
            | RawBody::GustoTimeOffPolicy(_) => Provider::Gusto,
            RawBody::DeelGroup(_) | RawBody::DeelLocation(_) => Provider::Deel,
            RawBody::SageBenefit(_) | RawBody::SageAllowance(_) => Provider::Sage,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            RawBody::GustoBenefit(_) | RawBody::SageBenefit(_) => EntityType::EmployerBenefit,
            RawBody::GustoDepartment(_) | RawBody::DeelGroup(_) => EntityType::Group,
            RawBody::GustoLocation(_) | RawBody::DeelLocation(_) => EntityType::Location,
            RawBody::GustoTimeOffPolicy(_) | RawBody::SageAllowance(_) => EntityType::TimeOffBalance,
        }
    }

    pub fn remote_id(&self) -> Option<&str> {
        match self {
            RawBody::GustoBenefit(b) => b.uuid.as_deref(),
            RawBody::GustoDepartment(d) => d.uuid.as_deref(),
            RawBody::GustoLocation(l) => l.uuid.as_deref(),
            RawBody::GustoTimeOffPolicy(p) => p.uuid.as_deref(),
            RawBody::DeelGroup(g) => g.id.as_deref(),
            RawBody::DeelLocation(l) => l.id.as_deref(),
            RawBody::SageBenefit(b) => b.id.as_deref(),
            RawBody::SageAllowance(a) => a.id.as_deref(),
        }
    }
}

fn typed<T: DeserializeOwned>(value: &JsonValue) -> Result<T, MappingError> {
    T::deserialize(value).map_err(|err| MappingError::Malformed {
        remote_id: loose_remote_id(value),
        message: err.to_string(),
    })
}

fn loose_remote_id(value: &JsonValue) -> Option<String> {
    ["uuid", "id"]
        .iter()
        .find_map(|key| value.get(key))
        .and_then(id_string)
}

fn id_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts string or numeric identifiers; anything else reads as absent.
pub(crate) fn opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_string))
}

/// One provider record: the typed body plus the untouched JSON for archival.
#[derive(Debug, Clone, PartialEq)]
pub struct RawProviderRecord {
    pub body: RawBody,
    pub remote_data: JsonValue,
}

impl RawProviderRecord {
    pub fn decode(
        provider: Provider,
        entity_type: EntityType,
        remote_data: JsonValue,
    ) -> Result<Self, MappingError> {
        let body = RawBody::decode(provider, entity_type, &remote_data)?;
        Ok(Self { body, remote_data })
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.body.remote_id()
    }
}

/// One provider page. Elements that failed to decode are kept in `rejected`.
#[derive(Debug, Default)]
pub struct RawPage {
    pub records: Vec<RawProviderRecord>,
    pub rejected: Vec<MappingError>,
}

impl RawPage {
    pub fn decode_all(provider: Provider, entity_type: EntityType, items: Vec<JsonValue>) -> Self {
        let mut page = RawPage::default();
        for item in items {
            match RawProviderRecord::decode(provider, entity_type, item) {
                Ok(record) => page.records.push(record),
                Err(err) => page.rejected.push(err),
            }
        }
        page
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.rejected.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len() + self.rejected.len()
    }
}
