//! Deel: groups and legal-entity locations.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use unisync_core::{
    CustomFieldMapping, EntityType, Group as CanonicalGroup, Location, Provider, UnifiedBody,
    UnifiedRecord,
};
use uuid::Uuid;

use super::{
    check_record, insert_opt, mismatch, mismatched_raw, require_id, timestamp, with_custom_fields,
    Supported,
};
use crate::raw::{opt_id, RawBody};
use crate::rest::{Auth, Endpoint, Pagination};
use crate::{write_custom_fields, Mapper, MappingError, RawProviderRecord};

fn endpoint(path: &'static str) -> Endpoint {
    Endpoint {
        path,
        items_pointer: Some("/data"),
        pagination: Pagination::Cursor {
            param: "after_cursor",
            next_pointer: "/page/next_cursor",
        },
        auth: Auth::Bearer,
    }
}

pub fn supported() -> Vec<Supported> {
    vec![
        Supported {
            entity_type: EntityType::Group,
            endpoint: endpoint("/groups"),
            mapper: Arc::new(GroupMapper),
        },
        Supported {
            entity_type: EntityType::Location,
            endpoint: endpoint("/legal-entities"),
            mapper: Arc::new(LocationMapper),
        },
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Group {
    #[serde(default, deserialize_with = "opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "opt_id")]
    pub parent_id: Option<String>,
    #[serde(default, rename = "type")]
    pub group_type: Option<String>,
    #[serde(default)]
    pub is_archived: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub street_2: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zip: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LegalEntity {
    #[serde(default, deserialize_with = "opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub created_at: Option<String>,
}

pub struct GroupMapper;

impl Mapper for GroupMapper {
    fn provider(&self) -> Provider {
        Provider::Deel
    }

    fn entity_type(&self) -> EntityType {
        EntityType::Group
    }

    fn unify(
        &self,
        raw: &RawProviderRecord,
        _connection_id: Uuid,
        mappings: &[CustomFieldMapping],
    ) -> Result<Vec<UnifiedRecord>, MappingError> {
        let RawBody::DeelGroup(group) = &raw.body else {
            return Err(mismatched_raw(self, raw));
        };
        let remote_id = require_id(group.id.as_deref(), "id")?;
        let body = UnifiedBody::Group(CanonicalGroup {
            parent_group: group.parent_id.clone(),
            name: group.name.clone(),
            group_type: Some(
                group
                    .group_type
                    .as_deref()
                    .map(|t| t.trim().to_ascii_uppercase())
                    .unwrap_or_else(|| "TEAM".into()),
            ),
        });
        let mut record = UnifiedRecord::new(remote_id, body);
        record.remote_was_deleted = group.is_archived.unwrap_or(false);
        Ok(vec![with_custom_fields(record, raw, mappings)?])
    }

    fn desunify(
        &self,
        record: &UnifiedRecord,
        mappings: &[CustomFieldMapping],
    ) -> Result<JsonValue, MappingError> {
        check_record(self, record)?;
        let UnifiedBody::Group(group) = &record.body else {
            return Err(mismatch(self, record.entity_type()));
        };
        let mut out = JsonMap::new();
        out.insert("id".into(), json!(record.remote_id));
        insert_opt(&mut out, "name", &group.name);
        insert_opt(&mut out, "parent_id", &group.parent_group);
        insert_opt(&mut out, "type", &group.group_type.as_ref().map(|t| t.to_ascii_lowercase()));
        write_custom_fields(&mut out, record, mappings);
        Ok(JsonValue::Object(out))
    }
}

pub struct LocationMapper;

impl Mapper for LocationMapper {
    fn provider(&self) -> Provider {
        Provider::Deel
    }

    fn entity_type(&self) -> EntityType {
        EntityType::Location
    }

    fn unify(
        &self,
        raw: &RawProviderRecord,
        _connection_id: Uuid,
        mappings: &[CustomFieldMapping],
    ) -> Result<Vec<UnifiedRecord>, MappingError> {
        let RawBody::DeelLocation(entity) = &raw.body else {
            return Err(mismatched_raw(self, raw));
        };
        let remote_id = require_id(entity.id.as_deref(), "id")?;
        let address = entity.address.clone().unwrap_or_default();
        let body = UnifiedBody::Location(Location {
            name: entity.name.clone(),
            phone_number: entity.phone.clone(),
            street_1: address.street,
            street_2: address.street_2,
            city: address.city,
            state: address.state,
            zip_code: address.zip,
            country: address.country.or_else(|| entity.country.clone()),
            location_type: Some("WORK".into()),
        });
        let mut record = UnifiedRecord::new(remote_id, body);
        record.remote_created_at = timestamp(remote_id, "created_at", entity.created_at.as_deref())?;
        Ok(vec![with_custom_fields(record, raw, mappings)?])
    }

    fn desunify(
        &self,
        record: &UnifiedRecord,
        mappings: &[CustomFieldMapping],
    ) -> Result<JsonValue, MappingError> {
        check_record(self, record)?;
        let UnifiedBody::Location(location) = &record.body else {
            return Err(mismatch(self, record.entity_type()));
        };
        let mut address = JsonMap::new();
        insert_opt(&mut address, "street", &location.street_1);
        insert_opt(&mut address, "street_2", &location.street_2);
        insert_opt(&mut address, "city", &location.city);
        insert_opt(&mut address, "state", &location.state);
        insert_opt(&mut address, "zip", &location.zip_code);
        insert_opt(&mut address, "country", &location.country);

        let mut out = JsonMap::new();
        out.insert("id".into(), json!(record.remote_id));
        insert_opt(&mut out, "name", &location.name);
        insert_opt(&mut out, "phone", &location.phone_number);
        insert_opt(&mut out, "country", &location.country);
        if !address.is_empty() {
            out.insert("address".into(), JsonValue::Object(address));
        }
        write_custom_fields(&mut out, record, mappings);
        Ok(JsonValue::Object(out))
    }
}
