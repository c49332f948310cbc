//! Gusto: company benefits, departments, locations and time-off policies.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use unisync_core::{
    CustomFieldMapping, EmployerBenefit, EntityType, Group, Location as CanonicalLocation,
    Provider, TimeOffBalance, UnifiedBody, UnifiedRecord,
};
use uuid::Uuid;

use super::{
    check_record, decimal, insert_opt, mismatch, mismatched_raw, policy_type, require_id, timestamp,
    with_custom_fields, Supported,
};
use crate::raw::{opt_id, RawBody};
use crate::rest::{Auth, Endpoint, Pagination};
use crate::{write_custom_fields, Mapper, MappingError, RawProviderRecord};

const PER_PAGE: u32 = 100;

fn endpoint(path: &'static str) -> Endpoint {
    Endpoint {
        path,
        items_pointer: None,
        pagination: Pagination::PageNumber {
            param: "page",
            per_page_param: "per",
            per_page: PER_PAGE,
            total_pages_pointer: None,
        },
        auth: Auth::Bearer,
    }
}

pub fn supported() -> Vec<Supported> {
    vec![
        Supported {
            entity_type: EntityType::EmployerBenefit,
            endpoint: endpoint("/v1/companies/{account_id}/company_benefits"),
            mapper: Arc::new(BenefitMapper),
        },
        Supported {
            entity_type: EntityType::Group,
            endpoint: endpoint("/v1/companies/{account_id}/departments"),
            mapper: Arc::new(DepartmentMapper),
        },
        Supported {
            entity_type: EntityType::Location,
            endpoint: endpoint("/v1/companies/{account_id}/locations"),
            mapper: Arc::new(LocationMapper),
        },
        Supported {
            entity_type: EntityType::TimeOffBalance,
            endpoint: endpoint("/v1/companies/{account_id}/time_off_policies"),
            mapper: Arc::new(TimeOffMapper),
        },
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompanyBenefit {
    #[serde(default, deserialize_with = "opt_id")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub benefit_type: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Department {
    #[serde(default, deserialize_with = "opt_id")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Location {
    #[serde(default, deserialize_with = "opt_id")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub street_1: Option<String>,
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
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PolicyEmployee {
    #[serde(default, deserialize_with = "opt_id")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub balance: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TimeOffPolicy {
    #[serde(default, deserialize_with = "opt_id")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub policy_type: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub employees: Vec<PolicyEmployee>,
}

/// Gusto's numeric benefit types for the plans customers most commonly offer.
const BENEFIT_TYPES: &[(u32, &str)] = &[
    (1, "MEDICAL"),
    (2, "DENTAL"),
    (3, "VISION"),
    (5, "HSA"),
    (6, "FSA_MEDICAL"),
    (7, "FSA_DEPENDENT_CARE"),
    (105, "ROTH_401K"),
    (106, "TRADITIONAL_401K"),
    (107, "LIFE_INSURANCE"),
];

fn benefit_plan_type(code: u32) -> String {
    BENEFIT_TYPES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("GUSTO_{code}"))
}

fn benefit_code(plan_type: &str) -> Option<u32> {
    BENEFIT_TYPES
        .iter()
        .find(|(_, name)| *name == plan_type)
        .map(|(c, _)| *c)
        .or_else(|| plan_type.strip_prefix("GUSTO_")?.parse().ok())
}

pub struct BenefitMapper;

impl Mapper for BenefitMapper {
    fn provider(&self) -> Provider {
        Provider::Gusto
    }

    fn entity_type(&self) -> EntityType {
        EntityType::EmployerBenefit
    }

    fn unify(
        &self,
        raw: &RawProviderRecord,
        _connection_id: Uuid,
        mappings: &[CustomFieldMapping],
    ) -> Result<Vec<UnifiedRecord>, MappingError> {
        let RawBody::GustoBenefit(benefit) = &raw.body else {
            return Err(mismatched_raw(self, raw));
        };
        let remote_id = require_id(benefit.uuid.as_deref(), "uuid")?;
        let body = UnifiedBody::EmployerBenefit(EmployerBenefit {
            benefit_plan_type: benefit.benefit_type.map(benefit_plan_type),
            name: benefit.description.clone(),
            description: benefit.description.clone(),
            deduction_code: None,
        });
        let record = UnifiedRecord::new(remote_id, body);
        Ok(vec![with_custom_fields(record, raw, mappings)?])
    }

    fn desunify(
        &self,
        record: &UnifiedRecord,
        mappings: &[CustomFieldMapping],
    ) -> Result<JsonValue, MappingError> {
        check_record(self, record)?;
        let UnifiedBody::EmployerBenefit(benefit) = &record.body else {
            return Err(mismatch(self, record.entity_type()));
        };
        let mut out = JsonMap::new();
        out.insert("uuid".into(), json!(record.remote_id));
        insert_opt(&mut out, "description", &benefit.description.clone().or(benefit.name.clone()));
        if let Some(code) = benefit.benefit_plan_type.as_deref().and_then(benefit_code) {
            out.insert("benefit_type".into(), json!(code));
        }
        write_custom_fields(&mut out, record, mappings);
        Ok(JsonValue::Object(out))
    }
}

pub struct DepartmentMapper;

impl Mapper for DepartmentMapper {
    fn provider(&self) -> Provider {
        Provider::Gusto
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
        let RawBody::GustoDepartment(department) = &raw.body else {
            return Err(mismatched_raw(self, raw));
        };
        let remote_id = require_id(department.uuid.as_deref(), "uuid")?;
        let body = UnifiedBody::Group(Group {
            parent_group: None,
            name: department.title.clone(),
            group_type: Some("DEPARTMENT".into()),
        });
        let record = UnifiedRecord::new(remote_id, body);
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
        out.insert("uuid".into(), json!(record.remote_id));
        insert_opt(&mut out, "title", &group.name);
        write_custom_fields(&mut out, record, mappings);
        Ok(JsonValue::Object(out))
    }
}

pub struct LocationMapper;

impl Mapper for LocationMapper {
    fn provider(&self) -> Provider {
        Provider::Gusto
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
        let RawBody::GustoLocation(location) = &raw.body else {
            return Err(mismatched_raw(self, raw));
        };
        let remote_id = require_id(location.uuid.as_deref(), "uuid")?;
        let body = UnifiedBody::Location(CanonicalLocation {
            name: None,
            phone_number: location.phone_number.clone(),
            street_1: location.street_1.clone(),
            street_2: location.street_2.clone(),
            city: location.city.clone(),
            state: location.state.clone(),
            zip_code: location.zip.clone(),
            country: location.country.clone(),
            location_type: Some("WORK".into()),
        });
        let mut record = UnifiedRecord::new(remote_id, body);
        record.remote_created_at = timestamp(remote_id, "created_at", location.created_at.as_deref())?;
        record.remote_was_deleted = location.active == Some(false);
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
        let mut out = JsonMap::new();
        out.insert("uuid".into(), json!(record.remote_id));
        insert_opt(&mut out, "phone_number", &location.phone_number);
        insert_opt(&mut out, "street_1", &location.street_1);
        insert_opt(&mut out, "street_2", &location.street_2);
        insert_opt(&mut out, "city", &location.city);
        insert_opt(&mut out, "state", &location.state);
        insert_opt(&mut out, "zip", &location.zip_code);
        insert_opt(&mut out, "country", &location.country);
        write_custom_fields(&mut out, record, mappings);
        Ok(JsonValue::Object(out))
    }
}

/// Gusto reports balances per policy; each enrolled employee becomes one canonical balance.
pub struct TimeOffMapper;

fn balance_remote_id(policy: &str, employee: &str) -> String {
    format!("{policy}:{employee}")
}

impl Mapper for TimeOffMapper {
    fn provider(&self) -> Provider {
        Provider::Gusto
    }

    fn entity_type(&self) -> EntityType {
        EntityType::TimeOffBalance
    }

    fn unify(
        &self,
        raw: &RawProviderRecord,
        _connection_id: Uuid,
        mappings: &[CustomFieldMapping],
    ) -> Result<Vec<UnifiedRecord>, MappingError> {
        let RawBody::GustoTimeOffPolicy(policy) = &raw.body else {
            return Err(mismatched_raw(self, raw));
        };
        let policy_id = require_id(policy.uuid.as_deref(), "uuid")?;
        let deleted = policy.is_active == Some(false);

        let mut records = Vec::with_capacity(policy.employees.len());
        for (i, employee) in policy.employees.iter().enumerate() {
            let employee_id = employee
                .uuid
                .as_deref()
                .filter(|id| !id.is_empty())
                .ok_or_else(|| MappingError::missing(Some(policy_id), format!("employees[{i}].uuid")))?;
            let remote_id = balance_remote_id(policy_id, employee_id);
            let balance = decimal(&remote_id, "balance", employee.balance.as_ref())?;
            let body = UnifiedBody::TimeOffBalance(TimeOffBalance {
                employee: Some(employee_id.to_string()),
                balance,
                used: None,
                policy_type: policy.policy_type.as_deref().map(policy_type),
            });
            let mut record = UnifiedRecord::new(remote_id, body);
            record.remote_was_deleted = deleted;
            records.push(with_custom_fields(record, raw, mappings)?);
        }
        Ok(records)
    }

    fn desunify(
        &self,
        record: &UnifiedRecord,
        mappings: &[CustomFieldMapping],
    ) -> Result<JsonValue, MappingError> {
        check_record(self, record)?;
        let UnifiedBody::TimeOffBalance(balance) = &record.body else {
            return Err(mismatch(self, record.entity_type()));
        };
        let (policy_id, employee_id) = match record.remote_id.split_once(':') {
            Some((policy, employee)) => (policy.to_string(), Some(employee.to_string())),
            None => (record.remote_id.clone(), balance.employee.clone()),
        };
        let employee_id = employee_id
            .or_else(|| balance.employee.clone())
            .ok_or_else(|| MappingError::missing(Some(&record.remote_id), "employee"))?;

        let mut out = JsonMap::new();
        out.insert("uuid".into(), json!(policy_id));
        if let Some(kind) = &balance.policy_type {
            out.insert("policy_type".into(), json!(kind.to_ascii_lowercase()));
        }
        let mut employee = JsonMap::new();
        employee.insert("uuid".into(), json!(employee_id));
        if let Some(amount) = balance.balance {
            employee.insert("balance".into(), json!(format!("{amount:.1}")));
        }
        out.insert("employees".into(), JsonValue::Array(vec![JsonValue::Object(employee)]));
        write_custom_fields(&mut out, record, mappings);
        Ok(JsonValue::Object(out))
    }
}
