//! Sage HR: benefits and leave allowances.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use unisync_core::{
    CustomFieldMapping, EmployerBenefit, EntityType, Provider, TimeOffBalance, UnifiedBody,
    UnifiedRecord,
};
use uuid::Uuid;

use super::{
    check_record, decimal, insert_opt, mismatch, mismatched_raw, policy_type, require_id,
    with_custom_fields, Supported,
};
use crate::raw::{opt_id, RawBody};
use crate::rest::{Auth, Endpoint, Pagination};
use crate::{write_custom_fields, Mapper, MappingError, RawProviderRecord};

const AUTH_HEADER: &str = "X-Auth-Token";

fn endpoint(path: &'static str) -> Endpoint {
    Endpoint {
        path,
        items_pointer: Some("/data"),
        pagination: Pagination::PageNumber {
            param: "page",
            per_page_param: "per_page",
            per_page: 50,
            total_pages_pointer: Some("/meta/total_pages"),
        },
        auth: Auth::Header(AUTH_HEADER),
    }
}

pub fn supported() -> Vec<Supported> {
    vec![
        Supported {
            entity_type: EntityType::EmployerBenefit,
            endpoint: endpoint("/benefits"),
            mapper: Arc::new(BenefitMapper),
        },
        Supported {
            entity_type: EntityType::TimeOffBalance,
            endpoint: endpoint("/leave-management/allowances"),
            mapper: Arc::new(AllowanceMapper),
        },
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Benefit {
    #[serde(default, deserialize_with = "opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub benefit_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub payroll_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LeaveAllowance {
    #[serde(default, deserialize_with = "opt_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "opt_id")]
    pub employee_id: Option<String>,
    #[serde(default)]
    pub policy_name: Option<String>,
    #[serde(default)]
    pub remaining: Option<JsonValue>,
    #[serde(default)]
    pub used: Option<JsonValue>,
}

pub struct BenefitMapper;

impl Mapper for BenefitMapper {
    fn provider(&self) -> Provider {
        Provider::Sage
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
        let RawBody::SageBenefit(benefit) = &raw.body else {
            return Err(mismatched_raw(self, raw));
        };
        let remote_id = require_id(benefit.id.as_deref(), "id")?;
        let body = UnifiedBody::EmployerBenefit(EmployerBenefit {
            benefit_plan_type: benefit
                .benefit_type
                .as_deref()
                .map(|t| t.trim().to_ascii_uppercase().replace(' ', "_")),
            name: benefit.name.clone(),
            description: benefit.description.clone(),
            deduction_code: benefit.payroll_code.clone(),
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
        out.insert("id".into(), json!(record.remote_id));
        insert_opt(&mut out, "name", &benefit.name);
        insert_opt(&mut out, "description", &benefit.description);
        insert_opt(&mut out, "payroll_code", &benefit.deduction_code);
        insert_opt(
            &mut out,
            "type",
            &benefit
                .benefit_plan_type
                .as_ref()
                .map(|t| t.to_ascii_lowercase().replace('_', " ")),
        );
        write_custom_fields(&mut out, record, mappings);
        Ok(JsonValue::Object(out))
    }
}

pub struct AllowanceMapper;

impl Mapper for AllowanceMapper {
    fn provider(&self) -> Provider {
        Provider::Sage
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
        let RawBody::SageAllowance(allowance) = &raw.body else {
            return Err(mismatched_raw(self, raw));
        };
        let remote_id = require_id(allowance.id.as_deref(), "id")?;
        let employee = allowance
            .employee_id
            .clone()
            .ok_or_else(|| MappingError::missing(Some(remote_id), "employee_id"))?;
        let body = UnifiedBody::TimeOffBalance(TimeOffBalance {
            employee: Some(employee),
            balance: decimal(remote_id, "remaining", allowance.remaining.as_ref())?,
            used: decimal(remote_id, "used", allowance.used.as_ref())?,
            policy_type: allowance.policy_name.as_deref().map(policy_type),
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
        let UnifiedBody::TimeOffBalance(balance) = &record.body else {
            return Err(mismatch(self, record.entity_type()));
        };
        let mut out = JsonMap::new();
        out.insert("id".into(), json!(record.remote_id));
        insert_opt(&mut out, "employee_id", &balance.employee);
        insert_opt(&mut out, "policy_name", &balance.policy_type);
        if let Some(remaining) = balance.balance {
            out.insert("remaining".into(), json!(remaining));
        }
        if let Some(used) = balance.used {
            out.insert("used".into(), json!(used));
        }
        write_custom_fields(&mut out, record, mappings);
        Ok(JsonValue::Object(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::fixtures;
    use crate::rest::parse_page;
    use crate::PageCursor;

    #[test]
    fn allowances_fixture_parses_string_and_numeric_amounts() {
        let page = fixtures::page(Provider::Sage, EntityType::TimeOffBalance);
        let records = fixtures::unify_all(&AllowanceMapper, &page, &[]);
        assert_eq!(records.len(), 2);
        let UnifiedBody::TimeOffBalance(first) = &records[0].body else {
            panic!("expected a balance");
        };
        assert_eq!(records[0].remote_id, "901");
        assert_eq!(first.employee.as_deref(), Some("17"));
        assert_eq!(first.balance, Some(12.5));
        assert_eq!(first.used, Some(7.5));
        assert_eq!(first.policy_type.as_deref(), Some("VACATION"));
    }

    #[test]
    fn allowance_with_bad_amount_names_the_field() {
        let raw = RawProviderRecord::decode(
            Provider::Sage,
            EntityType::TimeOffBalance,
            json!({"id": 5, "employee_id": 3, "remaining": "n/a"}),
        )
        .unwrap();
        let err = AllowanceMapper.unify(&raw, Uuid::nil(), &[]).unwrap_err();
        assert_eq!(err.field(), Some("remaining"));
        assert_eq!(err.remote_id(), Some("5"));
    }

    #[test]
    fn benefits_fixture_follows_total_pages() {
        let endpoint = supported().remove(0).endpoint;
        let body = fixtures::response(Provider::Sage, EntityType::EmployerBenefit);
        let (items, next) = parse_page(&endpoint, &body, None).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(next, Some(PageCursor::Page(2)));

        let page = fixtures::page(Provider::Sage, EntityType::EmployerBenefit);
        let records = fixtures::unify_all(&BenefitMapper, &page, &[]);
        let UnifiedBody::EmployerBenefit(pension) = &records[1].body else {
            panic!("expected a benefit");
        };
        assert_eq!(pension.benefit_plan_type.as_deref(), Some("PENSION"));
        assert_eq!(pension.deduction_code.as_deref(), Some("PEN01"));
        let back = BenefitMapper.desunify(&records[1], &[]).unwrap();
        assert_eq!(back["type"], json!("pension"));
    }

    #[test]
    fn desunify_refuses_foreign_entity_types() {
        let record = UnifiedRecord::new("x", UnifiedBody::Group(Default::default()));
        let err = BenefitMapper.desunify(&record, &[]).unwrap_err();
        assert!(matches!(err, MappingError::EntityMismatch { actual: EntityType::Group, .. }));
    }
}
