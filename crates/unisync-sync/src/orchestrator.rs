//! Discovers sync units for one entity type and runs them on a bounded pool.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;
use unisync_adapters::{Integration, ProviderFetchError, ServiceRegistry};
use unisync_core::{Clock, EntityType, LinkedAccount, Provider, SyncUnit, SyncedEvent, UnifiedRecord};
use unisync_storage::AccountDirectory;
use uuid::Uuid;

use crate::ingest::IngestService;
use crate::notifier::EventNotifier;
use crate::UnitError;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent_units: usize,
    pub default_fetch_timeout: Duration,
    pub fetch_timeouts: BTreeMap<Provider, Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_units: 8,
            default_fetch_timeout: Duration::from_secs(60),
            fetch_timeouts: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn fetch_timeout(&self, provider: Provider) -> Duration {
        self.fetch_timeouts
            .get(&provider)
            .copied()
            .unwrap_or(self.default_fetch_timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No integration for the (entity type, provider) pair.
    NotRegistered,
    /// The linked account has no connection to the provider.
    NoConnection,
    /// The linked account is unknown or not active.
    LinkedAccountUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum UnitStatus {
    Succeeded,
    /// Completed, but some records failed to map or persist.
    Partial,
    Failed,
    Skipped(SkipReason),
    /// Not started because shutdown was requested.
    Cancelled,
}

#[derive(Debug, Serialize)]
pub struct UnitOutcome {
    pub entity_type: EntityType,
    pub provider_id: String,
    pub linked_user_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub status: UnitStatus,
    pub pages: usize,
    pub records_persisted: usize,
    pub records_failed: usize,
    #[serde(skip)]
    pub errors: Vec<UnitError>,
}

impl UnitOutcome {
    fn new(unit: &SyncUnit, status: UnitStatus) -> Self {
        Self::for_parts(unit.entity_type, unit.provider.as_str(), unit.linked_user_id, unit.tenant_id, status)
    }

    fn for_parts(
        entity_type: EntityType,
        provider_id: &str,
        linked_user_id: Uuid,
        tenant_id: Option<Uuid>,
        status: UnitStatus,
    ) -> Self {
        Self {
            entity_type,
            provider_id: provider_id.to_string(),
            linked_user_id,
            tenant_id,
            status,
            pages: 0,
            records_persisted: 0,
            records_failed: 0,
            errors: Vec::new(),
        }
    }

    fn record_failure(&mut self, error: UnitError) {
        self.records_failed += 1;
        self.errors.push(error);
    }

    fn fail(mut self, error: UnitError) -> Self {
        tracing::error!(
            entity_type = %self.entity_type,
            provider = %self.provider_id,
            linked_user_id = %self.linked_user_id,
            tenant_id = ?self.tenant_id,
            error = %error,
            "sync unit failed"
        );
        self.status = UnitStatus::Failed;
        self.errors.push(error);
        self
    }

    fn finish(mut self) -> Self {
        self.status = if self.records_failed == 0 {
            UnitStatus::Succeeded
        } else {
            UnitStatus::Partial
        };
        self
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}: {:?} ({} persisted, {} failed)",
            self.entity_type,
            self.provider_id,
            self.linked_user_id,
            self.status,
            self.records_persisted,
            self.records_failed
        )
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub entity_type: EntityType,
    pub tenant_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub units: Vec<UnitOutcome>,
    /// Directory lookups that failed while enumerating units.
    pub discovery_errors: Vec<String>,
}

impl RunReport {
    fn count(&self, pred: impl Fn(&UnitStatus) -> bool) -> usize {
        self.units.iter().filter(|u| pred(&u.status)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| *s == UnitStatus::Succeeded)
    }

    pub fn partial(&self) -> usize {
        self.count(|s| *s == UnitStatus::Partial)
    }

    pub fn failed(&self) -> usize {
        self.count(|s| *s == UnitStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::Skipped(_)))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|s| *s == UnitStatus::Cancelled)
    }

    pub fn records_persisted(&self) -> usize {
        self.units.iter().map(|u| u.records_persisted).sum()
    }

    pub fn records_failed(&self) -> usize {
        self.units.iter().map(|u| u.records_failed).sum()
    }
}

/// Drives full syncs of one entity type. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct SyncOrchestrator {
    entity_type: EntityType,
    registry: Arc<ServiceRegistry>,
    directory: Arc<dyn AccountDirectory>,
    ingest: Arc<IngestService>,
    notifier: Arc<dyn EventNotifier>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    shutdown: watch::Receiver<bool>,
}

struct Discovered {
    unit: SyncUnit,
    origin_source: String,
}

impl SyncOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entity_type: EntityType,
        registry: Arc<ServiceRegistry>,
        directory: Arc<dyn AccountDirectory>,
        ingest: Arc<IngestService>,
        notifier: Arc<dyn EventNotifier>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            entity_type,
            registry,
            directory,
            ingest,
            notifier,
            clock,
            config,
            shutdown,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Syncs every active linked account of every tenant (or only `tenant_id`)
    /// against every provider. Unit failures are contained in the report.
    pub async fn kickstart_sync(&self, tenant_id: Option<Uuid>) -> RunReport {
        let started_at = self.clock.now();
        let span = tracing::info_span!("sync_run", entity_type = %self.entity_type, tenant_id = ?tenant_id);
        let (units, discovery_errors) = self.discover(tenant_id).instrument(span.clone()).await;
        let outcomes = self.run_units(units).instrument(span).await;

        let report = RunReport {
            entity_type: self.entity_type,
            tenant_id,
            started_at,
            finished_at: self.clock.now(),
            units: outcomes,
            discovery_errors,
        };
        tracing::info!(
            entity_type = %self.entity_type,
            units = report.units.len(),
            succeeded = report.succeeded(),
            partial = report.partial(),
            failed = report.failed(),
            skipped = report.skipped(),
            cancelled = report.cancelled(),
            records_persisted = report.records_persisted(),
            records_failed = report.records_failed(),
            "sync run finished"
        );
        report
    }

    /// Runs a single unit on demand, e.g. right after an account was linked.
    pub async fn sync_for_linked_user(&self, provider_id: &str, linked_user_id: Uuid) -> UnitOutcome {
        let skipped = |tenant_id, reason| {
            tracing::debug!(
                entity_type = %self.entity_type,
                provider = provider_id,
                linked_user_id = %linked_user_id,
                ?reason,
                "skipping sync unit"
            );
            UnitOutcome::for_parts(
                self.entity_type,
                provider_id,
                linked_user_id,
                tenant_id,
                UnitStatus::Skipped(reason),
            )
        };

        let linked = match self.directory.linked_account(linked_user_id).await {
            Ok(Some(linked)) if linked.is_active() => linked,
            Ok(_) => return skipped(None, SkipReason::LinkedAccountUnavailable),
            Err(err) => {
                return UnitOutcome::for_parts(self.entity_type, provider_id, linked_user_id, None, UnitStatus::Failed)
                    .fail(err.into())
            }
        };
        let tenant_id = match self.directory.project(linked.id_project).await {
            Ok(project) => project.map(|p| p.id_tenant),
            Err(err) => {
                tracing::warn!(linked_user_id = %linked_user_id, error = %err, "could not resolve tenant");
                None
            }
        };

        let Some(integration) = self.registry.resolve(self.entity_type, provider_id) else {
            return skipped(tenant_id, SkipReason::NotRegistered);
        };
        let unit = SyncUnit {
            entity_type: self.entity_type,
            provider: integration.provider(),
            linked_user_id,
            tenant_id,
        };
        if self.shutting_down() {
            return UnitOutcome::new(&unit, UnitStatus::Cancelled);
        }
        self.run_unit(unit, linked.origin_source).await
    }

    async fn discover(&self, tenant_id: Option<Uuid>) -> (Vec<Discovered>, Vec<String>) {
        let mut units = Vec::new();
        let mut errors = Vec::new();

        let tenants = match self.directory.tenants(tenant_id).await {
            Ok(tenants) => tenants,
            Err(err) => {
                tracing::error!(error = %err, "listing tenants failed");
                errors.push(format!("tenants: {err}"));
                return (units, errors);
            }
        };

        for tenant in tenants {
            let projects = match self.directory.projects(tenant.id).await {
                Ok(projects) => projects,
                Err(err) => {
                    tracing::error!(tenant_id = %tenant.id, error = %err, "listing projects failed");
                    errors.push(format!("tenant {}: {err}", tenant.id));
                    continue;
                }
            };
            for project in projects {
                let linked_accounts = match self.directory.linked_accounts(project.id).await {
                    Ok(accounts) => accounts,
                    Err(err) => {
                        tracing::error!(project_id = %project.id, error = %err, "listing linked accounts failed");
                        errors.push(format!("project {}: {err}", project.id));
                        continue;
                    }
                };
                for linked in linked_accounts.into_iter().filter(LinkedAccount::is_active) {
                    for provider in Provider::ALL {
                        units.push(Discovered {
                            unit: SyncUnit {
                                entity_type: self.entity_type,
                                provider,
                                linked_user_id: linked.id,
                                tenant_id: Some(tenant.id),
                            },
                            origin_source: linked.origin_source.clone(),
                        });
                    }
                }
            }
        }
        (units, errors)
    }

    async fn run_units(&self, units: Vec<Discovered>) -> Vec<UnitOutcome> {
        let limit = Arc::new(Semaphore::new(self.config.max_concurrent_units.max(1)));
        let mut running = JoinSet::new();
        let mut outcomes = Vec::with_capacity(units.len());

        for Discovered { unit, origin_source } in units {
            let Ok(permit) = limit.clone().acquire_owned().await else {
                break;
            };
            if self.shutting_down() {
                outcomes.push(UnitOutcome::new(&unit, UnitStatus::Cancelled));
                continue;
            }
            let this = self.clone();
            running.spawn(async move {
                let _permit = permit;
                this.run_unit(unit, origin_source).await
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => tracing::error!(error = %err, "sync unit task panicked"),
            }
        }
        outcomes
    }

    async fn run_unit(&self, unit: SyncUnit, origin_source: String) -> UnitOutcome {
        let span = tracing::info_span!(
            "sync_unit",
            entity_type = %unit.entity_type,
            provider = %unit.provider,
            linked_user_id = %unit.linked_user_id,
            tenant_id = ?unit.tenant_id,
        );
        self.run_unit_inner(unit, origin_source).instrument(span).await
    }

    async fn run_unit_inner(&self, unit: SyncUnit, origin_source: String) -> UnitOutcome {
        let mut outcome = UnitOutcome::new(&unit, UnitStatus::Succeeded);

        let Some(integration) = self.registry.get(unit.entity_type, unit.provider) else {
            outcome.status = UnitStatus::Skipped(SkipReason::NotRegistered);
            return outcome;
        };
        let connection = match self
            .directory
            .connection(unit.linked_user_id, unit.provider)
            .await
        {
            Ok(Some(connection)) => connection,
            Ok(None) => {
                tracing::debug!("no connection for provider, skipping");
                outcome.status = UnitStatus::Skipped(SkipReason::NoConnection);
                return outcome;
            }
            Err(err) => return outcome.fail(err.into()),
        };
        let mappings: Vec<_> = match self
            .directory
            .custom_field_mappings(unit.linked_user_id, unit.entity_type)
            .await
        {
            Ok(mappings) => mappings
                .into_iter()
                .filter(|m| unit.provider.matches_slug(&m.provider_slug))
                .collect(),
            Err(err) => return outcome.fail(err.into()),
        };

        let ctx = connection.context(unit.provider);
        let timeout = self.config.fetch_timeout(unit.provider);
        let mut sequence = integration.adapter.records(&ctx);

        loop {
            let page = match tokio::time::timeout(timeout, sequence.next_batch()).await {
                Err(_) => {
                    let err = ProviderFetchError::timeout(unit.provider, unit.entity_type, timeout);
                    return outcome.fail(err.into());
                }
                Ok(Err(err)) => return outcome.fail(err.into()),
                Ok(Ok(None)) => break,
                Ok(Ok(Some(page))) => page,
            };
            outcome.pages += 1;

            for rejected in page.rejected {
                tracing::warn!(connection_id = %connection.id, remote_id = ?rejected.remote_id(), error = %rejected, "provider record rejected");
                outcome.record_failure(rejected.into());
            }

            let (records, raws) = self.unify_page(integration, &page.records, connection.id, &mappings, &mut outcome);
            if records.is_empty() {
                continue;
            }

            let report = self
                .ingest
                .save_to_db(connection.id, unit.linked_user_id, &records, &origin_source, &raws)
                .await;
            outcome.records_persisted += report.persisted.len();
            for failure in report.failed {
                outcome.record_failure(failure.error.into());
            }

            if !report.persisted.is_empty() {
                let event = SyncedEvent::new(
                    unit.entity_type,
                    connection.id,
                    report.persisted.len(),
                    self.clock.now(),
                );
                if let Err(err) = self.notifier.notify(&event).await {
                    tracing::warn!(connection_id = %connection.id, error = %err, "event notification failed");
                }
            }
        }

        let outcome = outcome.finish();
        tracing::info!(
            pages = outcome.pages,
            records_persisted = outcome.records_persisted,
            records_failed = outcome.records_failed,
            "sync unit finished"
        );
        outcome
    }

    /// Unified records plus the raw payload each one came from, index-aligned.
    fn unify_page(
        &self,
        integration: &Integration,
        raws: &[unisync_adapters::RawProviderRecord],
        connection_id: Uuid,
        mappings: &[unisync_core::CustomFieldMapping],
        outcome: &mut UnitOutcome,
    ) -> (Vec<UnifiedRecord>, Vec<serde_json::Value>) {
        let mut records = Vec::with_capacity(raws.len());
        let mut payloads = Vec::with_capacity(raws.len());
        for raw in raws {
            match integration.mapper.unify(raw, connection_id, mappings) {
                Ok(unified) => {
                    for record in unified {
                        payloads.push(raw.remote_data.clone());
                        records.push(record);
                    }
                }
                Err(err) => {
                    tracing::warn!(connection_id = %connection_id, remote_id = ?raw.remote_id(), error = %err, "record could not be unified");
                    outcome.record_failure(err.into());
                }
            }
        }
        (records, payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::World;
    use serde_json::json;
    use unisync_storage::FailurePoint;

    #[tokio::test]
    async fn first_sync_persists_every_record_and_notifies_once_per_page() {
        let world = World::new().await;
        let linked = world.linked_account("hris-app", "active").await;
        world.connect(linked, Provider::Deel).await;
        world.serve(Provider::Deel, EntityType::Group, vec![vec![
            json!({"id": "g-1", "name": "Ops"}),
            json!({"id": "g-2", "name": "Eng"}),
            json!({"id": "g-3", "name": "Sales"}),
        ]]);
        let orchestrator = world.orchestrator(EntityType::Group).await;

        let report = orchestrator.kickstart_sync(None).await;

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.records_persisted(), 3);
        let stored = world.store.records(EntityType::Group).await;
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|r| r.created_at == r.modified_at));
        assert_eq!(world.store.raw_payload_count().await, 3);

        let events = world.notifier.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].record_count, 3);
        assert_eq!(events[0].event_type, "entity.synced");
    }

    #[tokio::test]
    async fn rerun_updates_in_place_without_new_rows() {
        let world = World::new().await;
        let linked = world.linked_account("hris-app", "active").await;
        world.connect(linked, Provider::Deel).await;
        world.serve(Provider::Deel, EntityType::Group, vec![vec![json!({"id": "g-1", "name": "Ops"})]]);
        let orchestrator = world.orchestrator(EntityType::Group).await;
        orchestrator.kickstart_sync(None).await;
        let before = world.store.records(EntityType::Group).await.remove(0);

        world.serve(Provider::Deel, EntityType::Group, vec![vec![json!({"id": "g-1", "name": "Operations"})]]);
        orchestrator.kickstart_sync(None).await;
        let after = world.store.records(EntityType::Group).await;

        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, before.id);
        assert_eq!(after[0].created_at, before.created_at);
        assert!(after[0].modified_at > before.modified_at);
        assert_eq!(after[0].fields["name"], json!("Operations"));
    }

    #[tokio::test]
    async fn failed_unit_does_not_affect_siblings() {
        let world = World::new().await;
        let broken = world.linked_account("hris-app", "active").await;
        let healthy = world.linked_account("hris-app", "active").await;
        world.connect(broken, Provider::Deel).await;
        world.connect(healthy, Provider::Gusto).await;
        world.fail_fetch(Provider::Deel, EntityType::Group);
        world.serve(Provider::Gusto, EntityType::Group, vec![vec![json!({"uuid": "d-1", "title": "Eng"})]]);
        let orchestrator = world.orchestrator(EntityType::Group).await;

        let report = orchestrator.kickstart_sync(None).await;

        assert_eq!(report.failed(), 1);
        assert_eq!(report.succeeded(), 1);
        let failed = report.units.iter().find(|u| u.status == UnitStatus::Failed).unwrap();
        assert_eq!(failed.linked_user_id, broken);
        assert!(matches!(failed.errors[0], UnitError::Fetch(_)));
        assert_eq!(world.store.records(EntityType::Group).await.len(), 1);
    }

    #[tokio::test]
    async fn unregistered_pairs_and_missing_connections_are_skipped() {
        let world = World::new().await;
        let linked = world.linked_account("hris-app", "active").await;
        world.connect(linked, Provider::Deel).await;
        let orchestrator = world.orchestrator(EntityType::TimeOffBalance).await;

        let report = orchestrator.kickstart_sync(None).await;

        assert_eq!(report.units.len(), Provider::COUNT);
        assert_eq!(report.skipped(), Provider::COUNT);
        assert_eq!(report.failed(), 0);
        assert_eq!(world.store.record_count().await, 0);

        let on_demand = orchestrator.sync_for_linked_user("X", linked).await;
        assert_eq!(on_demand.status, UnitStatus::Skipped(SkipReason::NotRegistered));
        assert_eq!(on_demand.provider_id, "X");
    }

    #[tokio::test]
    async fn inactive_linked_accounts_are_not_discovered() {
        let world = World::new().await;
        let inactive = world.linked_account("hris-app", "inactive").await;
        world.connect(inactive, Provider::Deel).await;
        world.serve(Provider::Deel, EntityType::Group, vec![vec![json!({"id": "g-1"})]]);
        let orchestrator = world.orchestrator(EntityType::Group).await;

        let report = orchestrator.kickstart_sync(None).await;
        assert!(report.units.is_empty());

        let on_demand = orchestrator.sync_for_linked_user("deel", inactive).await;
        assert_eq!(on_demand.status, UnitStatus::Skipped(SkipReason::LinkedAccountUnavailable));
    }

    #[tokio::test]
    async fn partial_batch_keeps_good_records() {
        let world = World::new().await;
        let linked = world.linked_account("hris-app", "active").await;
        world.connect(linked, Provider::Deel).await;
        world.store.inject_failure(FailurePoint::RecordWrite, "g-2").await;
        world.serve(Provider::Deel, EntityType::Group, vec![vec![
            json!({"id": "g-1", "name": "A"}),
            json!({"id": "g-2", "name": "B"}),
            json!({"name": "no id"}),
            json!({"id": "g-4", "name": ["bad"]}),
        ]]);
        let orchestrator = world.orchestrator(EntityType::Group).await;

        let outcome = orchestrator.sync_for_linked_user("deel", linked).await;

        assert_eq!(outcome.status, UnitStatus::Partial);
        assert_eq!(outcome.records_persisted, 1);
        assert_eq!(outcome.records_failed, 3);
        assert!(outcome.errors.iter().any(|e| matches!(e, UnitError::Persistence(_))));
        assert!(outcome.errors.iter().any(|e| matches!(e, UnitError::Mapping(_))));
        assert_eq!(world.notifier.events().await[0].record_count, 1);
    }

    #[tokio::test]
    async fn custom_fields_follow_provider_scoped_mappings() {
        let world = World::new().await;
        let linked = world.linked_account("hris-app", "active").await;
        world.connect(linked, Provider::Deel).await;
        let cost_center = world.map_field(linked, EntityType::Group, Provider::Deel, "cost_center", "cc").await;
        world.map_field(linked, EntityType::Group, Provider::Gusto, "gusto_only", "cc").await;
        world.serve(Provider::Deel, EntityType::Group, vec![vec![json!({"id": "g-1", "name": "Ops", "cc": "CC-7"})]]);
        let orchestrator = world.orchestrator(EntityType::Group).await;

        orchestrator.kickstart_sync(None).await;

        let stored = world.store.records(EntityType::Group).await.remove(0);
        let values = world.store.stored_custom_values(stored.id).await;
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].id_mapping, cost_center);
        assert_eq!(values[0].value, json!("CC-7"));
        assert_eq!(values[0].origin_source, "hris-app");
    }

    #[tokio::test]
    async fn missing_required_custom_field_fails_only_that_record() {
        let world = World::new().await;
        let linked = world.linked_account("hris-app", "active").await;
        let sibling = world.linked_account("hris-app", "active").await;
        world.connect(linked, Provider::Deel).await;
        world.connect(sibling, Provider::Gusto).await;
        let cost_center = world
            .map_required_field(linked, EntityType::Group, Provider::Deel, "cost_center", "cc")
            .await;
        world.serve(Provider::Deel, EntityType::Group, vec![vec![
            json!({"id": "g-1", "name": "Ops", "cc": "CC-7"}),
            json!({"id": "g-2", "name": "Eng"}),
        ]]);
        world.serve(Provider::Gusto, EntityType::Group, vec![vec![json!({"uuid": "d-1", "title": "Eng"})]]);
        let orchestrator = world.orchestrator(EntityType::Group).await;

        let report = orchestrator.kickstart_sync(None).await;

        assert_eq!(report.partial(), 1);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 0);
        let deel = report.units.iter().find(|u| u.linked_user_id == linked).unwrap();
        assert_eq!(deel.records_persisted, 1);
        assert_eq!(deel.records_failed, 1);
        assert!(matches!(deel.errors[..], [UnitError::Mapping(_)]));

        let stored = world.store.records(EntityType::Group).await;
        let mut remote_ids: Vec<_> = stored.iter().map(|r| r.remote_id.as_str()).collect();
        remote_ids.sort();
        assert_eq!(remote_ids, vec!["d-1", "g-1"]);
        let g1 = stored.iter().find(|r| r.remote_id == "g-1").unwrap();
        let values = world.store.stored_custom_values(g1.id).await;
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].id_mapping, cost_center);
        assert_eq!(values[0].value, json!("CC-7"));
    }

    #[tokio::test]
    async fn provider_aliases_resolve_connections_and_mappings() {
        let world = World::new().await;
        let linked = world.linked_account("hris-app", "active").await;
        world.connect_as(linked, "sage_hr").await;
        let mapping = world
            .add_mapping(linked, EntityType::EmployerBenefit, "SageHR", "carrier", "carrier", false)
            .await;
        world.serve(Provider::Sage, EntityType::EmployerBenefit, vec![vec![
            json!({"id": 7, "name": "Dental", "carrier": "Delta"}),
        ]]);
        let orchestrator = world.orchestrator(EntityType::EmployerBenefit).await;

        let outcome = orchestrator.sync_for_linked_user("sage", linked).await;

        assert_eq!(outcome.status, UnitStatus::Succeeded);
        assert_eq!(outcome.records_persisted, 1);
        let stored = world.store.records(EntityType::EmployerBenefit).await.remove(0);
        let values = world.store.stored_custom_values(stored.id).await;
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].id_mapping, mapping);
    }

    #[tokio::test]
    async fn slow_provider_times_out_as_unit_failure() {
        let world = World::new().await;
        let linked = world.linked_account("hris-app", "active").await;
        world.connect(linked, Provider::Deel).await;
        world.delay_fetch(Provider::Deel, EntityType::Group, Duration::from_secs(5));
        let orchestrator = world
            .orchestrator_with(EntityType::Group, OrchestratorConfig {
                default_fetch_timeout: Duration::from_millis(50),
                ..Default::default()
            })
            .await;

        let outcome = orchestrator.sync_for_linked_user("deel", linked).await;

        assert_eq!(outcome.status, UnitStatus::Failed);
        let UnitError::Fetch(err) = &outcome.errors[0] else {
            panic!("expected a fetch error");
        };
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn shutdown_cancels_units_not_yet_started() {
        let world = World::new().await;
        for _ in 0..3 {
            let linked = world.linked_account("hris-app", "active").await;
            world.connect(linked, Provider::Deel).await;
        }
        world.serve(Provider::Deel, EntityType::Group, vec![vec![json!({"id": "g-1", "name": "Ops"})]]);
        world.shutdown_on_fetch(Provider::Deel, EntityType::Group);
        let orchestrator = world
            .orchestrator_with(EntityType::Group, OrchestratorConfig {
                max_concurrent_units: 1,
                ..Default::default()
            })
            .await;

        let report = orchestrator.kickstart_sync(None).await;

        // Units run one at a time in discovery order: gusto (no connection), then
        // the deel unit that triggers shutdown, then nothing else starts.
        assert_eq!(report.units.len(), 3 * Provider::COUNT);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.cancelled(), 3 * Provider::COUNT - 2);
        assert_eq!(world.store.records(EntityType::Group).await.len(), 1);
    }

    #[tokio::test]
    async fn tenant_scope_limits_discovery() {
        let world = World::new().await;
        let linked = world.linked_account("hris-app", "active").await;
        world.connect(linked, Provider::Deel).await;
        world.serve(Provider::Deel, EntityType::Group, vec![vec![json!({"id": "g-1"})]]);
        let orchestrator = world.orchestrator(EntityType::Group).await;

        let other_tenant = orchestrator.kickstart_sync(Some(Uuid::new_v4())).await;
        assert!(other_tenant.units.is_empty());

        let own = orchestrator.kickstart_sync(Some(world.tenant_id)).await;
        assert_eq!(own.records_persisted(), 1);
        assert!(own.units.iter().all(|u| u.tenant_id == Some(world.tenant_id)));
    }

    #[tokio::test]
    async fn multi_page_sequences_persist_every_page() {
        let world = World::new().await;
        let linked = world.linked_account("hris-app", "active").await;
        world.connect(linked, Provider::Deel).await;
        world.serve(Provider::Deel, EntityType::Group, vec![
            vec![json!({"id": "g-1"}), json!({"id": "g-2"})],
            vec![json!({"id": "g-3"})],
        ]);
        let orchestrator = world.orchestrator(EntityType::Group).await;

        let outcome = orchestrator.sync_for_linked_user("deel", linked).await;

        assert_eq!(outcome.pages, 2);
        assert_eq!(outcome.records_persisted, 3);
        let counts: Vec<_> = world.notifier.events().await.iter().map(|e| e.record_count).collect();
        assert_eq!(counts, vec![2, 1]);
    }
}
