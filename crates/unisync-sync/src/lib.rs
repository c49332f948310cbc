//! Sync engine: orchestration per entity type, ingestion, scheduling and events.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::info;
use unisync_adapters::{register_all, MappingError, ProviderFetchError, ServiceRegistry};
use unisync_core::{Clock, EntityType, SystemClock};
use unisync_storage::{AccountDirectory, HttpClientConfig, HttpFetcher, PersistenceError, RecordStore, Store};
use uuid::Uuid;

pub mod config;
pub mod ingest;
pub mod notifier;
pub mod orchestrator;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use config::{ProviderConfig, SyncConfig, SyncSettings, DEFAULT_CRON};
pub use ingest::{CustomFieldPolicy, IngestFailure, IngestReport, IngestService};
pub use notifier::{EventNotifier, MemoryNotifier, NotifyError, TracingNotifier, WebhookNotifier};
pub use orchestrator::{
    OrchestratorConfig, RunReport, SkipReason, SyncOrchestrator, UnitOutcome, UnitStatus,
};
pub use scheduler::{QueueClosed, QueuedJob, SyncJob, SyncQueue, SyncScheduler, WorkerPool};

/// Why a sync unit, or one record inside it, did not make it to storage.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error(transparent)]
    Fetch(#[from] ProviderFetchError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Everything a process needs to run syncs: the registry, one orchestrator per
/// entity type and the shutdown signal they all watch.
pub struct SyncEngine {
    config: SyncConfig,
    schedules: BTreeMap<EntityType, String>,
    registry: Arc<ServiceRegistry>,
    orchestrators: Arc<BTreeMap<EntityType, SyncOrchestrator>>,
    shutdown: watch::Sender<bool>,
}

impl SyncEngine {
    /// Registers the REST integrations of every enabled provider on top of `store`.
    pub fn build<S: Store + 'static>(config: SyncConfig, settings: &SyncSettings, store: Arc<S>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            rate_limits: settings.rate_limits(),
            ..Default::default()
        })
        .context("building provider http client")?;

        let mut builder = ServiceRegistry::builder();
        let added = register_all(&mut builder, Arc::new(http), &settings.provider_settings())
            .context("registering provider integrations")?;
        info!(integrations = added, "provider integrations registered");

        let notifier: Arc<dyn EventNotifier> = match &config.webhook_url {
            Some(url) => Arc::new(
                WebhookNotifier::new(url.clone(), config.http_timeout()).context("building event notifier")?,
            ),
            None => Arc::new(TracingNotifier),
        };
        Ok(Self::assemble(
            config,
            settings,
            builder.build(),
            store,
            notifier,
            Arc::new(SystemClock),
        ))
    }

    pub fn assemble<S: Store + 'static>(
        config: SyncConfig,
        settings: &SyncSettings,
        registry: ServiceRegistry,
        store: Arc<S>,
        notifier: Arc<dyn EventNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(registry);
        let directory: Arc<dyn AccountDirectory> = store.clone();
        let records: Arc<dyn RecordStore> = store;
        let ingest = Arc::new(IngestService::new(records, clock.clone(), config.custom_field_policy));
        let orchestrator_config = OrchestratorConfig {
            max_concurrent_units: config.max_concurrent_units,
            fetch_timeouts: settings.fetch_timeouts(),
            ..Default::default()
        };

        let orchestrators = EntityType::ALL
            .into_iter()
            .map(|entity_type| {
                let orchestrator = SyncOrchestrator::new(
                    entity_type,
                    registry.clone(),
                    directory.clone(),
                    ingest.clone(),
                    notifier.clone(),
                    clock.clone(),
                    orchestrator_config.clone(),
                    shutdown_rx.clone(),
                );
                (entity_type, orchestrator)
            })
            .collect();

        Self {
            schedules: config.schedules(settings),
            config,
            registry,
            orchestrators: Arc::new(orchestrators),
            shutdown,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn schedules(&self) -> &BTreeMap<EntityType, String> {
        &self.schedules
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self, entity_type: EntityType) -> Option<&SyncOrchestrator> {
        self.orchestrators.get(&entity_type)
    }

    /// Runs full syncs right away, one entity type after another.
    pub async fn run_once(&self, entity_type: Option<EntityType>, tenant_id: Option<Uuid>) -> Vec<RunReport> {
        let mut reports = Vec::new();
        for (entity, orchestrator) in self.orchestrators.iter() {
            if entity_type.is_some_and(|wanted| wanted != *entity) {
                continue;
            }
            reports.push(orchestrator.kickstart_sync(tenant_id).await);
        }
        reports
    }

    pub fn spawn_workers(&self, receiver: mpsc::Receiver<crate::QueuedJob>) -> WorkerPool {
        WorkerPool::spawn(
            receiver,
            self.orchestrators.clone(),
            self.config.workers,
            self.shutdown.subscribe(),
        )
    }

    /// `None` unless `UNISYNC_SCHEDULER_ENABLED` is set.
    pub async fn maybe_build_scheduler(&self, queue: SyncQueue) -> Result<Option<SyncScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        SyncScheduler::build(queue, &self.schedules).await.map(Some)
    }

    /// Units that have not started yet are cancelled; running ones finish.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
