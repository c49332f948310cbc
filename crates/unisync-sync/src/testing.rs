//! Shared fixtures for the sync tests: a seeded in-memory world and scripted adapters.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use unisync_adapters::providers::supported;
use unisync_adapters::{
    FetchFailure, FetchedPage, PageCursor, ProviderAdapter, ProviderFetchError, RawPage,
    ServiceRegistry,
};
use unisync_core::{
    Clock, Connection, ConnectionContext, CustomFieldMapping, CustomFieldValue, EntityType, Group,
    LinkedAccount, Project, Provider, Secret, Tenant, UnifiedBody, UnifiedRecord,
};
use unisync_storage::MemoryStore;
use uuid::Uuid;

use crate::ingest::{CustomFieldPolicy, IngestService};
use crate::notifier::MemoryNotifier;
use crate::orchestrator::{OrchestratorConfig, SyncOrchestrator};

/// Advances one second on every read, so successive writes get distinct timestamps.
struct TickingClock(Mutex<DateTime<Utc>>);

impl Clock for TickingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut now = self.0.lock().unwrap();
        *now += chrono::Duration::seconds(1);
        *now
    }
}

pub(crate) fn ticking_clock() -> Arc<dyn Clock> {
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    Arc::new(TickingClock(Mutex::new(start)))
}

pub(crate) fn group(remote_id: &str, name: &str) -> UnifiedRecord {
    UnifiedRecord::new(
        remote_id,
        UnifiedBody::Group(Group {
            name: Some(name.to_string()),
            ..Default::default()
        }),
    )
}

pub(crate) fn mapping_for(linked_user_id: Uuid, entity_type: EntityType, slug: &str) -> CustomFieldMapping {
    CustomFieldMapping {
        id: Uuid::new_v4(),
        slug: slug.to_string(),
        remote_id: slug.to_string(),
        entity_type,
        id_linked_user: linked_user_id,
        provider_slug: Provider::Deel.as_str().to_string(),
        required: false,
    }
}

pub(crate) fn custom_value(mapping: &CustomFieldMapping, value: JsonValue) -> CustomFieldValue {
    CustomFieldValue {
        id_mapping: mapping.id,
        slug: mapping.slug.clone(),
        remote_id: mapping.remote_id.clone(),
        value,
    }
}

#[derive(Clone)]
enum Feed {
    Pages(Vec<Vec<JsonValue>>),
    Fail,
    Delay(Duration),
}

#[derive(Default)]
struct Feeds {
    feeds: Mutex<HashMap<(Provider, EntityType), Feed>>,
    trips: Mutex<HashSet<(Provider, EntityType)>>,
}

/// Serves whatever the test scripted for its (provider, entity type). Pages are
/// addressed with [`PageCursor::Page`] starting at zero.
struct ScriptedAdapter {
    provider: Provider,
    entity_type: EntityType,
    feeds: Arc<Feeds>,
    shutdown: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    async fn fetch_page(
        &self,
        _ctx: &ConnectionContext,
        cursor: Option<&PageCursor>,
    ) -> Result<FetchedPage, ProviderFetchError> {
        let key = (self.provider, self.entity_type);
        if self.feeds.trips.lock().unwrap().contains(&key) {
            self.shutdown.send_replace(true);
        }
        let feed = self.feeds.feeds.lock().unwrap().get(&key).cloned();
        match feed {
            None => Ok(FetchedPage::default()),
            Some(Feed::Fail) => Err(ProviderFetchError::new(
                self.provider,
                self.entity_type,
                FetchFailure::Decode("scripted failure".to_string()),
            )),
            Some(Feed::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(FetchedPage::default())
            }
            Some(Feed::Pages(pages)) => {
                let index = match cursor {
                    Some(PageCursor::Page(n)) => *n as usize,
                    _ => 0,
                };
                let items = pages.get(index).cloned().unwrap_or_default();
                let next = (index + 1 < pages.len()).then(|| PageCursor::Page(index as u32 + 1));
                Ok(FetchedPage {
                    page: RawPage::decode_all(self.provider, self.entity_type, items),
                    next,
                })
            }
        }
    }
}

/// One tenant with one project, backed by a [`MemoryStore`]. Every supported
/// (provider, entity type) is registered with its real mapper and a scripted adapter.
pub(crate) struct World {
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<MemoryNotifier>,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    feeds: Arc<Feeds>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl World {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let tenant_id = Uuid::new_v4();
        let project_id = Uuid::new_v4();
        store
            .add_tenant(Tenant {
                id: tenant_id,
                name: "Acme".to_string(),
            })
            .await;
        store
            .add_project(Project {
                id: project_id,
                id_tenant: tenant_id,
                name: "hris".to_string(),
            })
            .await;
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            notifier: Arc::new(MemoryNotifier::new()),
            tenant_id,
            project_id,
            feeds: Arc::new(Feeds::default()),
            shutdown: Arc::new(shutdown),
        }
    }

    pub async fn linked_account(&self, origin_source: &str, status: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.store
            .add_linked_account(LinkedAccount {
                id,
                id_project: self.project_id,
                status: status.to_string(),
                origin_source: origin_source.to_string(),
                remote_id: format!("acct-{id}"),
            })
            .await;
        id
    }

    pub async fn connect(&self, linked_user_id: Uuid, provider: Provider) -> Uuid {
        self.connect_as(linked_user_id, provider.as_str()).await
    }

    /// Connection stored under a raw slug, which may be a provider alias.
    pub async fn connect_as(&self, linked_user_id: Uuid, provider_slug: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.store
            .add_connection(Connection {
                id,
                id_linked_user: linked_user_id,
                provider_slug: provider_slug.to_string(),
                status: "valid".to_string(),
                base_url: None,
                account_id: Some("company-1".to_string()),
                access_token: Some(Secret::new("token")),
            })
            .await;
        id
    }

    pub async fn map_field(
        &self,
        linked_user_id: Uuid,
        entity_type: EntityType,
        provider: Provider,
        slug: &str,
        remote_id: &str,
    ) -> Uuid {
        self.add_mapping(linked_user_id, entity_type, provider.as_str(), slug, remote_id, false)
            .await
    }

    /// A mapping whose field must be present on every record.
    pub async fn map_required_field(
        &self,
        linked_user_id: Uuid,
        entity_type: EntityType,
        provider: Provider,
        slug: &str,
        remote_id: &str,
    ) -> Uuid {
        self.add_mapping(linked_user_id, entity_type, provider.as_str(), slug, remote_id, true)
            .await
    }

    pub async fn add_mapping(
        &self,
        linked_user_id: Uuid,
        entity_type: EntityType,
        provider_slug: &str,
        slug: &str,
        remote_id: &str,
        required: bool,
    ) -> Uuid {
        let mapping = CustomFieldMapping {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            remote_id: remote_id.to_string(),
            entity_type,
            id_linked_user: linked_user_id,
            provider_slug: provider_slug.to_string(),
            required,
        };
        let id = mapping.id;
        self.store.put_mapping(mapping).await;
        id
    }

    fn script(&self, provider: Provider, entity_type: EntityType, feed: Feed) {
        self.feeds.feeds.lock().unwrap().insert((provider, entity_type), feed);
    }

    pub fn serve(&self, provider: Provider, entity_type: EntityType, pages: Vec<Vec<JsonValue>>) {
        self.script(provider, entity_type, Feed::Pages(pages));
    }

    pub fn fail_fetch(&self, provider: Provider, entity_type: EntityType) {
        self.script(provider, entity_type, Feed::Fail);
    }

    pub fn delay_fetch(&self, provider: Provider, entity_type: EntityType, delay: Duration) {
        self.script(provider, entity_type, Feed::Delay(delay));
    }

    /// Requests shutdown as soon as this pair is fetched.
    pub fn shutdown_on_fetch(&self, provider: Provider, entity_type: EntityType) {
        self.feeds.trips.lock().unwrap().insert((provider, entity_type));
    }

    pub fn shutdown(&self) -> Arc<watch::Sender<bool>> {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> ServiceRegistry {
        let mut builder = ServiceRegistry::builder();
        for provider in Provider::ALL {
            for integration in supported(provider) {
                let adapter = Arc::new(ScriptedAdapter {
                    provider,
                    entity_type: integration.entity_type,
                    feeds: self.feeds.clone(),
                    shutdown: self.shutdown.clone(),
                });
                builder
                    .register(
                        integration.entity_type.category(),
                        integration.entity_type,
                        adapter,
                        integration.mapper,
                    )
                    .unwrap();
            }
        }
        builder.build()
    }

    pub async fn orchestrator(&self, entity_type: EntityType) -> SyncOrchestrator {
        self.orchestrator_with(entity_type, OrchestratorConfig::default()).await
    }

    pub async fn orchestrator_with(
        &self,
        entity_type: EntityType,
        config: OrchestratorConfig,
    ) -> SyncOrchestrator {
        let clock = ticking_clock();
        let ingest = IngestService::new(self.store.clone(), clock.clone(), CustomFieldPolicy::Prune);
        SyncOrchestrator::new(
            entity_type,
            Arc::new(self.registry()),
            self.store.clone(),
            Arc::new(ingest),
            self.notifier.clone(),
            clock,
            config,
            self.shutdown.subscribe(),
        )
    }
}
