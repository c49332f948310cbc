//! Delivery of `entity.synced` events to webhooks or logs.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use unisync_core::SyncedEvent;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook answered with status {status}")]
    Status { status: u16 },
}

/// Delivers `entity.synced` events downstream. Failures never fail a sync unit.
#[async_trait]
pub trait EventNotifier: Send + Sync {
    async fn notify(&self, event: &SyncedEvent) -> Result<(), NotifyError>;
}

/// POSTs each event as JSON to a dispatcher URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EventNotifier for WebhookNotifier {
    async fn notify(&self, event: &SyncedEvent) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(event).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                status: status.as_u16(),
            });
        }
        tracing::debug!(
            entity_type = %event.entity_type,
            connection_id = %event.connection_id,
            record_count = event.record_count,
            "delivered sync event"
        );
        Ok(())
    }
}

/// Logs events only, for deployments without a dispatcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl EventNotifier for TracingNotifier {
    async fn notify(&self, event: &SyncedEvent) -> Result<(), NotifyError> {
        tracing::info!(
            event_type = %event.event_type,
            entity_type = %event.entity_type,
            connection_id = %event.connection_id,
            record_count = event.record_count,
            "records synced"
        );
        Ok(())
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<SyncedEvent>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<SyncedEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventNotifier for MemoryNotifier {
    async fn notify(&self, event: &SyncedEvent) -> Result<(), NotifyError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
