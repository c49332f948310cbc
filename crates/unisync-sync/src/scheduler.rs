//! Cron triggers, the job queue between triggers and workers, and the worker pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn, Instrument};
use unisync_core::EntityType;
use uuid::Uuid;

use crate::orchestrator::SyncOrchestrator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncJob {
    /// Full run over every tenant, or one tenant.
    EntityRun {
        entity_type: EntityType,
        #[serde(default)]
        tenant_id: Option<Uuid>,
    },
    /// One linked account; every registered provider when `provider` is unset.
    LinkedUserRun {
        entity_type: EntityType,
        linked_user_id: Uuid,
        #[serde(default)]
        provider: Option<String>,
    },
}

impl SyncJob {
    pub fn entity_type(&self) -> EntityType {
        match self {
            SyncJob::EntityRun { entity_type, .. } | SyncJob::LinkedUserRun { entity_type, .. } => {
                *entity_type
            }
        }
    }

    pub fn name(&self) -> &'static str {
        self.entity_type().job_name()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedJob {
    pub id: Uuid,
    pub job: SyncJob,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
#[error("sync queue is closed")]
pub struct QueueClosed;

/// Producer side of the job queue. Cron triggers and the HTTP surface share clones.
#[derive(Debug, Clone)]
pub struct SyncQueue {
    tx: mpsc::Sender<QueuedJob>,
}

impl SyncQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<QueuedJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Waits for room when the queue is full.
    pub async fn enqueue(&self, job: SyncJob) -> Result<QueuedJob, QueueClosed> {
        let queued = QueuedJob {
            id: Uuid::new_v4(),
            job,
            enqueued_at: Utc::now(),
        };
        self.tx.send(queued.clone()).await.map_err(|_| QueueClosed)?;
        Ok(queued)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn fire(queue: &SyncQueue, entity_type: EntityType) -> Option<Uuid> {
    let job = SyncJob::EntityRun {
        entity_type,
        tenant_id: None,
    };
    match queue.enqueue(job).await {
        Ok(queued) => {
            info!(job = entity_type.job_name(), job_id = %queued.id, "enqueued scheduled sync");
            Some(queued.id)
        }
        Err(err) => {
            warn!(job = entity_type.job_name(), error = %err, "dropping scheduled sync");
            None
        }
    }
}

/// One cron job per entity type, each enqueueing a full run.
pub struct SyncScheduler {
    inner: JobScheduler,
}

impl SyncScheduler {
    pub async fn build(queue: SyncQueue, schedules: &BTreeMap<EntityType, String>) -> Result<Self> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for (entity_type, cron) in schedules {
            let entity_type = *entity_type;
            let queue = queue.clone();
            let job = Job::new_async(cron, move |_uuid, _l| {
                let queue = queue.clone();
                Box::pin(async move {
                    fire(&queue, entity_type).await;
                })
            })
            .with_context(|| format!("creating {} job for cron {cron}", entity_type.job_name()))?;
            sched.add(job).await.context("adding scheduler job")?;
            info!(job = entity_type.job_name(), cron = %cron, "registered sync schedule");
        }
        Ok(Self { inner: sched })
    }

    pub async fn start(&self) -> Result<()> {
        self.inner.start().await.context("starting scheduler")
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.inner.shutdown().await.context("stopping scheduler")
    }
}

/// Pulls jobs off the queue and runs at most `workers` of them at once.
pub struct WorkerPool {
    handle: JoinHandle<usize>,
}

impl WorkerPool {
    /// Stops when shutdown is signalled or every queue producer is gone; jobs
    /// already running are drained first.
    pub fn spawn(
        receiver: mpsc::Receiver<QueuedJob>,
        orchestrators: Arc<BTreeMap<EntityType, SyncOrchestrator>>,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let handle = tokio::spawn(work(receiver, orchestrators, workers.max(1), shutdown));
        Self { handle }
    }

    /// Number of jobs processed.
    pub async fn join(self) -> usize {
        match self.handle.await {
            Ok(processed) => processed,
            Err(err) => {
                tracing::error!(error = %err, "worker pool task failed");
                0
            }
        }
    }
}

async fn work(
    mut receiver: mpsc::Receiver<QueuedJob>,
    orchestrators: Arc<BTreeMap<EntityType, SyncOrchestrator>>,
    workers: usize,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let mut running = JoinSet::new();
    let mut processed = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let has_room = running.len() < workers;
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            job = receiver.recv(), if has_room => match job {
                Some(job) => {
                    let span = tracing::info_span!("sync_job", job = job.job.name(), job_id = %job.id);
                    running.spawn(execute(orchestrators.clone(), job).instrument(span));
                }
                None => break,
            },
            Some(done) = running.join_next(), if !running.is_empty() => {
                if let Err(err) = done {
                    tracing::error!(error = %err, "sync job panicked");
                }
                processed += 1;
            }
        }
    }

    while let Some(done) = running.join_next().await {
        if let Err(err) = done {
            tracing::error!(error = %err, "sync job panicked");
        }
        processed += 1;
    }
    info!(processed, "sync workers stopped");
    processed
}

async fn execute(orchestrators: Arc<BTreeMap<EntityType, SyncOrchestrator>>, queued: QueuedJob) {
    let entity_type = queued.job.entity_type();
    let Some(orchestrator) = orchestrators.get(&entity_type) else {
        warn!(entity_type = %entity_type, "no orchestrator for entity type, dropping job");
        return;
    };

    match queued.job {
        SyncJob::EntityRun { tenant_id, .. } => {
            let report = orchestrator.kickstart_sync(tenant_id).await;
            info!(
                units = report.units.len(),
                failed = report.failed(),
                records_persisted = report.records_persisted(),
                "sync job finished"
            );
        }
        SyncJob::LinkedUserRun {
            linked_user_id,
            provider,
            ..
        } => {
            let providers = match provider {
                Some(provider) => vec![provider],
                None => orchestrator
                    .registry()
                    .providers_for(entity_type)
                    .into_iter()
                    .map(|p| p.as_str().to_string())
                    .collect(),
            };
            for provider in providers {
                let outcome = orchestrator.sync_for_linked_user(&provider, linked_user_id).await;
                info!(%outcome, "linked user sync finished");
            }
        }
    }
}
