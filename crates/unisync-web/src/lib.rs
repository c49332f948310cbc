//! HTTP trigger surface: queues sync jobs and answers health checks.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use unisync_core::EntityType;
use unisync_sync::{QueuedJob, SyncJob, SyncQueue};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub queue: SyncQueue,
}

impl AppState {
    pub fn new(queue: SyncQueue) -> Self {
        Self { queue }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StartSyncBody {
    #[serde(default)]
    tenant_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LinkedUserSyncBody {
    #[serde(default)]
    provider: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AcceptedJob {
    job_id: Uuid,
    job: SyncJob,
}

impl From<QueuedJob> for AcceptedJob {
    fn from(queued: QueuedJob) -> Self {
        Self {
            job_id: queued.id,
            job: queued.job,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sync/{entity_type}/start", post(start_sync_handler))
        .route("/linked-users/{linked_user_id}/sync", post(linked_user_sync_handler))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` resolves.
pub async fn serve(
    port: u16,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    tracing::info!(port, "trigger api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving trigger api")?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn start_sync_handler(
    State(state): State<Arc<AppState>>,
    Path(entity_type): Path<String>,
    body: Bytes,
) -> Response {
    let Ok(entity_type) = entity_type.parse::<EntityType>() else {
        return error(StatusCode::NOT_FOUND, format!("unknown entity type `{entity_type}`"));
    };
    let body: StartSyncBody = match parse_body(&body) {
        Ok(body) => body,
        Err(response) => return response,
    };

    let job = SyncJob::EntityRun {
        entity_type,
        tenant_id: body.tenant_id,
    };
    match state.queue.enqueue(job).await {
        Ok(queued) => {
            tracing::info!(job = queued.job.name(), job_id = %queued.id, tenant_id = ?body.tenant_id, "sync requested");
            let accepted = AcceptedJob::from(queued);
            (
                StatusCode::ACCEPTED,
                Json(json!({ "status": "accepted", "jobId": accepted.job_id, "job": accepted.job })),
            )
                .into_response()
        }
        Err(err) => error(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
    }
}

async fn linked_user_sync_handler(
    State(state): State<Arc<AppState>>,
    Path(linked_user_id): Path<String>,
    body: Bytes,
) -> Response {
    let Ok(linked_user_id) = linked_user_id.parse::<Uuid>() else {
        return error(StatusCode::BAD_REQUEST, format!("invalid linked user id `{linked_user_id}`"));
    };
    let body: LinkedUserSyncBody = match parse_body(&body) {
        Ok(body) => body,
        Err(response) => return response,
    };

    let mut jobs = Vec::with_capacity(EntityType::COUNT);
    for entity_type in EntityType::ALL {
        let job = SyncJob::LinkedUserRun {
            entity_type,
            linked_user_id,
            provider: body.provider.clone(),
        };
        match state.queue.enqueue(job).await {
            Ok(queued) => jobs.push(AcceptedJob::from(queued)),
            Err(err) => return error(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        }
    }
    tracing::info!(linked_user_id = %linked_user_id, provider = ?body.provider, jobs = jobs.len(), "linked user sync requested");
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "jobs": jobs })),
    )
        .into_response()
}

/// An empty body means "no options".
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| error(StatusCode::BAD_REQUEST, format!("invalid request body: {err}")))
}

fn error(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn test_app() -> (Router, mpsc::Receiver<QueuedJob>) {
        let (queue, rx) = SyncQueue::bounded(16);
        (app(AppState::new(queue)), rx)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> JsonValue {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_says_ok() {
        let (app, _rx) = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn start_sync_queues_an_entity_run() {
        let (app, mut rx) = test_app();
        let tenant = Uuid::new_v4();
        let resp = app
            .oneshot(post_json("/sync/location/start", &format!(r#"{{"tenantId":"{tenant}"}}"#)))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["job"]["kind"], "entity_run");

        let queued = rx.recv().await.unwrap();
        assert_eq!(body["jobId"], queued.id.to_string());
        assert_eq!(
            queued.job,
            SyncJob::EntityRun {
                entity_type: EntityType::Location,
                tenant_id: Some(tenant)
            }
        );
    }

    #[tokio::test]
    async fn start_sync_accepts_empty_body_and_hyphenated_names() {
        let (app, mut rx) = test_app();
        let resp = app
            .oneshot(post_json("/sync/time-off-balance/start", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(rx.recv().await.unwrap().job.entity_type(), EntityType::TimeOffBalance);
    }

    #[tokio::test]
    async fn unknown_entity_is_not_found_and_bad_body_is_rejected() {
        let (app, mut rx) = test_app();
        let missing = app
            .clone()
            .oneshot(post_json("/sync/payroll/start", "{}"))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let malformed = app
            .oneshot(post_json("/sync/group/start", r#"{"tenantId": 12"#))
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(malformed).await["error"].as_str().unwrap().contains("invalid request body"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_queue_is_unavailable() {
        let (app, rx) = test_app();
        drop(rx);
        let resp = app.oneshot(post_json("/sync/group/start", "{}")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn linked_user_sync_queues_one_job_per_entity_type() {
        let (app, mut rx) = test_app();
        let linked = Uuid::new_v4();
        let resp = app
            .oneshot(post_json(&format!("/linked-users/{linked}/sync"), r#"{"provider":"deel"}"#))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(resp).await["jobs"].as_array().unwrap().len(), EntityType::COUNT);
        let mut entities = Vec::new();
        while let Ok(queued) = rx.try_recv() {
            let SyncJob::LinkedUserRun {
                entity_type,
                linked_user_id,
                provider,
            } = queued.job
            else {
                panic!("expected a linked user run");
            };
            assert_eq!(linked_user_id, linked);
            assert_eq!(provider.as_deref(), Some("deel"));
            entities.push(entity_type);
        }
        assert_eq!(entities, EntityType::ALL.to_vec());
    }

    #[tokio::test]
    async fn linked_user_sync_rejects_bad_ids() {
        let (app, _rx) = test_app();
        let resp = app
            .oneshot(post_json("/linked-users/not-a-uuid/sync", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
