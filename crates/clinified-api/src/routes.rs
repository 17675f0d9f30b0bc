use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use clinified_core::transport::{BatchResponse, PullResponse};
use clinified_core::util::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::store::SyncStore;

const DEFAULT_PULL_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    store: SyncStore,
}

impl AppState {
    pub fn from_config(config: Arc<AppConfig>) -> Self {
        Self {
            config,
            store: SyncStore::new(),
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let sync_routes = Router::new()
        .route("/sync/batch", post(apply_batch))
        .route("/sync/changes", get(list_changes))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", sync_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: now_ms(),
    })
}

async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(expected) = state.config.api_token.as_deref() {
        let token = extract_bearer_token(request.headers())?;
        if token != expected {
            return Err(AppError::unauthorized("Invalid bearer token"));
        }
    }
    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }
    Ok(token)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchEnvelope {
    tenant_id: String,
    device_id: String,
    /// Decoded one by one so a bad entry does not fail the batch
    entries: Vec<Value>,
}

async fn apply_batch(
    State(state): State<AppState>,
    Json(batch): Json<BatchEnvelope>,
) -> Result<Json<BatchResponse>, AppError> {
    let tenant_id = required_tenant(&batch.tenant_id)?;
    if batch.entries.len() > state.config.max_batch {
        return Err(AppError::PayloadTooLarge(format!(
            "{} entries exceed the limit of {}",
            batch.entries.len(),
            state.config.max_batch
        )));
    }

    let received = batch.entries.len();
    let results = state.store.apply_batch(tenant_id, batch.entries).await;
    tracing::info!(
        endpoint = "sync_batch",
        tenant = tenant_id,
        device = batch.device_id.as_str(),
        received,
        answered = results.len(),
        "Applied sync batch"
    );
    Ok(Json(BatchResponse { results }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangesQuery {
    tenant_id: String,
    #[serde(default)]
    since: i64,
    limit: Option<usize>,
}

async fn list_changes(
    State(state): State<AppState>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<PullResponse>, AppError> {
    let tenant_id = required_tenant(&query.tenant_id)?;
    if query.since < 0 {
        return Err(AppError::bad_request("since must not be negative"));
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PULL_LIMIT)
        .clamp(1, state.config.max_batch);

    let page = state.store.changes_since(tenant_id, query.since, limit).await;
    tracing::debug!(
        endpoint = "sync_changes",
        tenant = tenant_id,
        since = query.since,
        returned = page.records.len(),
        "Served remote changes"
    );
    Ok(Json(page))
}

fn required_tenant(tenant_id: &str) -> Result<&str, AppError> {
    let tenant_id = tenant_id.trim();
    if tenant_id.is_empty() {
        return Err(AppError::bad_request("tenantId must not be empty"));
    }
    Ok(tenant_id)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clinified_core::connectivity::Connectivity;
    use clinified_core::transport::{
        BatchRequest, HttpTransport, PullRequest, Transport, TransportError, WireChange,
        WireOutcome,
    };
    use clinified_core::{
        ChangeId, ChangeOp, DatabaseService, Payload, RecordId, SyncConfig, SyncOrchestrator,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::config::DEFAULT_MAX_BATCH;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn config(api_token: Option<&str>, max_batch: usize) -> AppConfig {
        AppConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            api_token: api_token.map(str::to_string),
            max_batch,
        }
    }

    async fn spawn_app(config: AppConfig) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app_router(AppState::from_config(Arc::new(config)));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn transport(endpoint: &str, token: Option<&str>) -> HttpTransport {
        HttpTransport::new(endpoint, token.map(str::to_string), Duration::from_secs(5)).unwrap()
    }

    fn create_entry(record_id: RecordId) -> WireChange {
        WireChange {
            change_id: ChangeId::new(),
            record_id,
            kind: "patient".to_string(),
            op: ChangeOp::Create,
            payload: payload(json!({"name": "Asha"})),
            local_revision: 1,
            base_revision: None,
            modified_at: 1_700_000_000_000,
            supersedes: Vec::new(),
        }
    }

    fn batch(entries: Vec<WireChange>) -> BatchRequest {
        BatchRequest {
            tenant_id: "clinic".to_string(),
            device_id: "device-a".to_string(),
            entries,
        }
    }

    #[tokio::test]
    async fn healthz_is_public() {
        let endpoint = spawn_app(config(Some("secret"), DEFAULT_MAX_BATCH)).await;
        let body: Value = reqwest::get(format!("{endpoint}/healthz"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn batch_and_pull_round_trip_over_http() {
        let endpoint = spawn_app(config(Some("secret"), DEFAULT_MAX_BATCH)).await;
        let client = transport(&endpoint, Some("secret"));
        let record_id = RecordId::new();

        let response = client
            .send_batch(&batch(vec![create_entry(record_id)]))
            .await
            .unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].outcome, WireOutcome::Ack);
        assert_eq!(response.results[0].server_revision, Some(1));

        let page = client
            .pull_changes(&PullRequest {
                tenant_id: "clinic".to_string(),
                since: 0,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(page.cursor, 1);
        assert_eq!(page.records[0].id, record_id);
        assert_eq!(page.records[0].payload, payload(json!({"name": "Asha"})));
    }

    #[tokio::test]
    async fn wrong_token_is_unauthorized() {
        let endpoint = spawn_app(config(Some("secret"), DEFAULT_MAX_BATCH)).await;
        let error = transport(&endpoint, Some("guess"))
            .send_batch(&batch(vec![create_entry(RecordId::new())]))
            .await
            .unwrap_err();

        assert!(matches!(error, TransportError::Status { status: 401, .. }));
        assert!(!error.is_transient());

        let missing = transport(&endpoint, None)
            .pull_changes(&PullRequest {
                tenant_id: "clinic".to_string(),
                since: 0,
                limit: 10,
            })
            .await
            .unwrap_err();
        assert!(matches!(missing, TransportError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn oversized_batch_is_refused() {
        let endpoint = spawn_app(config(None, 1)).await;
        let error = transport(&endpoint, None)
            .send_batch(&batch(vec![
                create_entry(RecordId::new()),
                create_entry(RecordId::new()),
            ]))
            .await
            .unwrap_err();

        match error {
            TransportError::Status { status, message } => {
                assert_eq!(status, 413);
                assert!(message.contains("limit of 1"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn device_config(endpoint: &str) -> SyncConfig {
        SyncConfig {
            endpoint: Some(endpoint.to_string()),
            tenant_id: "clinic".to_string(),
            batch_size: 10,
            ..SyncConfig::default()
        }
    }

    fn device(endpoint: &str) -> (DatabaseService, SyncOrchestrator<HttpTransport>) {
        let service = DatabaseService::open_in_memory().unwrap();
        let orchestrator = SyncOrchestrator::new(
            service.clone(),
            transport(endpoint, None),
            device_config(endpoint),
            Connectivity::new(true),
        );
        (service, orchestrator)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn two_devices_converge_on_disjoint_edits() {
        let endpoint = spawn_app(config(None, DEFAULT_MAX_BATCH)).await;
        let (a_db, a_sync) = device(&endpoint);
        let (b_db, b_sync) = device(&endpoint);

        let record = a_db
            .create_record("patient", payload(json!({"name": "Asha", "phone": "111"})))
            .await
            .unwrap();
        assert_eq!(a_sync.run_cycle().await.unwrap().acknowledged, 1);
        assert_eq!(b_sync.run_cycle().await.unwrap().pulled, 1);

        b_db.update_record(&record.id, payload(json!({"name": "Asha", "phone": "222"})))
            .await
            .unwrap();
        assert_eq!(b_sync.run_cycle().await.unwrap().acknowledged, 1);

        a_db.update_record(&record.id, payload(json!({"name": "Asha Rao", "phone": "111"})))
            .await
            .unwrap();
        let summary = a_sync.run_cycle().await.unwrap();
        assert_eq!(summary.conflicted, 1);
        assert_eq!(summary.acknowledged, 1);

        b_sync.run_cycle().await.unwrap();

        let expected = payload(json!({"name": "Asha Rao", "phone": "222"}));
        assert_eq!(a_db.get_record(&record.id).await.unwrap().payload, expected);
        assert_eq!(b_db.get_record(&record.id).await.unwrap().payload, expected);
        assert!(a_sync.run_cycle().await.unwrap().is_empty());
        assert!(b_sync.run_cycle().await.unwrap().is_empty());
    }
}
