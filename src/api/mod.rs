//! HTTP API server for leadflow.

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::engine::{LeadEvent, Scheduler, TriggerDispatcher};
use crate::error::Error;
use crate::storage::{Lead, SqliteStorage};
use crate::workflow::{parse_workflow, validate_workflow};

type ApiError = (StatusCode, Json<Value>);
type ApiResult = std::result::Result<Response, ApiError>;

/// Create a sanitized error response for external consumers.
///
/// Server-side failures are logged in full; clients only see the code,
/// category and a safe message.
fn external_error_response(e: Error) -> ApiError {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("API error: {:?}", e);
    }
    (status, Json(e.to_external_json()))
}

/// Create CORS layer based on environment configuration.
///
/// - LEADFLOW_CORS_ORIGINS: Comma-separated list of allowed origins (default: http://localhost:3000)
/// - LEADFLOW_CORS_ALLOW_ALL: Set to "true" to allow all origins
pub fn create_cors_layer() -> CorsLayer {
    let allow_all = std::env::var("LEADFLOW_CORS_ALLOW_ALL")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_all {
        warn!("CORS configured to allow all origins");
        return CorsLayer::very_permissive();
    }

    let origins_str = std::env::var("LEADFLOW_CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string());

    let mut origins: Vec<HeaderValue> = origins_str
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(hv) => Some(hv),
                Err(e) => {
                    warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect();

    if origins.is_empty() {
        warn!("No valid CORS origins configured, using localhost:3000");
        origins.push(HeaderValue::from_static("http://localhost:3000"));
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Default maximum concurrent requests.
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Create a concurrency limit layer.
///
/// - LEADFLOW_MAX_CONCURRENT_REQUESTS: Maximum concurrent requests (default: 100)
pub fn create_concurrency_limit() -> tower::limit::ConcurrencyLimitLayer {
    let max = std::env::var("LEADFLOW_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS);
    tower::limit::ConcurrencyLimitLayer::new(max)
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub storage: SqliteStorage,
    pub scheduler: Scheduler,
    pub dispatcher: TriggerDispatcher,
}

impl AppState {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            storage: scheduler.storage().clone(),
            dispatcher: TriggerDispatcher::new(scheduler.clone()),
            scheduler,
        }
    }
}

/// Create the API router (without state applied - call with_state on the result).
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/workflows", get(list_workflows).post(create_workflow))
        .route("/api/workflows/{id}", get(get_workflow))
        .route("/api/workflows/{id}/activate", post(activate_workflow))
        .route("/api/workflows/{id}/deactivate", post(deactivate_workflow))
        .route(
            "/api/workflows/{id}/executions",
            get(list_executions).post(trigger_execution),
        )
        .route("/api/workflows/{id}/executions/{lead_id}", get(get_execution))
        .route(
            "/api/workflows/{id}/executions/{lead_id}/cancel",
            post(cancel_execution),
        )
        .route("/api/workflows/{id}/executions/{lead_id}/runs", get(list_runs))
        .route("/api/events", post(emit_event))
        .route("/api/leads/{id}", put(upsert_lead))
        .route("/metrics", get(metrics_handler))
}

/// Create the complete API router with state.
pub fn create_router(state: AppState) -> Router {
    create_api_routes()
        .layer(create_concurrency_limit())
        .layer(TraceLayer::new_for_http())
        .layer(create_cors_layer())
        .with_state(state)
}

// ============================================================================
// Health & Metrics
// ============================================================================

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let pending = state.storage.count_pending_wakeups().await;
    match (state.storage.check_health().await, pending) {
        (Ok(()), Ok(pending_wakeups)) => Json(json!({
            "status": "ok",
            "pendingWakeups": pending_wakeups,
        }))
        .into_response(),
        (Err(e), _) | (_, Err(e)) => {
            error!("Health check failed: {:?}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "message": "Health check failed"})),
            )
                .into_response()
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render_metrics(),
    )
}

// ============================================================================
// Workflow Endpoints
// ============================================================================

async fn list_workflows(State(state): State<AppState>) -> ApiResult {
    let workflows = state
        .storage
        .list_workflows()
        .await
        .map_err(external_error_response)?;
    Ok(Json(json!({ "workflows": workflows })).into_response())
}

/// Accepts a YAML or JSON definition, rejecting it with every violation found.
async fn create_workflow(State(state): State<AppState>, body: String) -> ApiResult {
    let definition = parse_workflow(&body).map_err(external_error_response)?;
    validate_workflow(&definition)
        .map_err(|e| external_error_response(Error::GraphValidation(e)))?;

    let stored = state
        .storage
        .save_workflow(&definition)
        .await
        .map_err(external_error_response)?;
    info!(
        workflow_id = %stored.id(),
        version = stored.version(),
        "Workflow saved"
    );
    Ok((StatusCode::CREATED, Json(stored)).into_response())
}

async fn get_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.storage.get_workflow(&id).await {
        Ok(Some(stored)) => Ok(Json(stored).into_response()),
        Ok(None) => Err(external_error_response(Error::NotFound(format!(
            "workflow '{}'",
            id
        )))),
        Err(e) => Err(external_error_response(e)),
    }
}

async fn activate_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    set_active(&state, &id, true).await
}

async fn deactivate_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    set_active(&state, &id, false).await
}

async fn set_active(state: &AppState, id: &str, active: bool) -> ApiResult {
    let stored = state
        .storage
        .set_workflow_active(id, active)
        .await
        .map_err(external_error_response)?;
    Ok(Json(stored).into_response())
}

// ============================================================================
// Execution Endpoints
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest {
    lead_id: String,
    #[serde(default)]
    input: Map<String, Value>,
}

async fn list_executions(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let executions = state
        .storage
        .list_executions(&id)
        .await
        .map_err(external_error_response)?;
    Ok(Json(json!({ "executions": executions })).into_response())
}

async fn trigger_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult {
    let execution = state
        .dispatcher
        .trigger_manual(&id, &request.lead_id, request.input)
        .await
        .map_err(external_error_response)?;
    Ok((StatusCode::CREATED, Json(execution)).into_response())
}

async fn get_execution(
    State(state): State<AppState>,
    Path((id, lead_id)): Path<(String, String)>,
) -> ApiResult {
    match state.storage.get_execution(&id, &lead_id).await {
        Ok(Some(execution)) => Ok(Json(execution).into_response()),
        Ok(None) => Err(external_error_response(Error::NotFound(format!(
            "execution for workflow '{}' and lead '{}'",
            id, lead_id
        )))),
        Err(e) => Err(external_error_response(e)),
    }
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path((id, lead_id)): Path<(String, String)>,
) -> ApiResult {
    let execution = state
        .scheduler
        .cancel(&id, &lead_id)
        .await
        .map_err(external_error_response)?;
    Ok(Json(execution).into_response())
}

async fn list_runs(
    State(state): State<AppState>,
    Path((id, lead_id)): Path<(String, String)>,
) -> ApiResult {
    let runs = state
        .storage
        .list_runs(&id, &lead_id)
        .await
        .map_err(external_error_response)?;
    Ok(Json(json!({ "runs": runs })).into_response())
}

// ============================================================================
// Events & Leads
// ============================================================================

async fn emit_event(State(state): State<AppState>, Json(event): Json<LeadEvent>) -> ApiResult {
    let started = state
        .dispatcher
        .dispatch(&event)
        .await
        .map_err(external_error_response)?;
    Ok(Json(json!({ "started": started })).into_response())
}

#[derive(Deserialize)]
struct LeadRequest {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    attributes: Map<String, Value>,
}

async fn upsert_lead(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<LeadRequest>,
) -> ApiResult {
    let lead = Lead {
        id,
        email: request.email,
        name: request.name,
        attributes: request.attributes,
    };
    state
        .storage
        .upsert_lead(&lead)
        .await
        .map_err(external_error_response)?;
    Ok(Json(lead).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::email::testing::RecordingEmailSender;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    const WORKFLOW: &str = r#"
id: welcome
name: Welcome
nodes:
  - { id: T, type: TRIGGER, data: { event: lead.created } }
  - { id: D, type: DELAY, data: { delayValue: 1, delayType: days } }
  - { id: E, type: ACTION_EMAIL, data: { subject: "Hi {{name}}", body: b } }
edges:
  - { id: e1, source: T, target: D }
  - { id: e2, source: D, target: E }
"#;

    fn app() -> Router {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let scheduler = Scheduler::new(storage, Arc::new(RecordingEmailSender::new()));
        create_router(AppState::new(scheduler))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<String>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, body) = send(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["pendingWakeups"], 0);
    }

    #[tokio::test]
    async fn test_invalid_workflow_reports_all_violations() {
        let app = app();
        let definition = r#"
id: broken
nodes:
  - { id: C, type: CONDITION, data: { condition: "x == 1" } }
edges:
  - { id: e1, source: C, target: ghost, handle: "true" }
"#;
        let (status, body) = send(&app, "POST", "/api/workflows", Some(definition.into())).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "GRAPH_VALIDATION_ERROR");
        let kinds: Vec<&str> = body["error"]["violations"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["kind"].as_str().unwrap())
            .collect();
        assert!(kinds.contains(&"missing_trigger"));
        assert!(kinds.contains(&"unknown_edge_target"));
    }

    #[tokio::test]
    async fn test_manual_trigger_flow() {
        let app = app();
        let (status, body) = send(&app, "POST", "/api/workflows", Some(WORKFLOW.into())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["definition"]["version"], 1);

        let (status, _) = send(
            &app,
            "POST",
            "/api/workflows/welcome/executions",
            Some(json!({"leadId": "L1"}).to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            "PUT",
            "/api/leads/L1",
            Some(json!({"email": "ada@example.com", "name": "Ada"}).to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            "/api/workflows/welcome/executions",
            Some(json!({"leadId": "L1", "input": {"score": 3}}).to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "WAITING");
        assert_eq!(body["currentNode"], "D");
        assert_eq!(body["state"]["variables"]["score"], 3);

        let (status, body) = send(&app, "GET", "/api/workflows/welcome/executions/L1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["history"][0]["nodeId"], "T");

        let (status, body) = send(
            &app,
            "POST",
            "/api/workflows/welcome/executions/L1/cancel",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "CANCELLED");

        let (status, body) = send(&app, "GET", "/api/workflows/welcome/executions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["executions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_events_and_deactivation() {
        let app = app();
        send(&app, "POST", "/api/workflows", Some(WORKFLOW.into())).await;

        let event = json!({"type": "lead.created", "leadId": "L9", "payload": {"email": "x@y.io"}});
        let (status, body) = send(&app, "POST", "/api/events", Some(event.to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["started"].as_array().unwrap().len(), 1);

        // Second event restarts the execution and archives the first run.
        send(&app, "POST", "/api/events", Some(event.to_string())).await;
        let (_, body) = send(&app, "GET", "/api/workflows/welcome/executions/L9/runs", None).await;
        assert_eq!(body["runs"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, "POST", "/api/workflows/welcome/deactivate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["definition"]["isActive"], false);

        let (_, body) = send(&app, "POST", "/api/events", Some(event.to_string())).await;
        assert!(body["started"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_not_found_responses() {
        let app = app();
        let (status, body) = send(&app, "GET", "/api/workflows/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let (status, _) = send(&app, "GET", "/api/workflows/missing/executions/L1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "POST", "/api/workflows/missing/activate", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
