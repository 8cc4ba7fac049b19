use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_core::{
    DispatchMode, FetchOutcome, FetchRequest, RelayError, RelayService, ReportRequest,
    SubmitRequest, WebhookDelivery,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metrics::{Outcome, RelayMetrics};

/// Header carrying the `sha256=<hex>` webhook signature.
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-hub-signature-256";
/// Header naming the webhook event kind.
pub const WEBHOOK_EVENT_HEADER: &str = "x-github-event";

/// Shared state behind every route.
pub struct AppState {
    service: RelayService,
    metrics: RelayMetrics,
    dispatch: DispatchMode,
}

impl AppState {
    /// Bundle the service with its metrics.
    pub fn new(service: RelayService, metrics: RelayMetrics, dispatch: DispatchMode) -> Self {
        Self {
            service,
            metrics,
            dispatch,
        }
    }
}

/// Construct the router with all relay routes installed.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/cmd", post(submit))
        .route("/next", get(fetch_next))
        .route("/result", post(report_result))
        .route("/webhook", post(webhook))
        .route("/healthz", get(health_endpoint))
        .route("/readyz", get(ready_endpoint))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

/// Error mapped onto an HTTP status and a `{"detail": ...}` body.
#[derive(Debug)]
pub enum ApiError {
    /// Failure reported by the relay service.
    Relay(RelayError),
    /// Failure outside the service (worker task panicked, ...).
    Internal(String),
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        ApiError::Relay(err)
    }
}

impl ApiError {
    fn outcome(&self) -> Outcome {
        match self {
            ApiError::Relay(RelayError::Authentication(_)) => Outcome::Unauthorized,
            ApiError::Relay(RelayError::Validation(_)) => Outcome::Invalid,
            _ => Outcome::Error,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Relay(RelayError::Authentication(_)) => {
                (StatusCode::UNAUTHORIZED, "Invalid signature".to_string())
            }
            ApiError::Relay(RelayError::Validation(msg)) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Relay(RelayError::WebhookUnconfigured) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Webhook secret not configured".to_string(),
            ),
            ApiError::Relay(RelayError::Storage(err)) => {
                tracing::error!(error = %err, "storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Storage failure".to_string(),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
            }
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}

/// Run a queue-touching operation off the async workers and record metrics.
async fn run_op<T, F>(state: &Arc<AppState>, op: &'static str, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&RelayService) -> Result<T, RelayError> + Send + 'static,
{
    let start = std::time::Instant::now();
    let worker_state = Arc::clone(state);
    let res = match tokio::task::spawn_blocking(move || f(&worker_state.service)).await {
        Ok(inner) => inner.map_err(ApiError::from),
        Err(err) => Err(ApiError::Internal(format!("worker task failed: {err}"))),
    };
    let latency = start.elapsed().as_secs_f64() * 1000.0;
    let outcome = match &res {
        Ok(_) => Outcome::Ok,
        Err(err) => err.outcome(),
    };
    state.metrics.observe(op, outcome, latency);
    state.metrics.refresh_queue(&**state.service.queue());
    res
}

/// Render a JSON scalar the way it was meant: strings as-is, numbers in decimal.
fn wire_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Timestamps arrive as integers, strings or floats; floats are truncated.
fn wire_timestamp(value: &Value) -> String {
    match value {
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(ts), _) => ts.to_string(),
            (None, Some(ts)) if ts.is_finite() => (ts.trunc() as i64).to_string(),
            _ => n.to_string(),
        },
        other => wire_text(other),
    }
}

fn wire_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Decode a JSON body regardless of content type. Malformed bodies are a 400.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|err| {
        ApiError::Relay(RelayError::Validation(format!("Invalid JSON body: {err}")))
    })
}

#[derive(Serialize)]
struct LiveResponse {
    status: &'static str,
}

async fn root() -> impl IntoResponse {
    Json(LiveResponse {
        status: "relay is live",
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SubmitBody {
    agent: Value,
    action: Value,
    payload: Value,
    ts: Value,
    sig: Value,
}

#[derive(Serialize)]
struct SubmitResponse {
    status: &'static str,
    queued: bool,
    id: u64,
}

async fn submit(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<SubmitResponse>, ApiError> {
    let body: SubmitBody = parse_body(&body)?;
    let req = SubmitRequest {
        agent: wire_text(&body.agent),
        action: wire_text(&body.action),
        payload: wire_text(&body.payload),
        timestamp: wire_timestamp(&body.ts),
        signature: wire_text(&body.sig),
    };
    let id = run_op(&state, "submit", move |svc| svc.submit(&req)).await?;
    state.metrics.command_enqueued();
    Ok(Json(SubmitResponse {
        status: "ok",
        queued: true,
        id,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FetchParams {
    agent: String,
    ts: String,
    sig: String,
}

#[derive(Serialize)]
#[serde(untagged)]
enum FetchResponse {
    Command {
        status: &'static str,
        id: u64,
        action: String,
        payload: String,
    },
    Empty {
        status: &'static str,
    },
}

async fn fetch_next(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FetchParams>,
) -> Result<Json<FetchResponse>, ApiError> {
    let req = FetchRequest {
        agent: params.agent,
        timestamp: params.ts,
        signature: params.sig,
    };
    let outcome = run_op(&state, "next", move |svc| svc.fetch_next(&req)).await?;
    Ok(Json(match outcome {
        FetchOutcome::Command {
            id,
            action,
            payload,
        } => FetchResponse::Command {
            status: "ok",
            id,
            action,
            payload,
        },
        FetchOutcome::NoPending => FetchResponse::Empty {
            status: "no_pending",
        },
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResultBody {
    agent: Value,
    id: Value,
    result: Value,
    ts: Value,
    sig: Value,
}

#[derive(Serialize)]
struct SavedResponse {
    status: &'static str,
    saved: bool,
}

async fn report_result(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<SavedResponse>, ApiError> {
    let body: ResultBody = parse_body(&body)?;
    let agent = wire_text(&body.agent);
    let req = ReportRequest {
        agent: (!agent.is_empty()).then_some(agent),
        id: wire_id(&body.id),
        result: wire_text(&body.result),
        timestamp: wire_timestamp(&body.ts),
        signature: wire_text(&body.sig),
    };
    run_op(&state, "result", move |svc| svc.report_result(&req)).await?;
    Ok(Json(SavedResponse {
        status: "ok",
        saved: true,
    }))
}

#[derive(Serialize)]
struct QueuedEvent {
    agent: String,
    action: String,
    message: String,
}

#[derive(Serialize)]
struct WebhookResponse {
    status: &'static str,
    queued: QueuedEvent,
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let delivery = WebhookDelivery {
        body: body.to_vec(),
        signature: header_text(&headers, WEBHOOK_SIGNATURE_HEADER),
        event_kind: header_text(&headers, WEBHOOK_EVENT_HEADER),
    };
    let receipt = run_op(&state, "webhook", move |svc| svc.ingest_webhook(&delivery)).await?;
    state.metrics.command_enqueued();
    Ok(Json(WebhookResponse {
        status: "ok",
        queued: QueuedEvent {
            agent: receipt.agent,
            action: receipt.action,
            message: receipt.message,
        },
    }))
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    queue_length: usize,
    pending: usize,
    storage_usage_bytes: u64,
    webhook_configured: bool,
    dispatch: &'static str,
}

fn current_health(state: &AppState, status: &'static str) -> HealthReport {
    let queue = state.service.queue();
    HealthReport {
        status,
        queue_length: queue.len(),
        pending: queue.pending_count(),
        storage_usage_bytes: queue.storage_usage_bytes().unwrap_or(0),
        webhook_configured: state.service.webhook_configured(),
        dispatch: match state.dispatch {
            DispatchMode::Peek => "peek",
            DispatchMode::Claim => "claim",
        },
    }
}

async fn health_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(current_health(&state, "ok"))
}

async fn ready_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(current_health(&state, "ready"))
}

async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.refresh_queue(&**state.service.queue());
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_accept_numbers_and_strings() {
        assert_eq!(wire_text(&serde_json::json!(1700000000)), "1700000000");
        assert_eq!(wire_text(&serde_json::json!("1700000000")), "1700000000");
        assert_eq!(wire_text(&Value::Null), "");
        assert_eq!(wire_id(&serde_json::json!(7)), Some(7));
        assert_eq!(wire_id(&serde_json::json!("7")), Some(7));
        assert_eq!(wire_id(&serde_json::json!(-1)), None);
        assert_eq!(wire_id(&Value::Null), None);
    }

    #[test]
    fn float_timestamps_truncate() {
        assert_eq!(wire_timestamp(&serde_json::json!(1700000000.0)), "1700000000");
        assert_eq!(wire_timestamp(&serde_json::json!(1700000000.9)), "1700000000");
        assert_eq!(wire_timestamp(&serde_json::json!(-5.5)), "-5");
        assert_eq!(wire_timestamp(&serde_json::json!(42)), "42");
        assert_eq!(wire_timestamp(&serde_json::json!("42")), "42");
        assert_eq!(wire_timestamp(&Value::Null), "");
    }

    #[test]
    fn malformed_bodies_are_validation_errors() {
        let err = parse_body::<SubmitBody>(b"{not json").unwrap_err();
        assert_eq!(err.outcome(), Outcome::Invalid);
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        let body: ResultBody =
            parse_body(br#"{"id": "3", "result": 7, "payload": null}"#).unwrap();
        assert_eq!(wire_id(&body.id), Some(3));
        assert_eq!(wire_text(&body.result), "7");
        assert_eq!(wire_text(&body.agent), "");
    }

    #[test]
    fn auth_errors_map_to_401() {
        let err = ApiError::Relay(RelayError::Authentication(
            relay_spec::VerifyError::UnknownAgent,
        ));
        assert_eq!(err.outcome(), Outcome::Unauthorized);
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
        let missing = ApiError::Relay(RelayError::Validation("Missing id".into()));
        assert_eq!(missing.into_response().status(), StatusCode::BAD_REQUEST);
        let hook = ApiError::Relay(RelayError::WebhookUnconfigured);
        assert_eq!(
            hook.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
