//! HTTP API of the worker
//!
//! Every request runs under its own cancellation token. The token is
//! cancelled when the request deadline passes or when the handler future is
//! dropped because the client went away, which unwinds any half-done load.

use crate::config::ServerConfig;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use worker_core::{Error, InstanceName, ModelVariant, ServingMode};
use worker_manager::{
    InstancePool, LoadOutcome, OfflineJob, OfflinePipeline, QueryDispatcher, UnloadOutcome,
};
use worker_proto::QueryOnlineRequest;

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    dispatcher: QueryDispatcher,
    pipeline: OfflinePipeline,
    registry: prometheus::Registry,
    request_timeout: Duration,
    offline_timeout: Option<Duration>,
    started: Instant,
}

impl ApiState {
    pub fn new(
        dispatcher: QueryDispatcher,
        pipeline: OfflinePipeline,
        registry: prometheus::Registry,
        config: &ServerConfig,
    ) -> Self {
        Self {
            dispatcher,
            pipeline,
            registry,
            request_timeout: config.request_timeout(),
            offline_timeout: config.offline_timeout(),
            started: Instant::now(),
        }
    }

    fn pool(&self) -> &InstancePool {
        self.dispatcher.pool()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/v1/pools", get(pools_handler))
        .route("/v1/models/:variant/query", post(query_handler))
        .route("/v1/models/:variant/load", post(load_handler))
        .route("/v1/models/:variant/unload", post(unload_handler))
        .route("/v1/offline", post(offline_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error response carrying the status of its category
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(error = %self.0, category = self.0.category(), "Request failed");
        }
        let body = Json(json!({
            "error": self.0.to_string(),
            "category": self.0.category(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Run `operation` under a fresh cancellation token and an optional deadline.
///
/// On the deadline the token is cancelled and the operation is awaited until
/// it has unwound.
async fn run_cancellable<T, F, Fut>(deadline: Option<Duration>, operation: F) -> ApiResult<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = worker_core::Result<T>>,
{
    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();
    let work = operation(cancel.clone());
    tokio::pin!(work);

    let Some(deadline) = deadline else {
        return work.await.map_err(ApiError::from);
    };
    tokio::select! {
        result = &mut work => return result.map_err(ApiError::from),
        _ = tokio::time::sleep(deadline) => cancel.cancel(),
    }
    match work.await {
        Err(Error::Cancelled(_)) => Err(Error::timeout(format!(
            "request exceeded its {:?} deadline",
            deadline
        ))
        .into()),
        other => other.map_err(ApiError::from),
    }
}

fn parse_variant(raw: &str) -> ApiResult<ModelVariant> {
    Ok(ModelVariant::new(raw)?)
}

fn parse_instance(raw: Option<String>) -> ApiResult<Option<InstanceName>> {
    Ok(raw.map(InstanceName::new).transpose()?)
}

async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "worker": state.pool().worker().as_str(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.started.elapsed().as_secs(),
    }))
}

async fn metrics_handler(State(state): State<ApiState>) -> Response {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buffer) {
        return ApiError(Error::internal(format!("encoding metrics: {}", e))).into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

async fn pools_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.pool().snapshot())
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    /// Base64 encoded inputs
    inputs: Vec<String>,
}

async fn query_handler(
    State(state): State<ApiState>,
    Path(variant): Path<String>,
    Json(body): Json<QueryBody>,
) -> ApiResult<impl IntoResponse> {
    let variant = parse_variant(&variant)?;
    let raw_input = body
        .inputs
        .iter()
        .map(|input| STANDARD.decode(input))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::invalid_argument(format!("inputs must be base64: {}", e)))?;
    let request = QueryOnlineRequest {
        raw_input,
        model: vec![variant.to_string()],
        slo: None,
    };

    let dispatcher = state.dispatcher.clone();
    let response = run_cancellable(Some(state.request_timeout), |cancel| async move {
        dispatcher.dispatch(&variant, request, &cancel).await
    })
    .await?;

    if !response.is_success() {
        let msg = response.status.map(|s| s.msg).unwrap_or_default();
        return Err(Error::upstream(format!("backend rejected query: {}", msg)).into());
    }
    let outputs: Vec<String> = response.raw_output.iter().map(|o| STANDARD.encode(o)).collect();
    Ok(Json(json!({ "outputs": outputs })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InstanceBody {
    instance: Option<String>,
    mode: Option<ServingMode>,
}

async fn load_handler(
    State(state): State<ApiState>,
    Path(variant): Path<String>,
    Json(body): Json<InstanceBody>,
) -> ApiResult<Response> {
    let variant = parse_variant(&variant)?;
    let instance = parse_instance(body.instance)?;
    let mode = body.mode.unwrap_or(ServingMode::Online);

    let pool = state.pool().clone();
    let outcome = run_cancellable(Some(state.request_timeout), |cancel| async move {
        pool.load(&variant, instance, mode, &cancel).await
    })
    .await?;

    let response = match outcome {
        LoadOutcome::Loaded(instance) => {
            (StatusCode::OK, Json(json!({ "outcome": "loaded", "instance": instance })))
        }
        LoadOutcome::AlreadyLoaded(instance) => (
            StatusCode::OK,
            Json(json!({ "outcome": "already_loaded", "instance": instance })),
        ),
        LoadOutcome::InProgress => (StatusCode::ACCEPTED, Json(json!({ "outcome": "in_progress" }))),
    };
    Ok(response.into_response())
}

async fn unload_handler(
    State(state): State<ApiState>,
    Path(variant): Path<String>,
    Json(body): Json<InstanceBody>,
) -> ApiResult<impl IntoResponse> {
    let variant = parse_variant(&variant)?;
    let instance = parse_instance(body.instance)?;
    let mode = body.mode.unwrap_or(ServingMode::Online);

    let outcome = state.pool().unload(&variant, instance, mode).await?;
    let body = match outcome {
        UnloadOutcome::Unloaded(name) => json!({ "outcome": "unloaded", "instance": name }),
        UnloadOutcome::AlreadyUnloaded => json!({ "outcome": "already_unloaded" }),
    };
    Ok(Json(body))
}

async fn offline_handler(
    State(state): State<ApiState>,
    Json(job): Json<OfflineJob>,
) -> ApiResult<impl IntoResponse> {
    debug!(variant = %job.variant, submitter = %job.submitter, "Offline job received");
    let pipeline = state.pipeline.clone();
    let report = run_cancellable(state.offline_timeout, |cancel| async move {
        pipeline.run(&job, &cancel).await
    })
    .await?;
    Ok(Json(report))
}
