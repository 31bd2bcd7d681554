//! JSON surface over [`GenerationPipeline`].

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use quill_audit::{CostSummary, GenerationLogEntry, LogFilter, LogPage};
use quill_core::{GenerationOutcome, GenerationPipeline, PipelineError};
use quill_types::{ErrorKind, ExecutionId, GenerationRequest};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<GenerationPipeline>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<quill_types::Diagnostics>,
}

pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError(err)
    }
}

fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        PipelineError::FeatureDisabled(_) => StatusCode::FORBIDDEN,
        PipelineError::Feature(quill_features::FeatureError::UnknownFlag(_)) => {
            StatusCode::NOT_FOUND
        }
        PipelineError::Terminal { kind, .. } => match kind {
            ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Network | ErrorKind::Api | ErrorKind::Parse => StatusCode::BAD_GATEWAY,
            ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        },
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let diagnostics = match &self.0 {
            PipelineError::Terminal { diagnostics, .. } => Some(diagnostics.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind(),
            execution_id: self.0.execution_id(),
            diagnostics,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn app(pipeline: Arc<GenerationPipeline>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/generate", post(generate))
        .route("/v1/logs", get(list_logs))
        .route("/v1/logs/:execution_id", get(get_log))
        .route("/v1/logs/:execution_id/corrections", post(correct_log))
        .route("/v1/costs/:project_id", get(costs))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/cleanup", post(cleanup_cache))
        .route("/v1/cache/purge", post(purge_cache))
        .route("/v1/features", get(features))
        .route(
            "/v1/features/:name/override",
            put(set_override).delete(clear_override),
        )
        .route("/v1/features/stable", post(enable_stable))
        .route("/v1/features/rollback", post(rollback))
        .route("/v1/schema/report", get(schema_report))
        .with_state(AppState { pipeline })
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerationRequest>,
) -> ApiResult<GenerationOutcome> {
    Ok(Json(state.pipeline.submit(req).await?))
}

async fn list_logs(
    State(state): State<AppState>,
    Query(filter): Query<LogFilter>,
) -> ApiResult<LogPage> {
    Ok(Json(state.pipeline.list_logs(&filter).await?))
}

async fn get_log(
    State(state): State<AppState>,
    Path(execution_id): Path<ExecutionId>,
) -> Result<Json<GenerationLogEntry>, Response> {
    match state.pipeline.get_log(execution_id).await {
        Ok(Some(entry)) => Ok(Json(entry)),
        Ok(None) => Err(StatusCode::NOT_FOUND.into_response()),
        Err(err) => Err(ApiError(err).into_response()),
    }
}

#[derive(Debug, Deserialize)]
pub struct CorrectionRequest {
    pub note: String,
}

async fn correct_log(
    State(state): State<AppState>,
    Path(execution_id): Path<ExecutionId>,
    Json(body): Json<CorrectionRequest>,
) -> ApiResult<GenerationLogEntry> {
    Ok(Json(
        state
            .pipeline
            .append_correction(execution_id, &body.note)
            .await?,
    ))
}

async fn costs(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<CostSummary> {
    Ok(Json(state.pipeline.cost_summary(&project_id).await?))
}

async fn cache_stats(State(state): State<AppState>) -> ApiResult<quill_cache::CacheStats> {
    Ok(Json(state.pipeline.cache_stats().await?))
}

#[derive(Debug, Deserialize)]
pub struct CleanupParams {
    #[serde(default = "default_cleanup_days")]
    pub days_old: u32,
}

fn default_cleanup_days() -> u32 {
    30
}

#[derive(Debug, Serialize)]
pub struct Removed {
    pub removed: usize,
}

async fn cleanup_cache(
    State(state): State<AppState>,
    Query(params): Query<CleanupParams>,
) -> ApiResult<Removed> {
    let removed = state.pipeline.cleanup_cache(params.days_old).await?
        + state.pipeline.sweep_expired().await?;
    Ok(Json(Removed { removed }))
}

async fn purge_cache(State(state): State<AppState>) -> ApiResult<Removed> {
    let removed = state.pipeline.purge_cache().await?;
    Ok(Json(Removed { removed }))
}

async fn features(State(state): State<AppState>) -> Json<Vec<quill_features::FlagState>> {
    Json(state.pipeline.feature_states())
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub enabled: bool,
}

async fn set_override(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<OverrideRequest>,
) -> ApiResult<Vec<quill_features::FlagState>> {
    state.pipeline.set_feature_override(&name, body.enabled)?;
    Ok(Json(state.pipeline.feature_states()))
}

async fn clear_override(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Vec<quill_features::FlagState>> {
    state.pipeline.clear_feature_override(&name)?;
    Ok(Json(state.pipeline.feature_states()))
}

async fn enable_stable(State(state): State<AppState>) -> ApiResult<Vec<quill_features::FlagState>> {
    state.pipeline.enable_stable_features()?;
    Ok(Json(state.pipeline.feature_states()))
}

async fn rollback(State(state): State<AppState>) -> ApiResult<Vec<quill_features::FlagState>> {
    state.pipeline.rollback_to_legacy()?;
    Ok(Json(state.pipeline.feature_states()))
}

async fn schema_report(
    State(state): State<AppState>,
) -> ApiResult<quill_schema::SchemaCompatibilityReport> {
    Ok(Json(state.pipeline.schema_report()?))
}
