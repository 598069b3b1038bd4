use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::gdd::{EditOutcome, GddEngine, GddError};
use crate::models::{
    DailyValue, GddModel, ModelMetadataEdit, NewGddModel, NewObservation, ParameterEdit, ResetKind,
    Run,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<GddEngine>,
}

/// Create the API router
pub fn create_router(engine: Arc<GddEngine>) -> Router {
    let state = AppState { engine };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/models", post(create_model).get(list_models))
        .route(
            "/api/models/:id",
            get(get_model).put(update_model).delete(delete_model),
        )
        .route("/api/models/:id/parameters", put(update_parameters))
        .route("/api/models/:id/history", get(get_parameter_history))
        .route("/api/models/:id/reset", post(reset_model))
        .route("/api/models/:id/resets", get(get_resets))
        .route("/api/models/:id/resets/:run", delete(undo_reset))
        .route("/api/models/:id/runs", get(get_runs))
        .route("/api/models/:id/runs/:run/values", get(get_run_values))
        .route("/api/models/:id/values", get(get_values))
        .route("/api/models/:id/summary", get(get_summary))
        .route("/api/locations/:id/models", get(get_location_dashboard))
        .route("/api/locations/:id/observations", post(ingest_observations))
        .route("/api/locations/:id/weather", get(get_weather))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn create_model(
    State(state): State<AppState>,
    Json(new): Json<NewGddModel>,
) -> Result<(StatusCode, Json<GddModel>), ApiError> {
    let model = state.engine.create_model(new)?;
    Ok((StatusCode::CREATED, Json(model)))
}

async fn list_models(State(state): State<AppState>) -> Result<Json<ModelsResponse>, ApiError> {
    let models = state.engine.store().list_models()?;
    Ok(Json(ModelsResponse {
        count: models.len(),
        models,
    }))
}

async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<GddModel>, ApiError> {
    state
        .engine
        .store()
        .get_model(id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Model {} not found", id)))
}

/// Identity-field update; parameter changes go through `/parameters`.
async fn update_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(edit): Json<ModelMetadataEdit>,
) -> Result<Json<GddModel>, ApiError> {
    Ok(Json(state.engine.update_model(id, edit)?))
}

async fn delete_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_model(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Partial parameter update. Forward-only edits apply inline; edits with
/// `recalculate_history` launch a background task and return 202 with its id.
async fn update_parameters(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(edit): Json<ParameterEdit>,
) -> Result<Response, ApiError> {
    match state.engine.apply_parameter_edit(id, edit)? {
        EditOutcome::Forward { effective } => Ok(Json(json!({
            "status": "applied",
            "parameters": effective,
        }))
        .into_response()),
        EditOutcome::Recalculating { task_id } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "recalculating",
                "task_id": task_id,
            })),
        )
            .into_response()),
    }
}

async fn get_parameter_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_model(&state, id)?;
    let history = state.engine.store().parameter_history(id)?;
    Ok(Json(json!({ "parameters": history.sets() })))
}

async fn reset_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ResetRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.manual_reset(id, req.reset_date)?;
    Ok(Json(json!({ "status": "reset", "reset_date": req.reset_date })))
}

/// Manual reset boundaries, surfaced as the runs they opened.
async fn get_resets(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_model(&state, id)?;
    let resets: Vec<Run> = state
        .engine
        .store()
        .runs(id)?
        .into_iter()
        .filter(|r| r.opened_by == ResetKind::Manual)
        .collect();
    Ok(Json(json!({ "count": resets.len(), "resets": resets })))
}

async fn undo_reset(
    State(state): State<AppState>,
    Path((id, run)): Path<(i64, i64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.undo_manual_reset(id, run)?;
    Ok(Json(json!({ "status": "undone", "run_number": run })))
}

async fn get_runs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_model(&state, id)?;
    let runs = state.engine.store().runs(id)?;
    Ok(Json(json!({ "runs": runs })))
}

async fn get_run_values(
    State(state): State<AppState>,
    Path((id, run)): Path<(i64, i64)>,
) -> Result<Json<ValuesResponse>, ApiError> {
    require_model(&state, id)?;
    let values = state.engine.store().values_for_run(id, run)?;
    Ok(Json(ValuesResponse {
        count: values.len(),
        values,
    }))
}

/// Daily values with optional date-range filters
async fn get_values(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(range): Query<DateRangeQuery>,
) -> Result<Json<ValuesResponse>, ApiError> {
    require_model(&state, id)?;
    let values = state
        .engine
        .store()
        .values_in_range(id, range.from, range.through)?;
    Ok(Json(ValuesResponse {
        count: values.len(),
        values,
    }))
}

async fn get_summary(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<crate::gdd::ModelSummary>, ApiError> {
    Ok(Json(state.engine.summary(id)?))
}

async fn get_location_dashboard(
    State(state): State<AppState>,
    Path(location_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let models = state.engine.dashboard(location_id)?;
    Ok(Json(json!({ "count": models.len(), "models": models })))
}

/// Store observations for a location and bring its models up to date.
async fn ingest_observations(
    State(state): State<AppState>,
    Path(location_id): Path<i64>,
    Json(observations): Json<Vec<NewObservation>>,
) -> Result<Json<crate::gdd::IngestReport>, ApiError> {
    let report = state.engine.ingest_observations(location_id, &observations)?;
    Ok(Json(report))
}

async fn get_weather(
    State(state): State<AppState>,
    Path(location_id): Path<i64>,
    Query(range): Query<DateRangeQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let from = range
        .from
        .ok_or_else(|| ApiError::BadRequest("from date is required".into()))?;
    let through = range
        .through
        .ok_or_else(|| ApiError::BadRequest("through date is required".into()))?;
    let days = state.engine.store().weather_for(location_id, from, through)?;
    Ok(Json(json!({ "count": days.len(), "days": days })))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<crate::tasks::TaskRecord>, ApiError> {
    state
        .engine
        .tasks()
        .get(id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.engine.tasks().get(id)?.is_none() {
        return Err(ApiError::NotFound(format!("Task {} not found", id)));
    }
    let cancelled = state.engine.tasks().cancel(id);
    Ok(Json(json!({ "cancelled": cancelled })))
}

fn require_model(state: &AppState, id: i64) -> Result<(), ApiError> {
    state
        .engine
        .store()
        .get_model(id)?
        .map(|_| ())
        .ok_or_else(|| ApiError::NotFound(format!("Model {} not found", id)))
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct DateRangeQuery {
    from: Option<NaiveDate>,
    through: Option<NaiveDate>,
}

#[derive(Deserialize)]
struct ResetRequest {
    reset_date: NaiveDate,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ModelsResponse {
    count: usize,
    models: Vec<GddModel>,
}

#[derive(Serialize)]
struct ValuesResponse {
    count: usize,
    values: Vec<DailyValue>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    Internal(anyhow::Error),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        // Domain errors carry their own status
        match err.downcast_ref::<GddError>() {
            Some(GddError::Validation(msg)) => ApiError::BadRequest(msg.clone()),
            Some(GddError::ModelNotFound(id)) => {
                ApiError::NotFound(format!("Model {} not found", id))
            }
            Some(GddError::ConcurrentModification { model_id }) => ApiError::Conflict(format!(
                "Model {} is being modified, retry shortly",
                model_id
            )),
            _ => ApiError::Internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
