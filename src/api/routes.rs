//! Route handlers.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ExecutionMode;
use crate::execution::{ExecutionOutcome, ExecutionResult};
use crate::models::{ChangeRecord, EntityKind, Recommendation};

use super::{ApiError, AppState};

fn parse_mode(state: &AppState, mode: Option<&str>) -> Result<ExecutionMode, ApiError> {
    match mode {
        None => Ok(state.config.execution.mode_default),
        Some(raw) => ExecutionMode::parse(raw)
            .ok_or_else(|| ApiError::bad_request(format!("unknown mode `{raw}`"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub recommendation_id: String,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    #[serde(flatten)]
    pub result: ExecutionResult,
}

pub async fn execute_recommendation(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let mode = parse_mode(&state, request.mode.as_deref())?;
    let result = state
        .execution
        .execute_one(&request.recommendation_id, mode, None, Utc::now())
        .await?;

    match &result.outcome {
        ExecutionOutcome::NotFound => Err(ApiError::new(
            axum::http::StatusCode::NOT_FOUND,
            "not_found",
            format!("recommendation `{}` not found", request.recommendation_id),
        )),
        ExecutionOutcome::IllegalState { current_status } => Err(ApiError::new(
            axum::http::StatusCode::CONFLICT,
            "illegal_transition",
            format!("recommendation is {}, not APPROVED", current_status.as_str()),
        )),
        _ => Ok(Json(ExecuteResponse { result })),
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBatchRequest {
    pub ids: Vec<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteBatchResponse {
    pub results: Vec<ExecutionResult>,
}

pub async fn execute_batch(
    State(state): State<AppState>,
    Json(request): Json<ExecuteBatchRequest>,
) -> Result<Json<ExecuteBatchResponse>, ApiError> {
    if request.ids.is_empty() {
        return Err(ApiError::bad_request("ids must not be empty"));
    }
    let mode = parse_mode(&state, request.mode.as_deref())?;
    let results = state
        .execution
        .execute_batch(&request.ids, mode, None, Utc::now())
        .await?;
    Ok(Json(ExecuteBatchResponse { results }))
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub id: String,
    pub approver: String,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

pub async fn approve(
    State(state): State<AppState>,
    Json(request): Json<ApproveRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    if request.approver.trim().is_empty() {
        return Err(ApiError::bad_request("approver must not be empty"));
    }
    state
        .approval
        .approve(&request.id, &request.approver, Utc::now())?;
    Ok(Json(OkResponse { ok: true }))
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub id: String,
    pub approver: String,
    pub reason: String,
}

pub async fn reject(
    State(state): State<AppState>,
    Json(request): Json<RejectRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    if request.approver.trim().is_empty() {
        return Err(ApiError::bad_request("approver must not be empty"));
    }
    state
        .approval
        .reject(&request.id, &request.approver, &request.reason, Utc::now())?;
    Ok(Json(OkResponse { ok: true }))
}

pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Recommendation>, ApiError> {
    Ok(Json(state.approval.get(&id)?))
}

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    pub since: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChangesResponse {
    pub changes: Vec<ChangeRecord>,
    pub count: usize,
}

pub async fn changes(
    State(state): State<AppState>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ChangesResponse>, ApiError> {
    let since = match query.since.as_deref() {
        None => Utc::now() - chrono::Duration::days(30),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| ApiError::bad_request("since must be an RFC 3339 timestamp"))?,
    };
    let changes = state.ledger.recent(state.config.customer_id, since)?;
    Ok(Json(ChangesResponse {
        count: changes.len(),
        changes,
    }))
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub snapshot_date: String,
    #[serde(default)]
    pub entity_kinds: Option<Vec<String>>,
}

pub async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<crate::recommend::GenerationSummary>, ApiError> {
    let snapshot_date: NaiveDate = request
        .snapshot_date
        .parse()
        .map_err(|_| ApiError::bad_request("snapshot_date must be YYYY-MM-DD"))?;

    let kinds = match &request.entity_kinds {
        None => None,
        Some(raw) => {
            let mut kinds = Vec::with_capacity(raw.len());
            for name in raw {
                match EntityKind::parse(name) {
                    Some(kind) => kinds.push(kind),
                    None => {
                        return Err(ApiError::bad_request(format!(
                            "unknown entity kind `{name}`"
                        )))
                    }
                }
            }
            Some(kinds)
        }
    };

    let customer_id = state.config.customer_id;
    let summary =
        state
            .recommend
            .generate(customer_id, snapshot_date, kinds.as_deref(), Utc::now())?;
    Ok(Json(summary))
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<crate::cache::CacheStats> {
    Json(state.cache.stats())
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
    })
}
