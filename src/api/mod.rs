//! Inbound HTTP API served to the dashboard collaborator.
//!
//! Every error leaves through the uniform envelope
//! `{"error": {"code", "message"}}` with the matching HTTP status.

pub mod routes;

use axum::{
    http::StatusCode,
    middleware as axum_mw,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::cache::ExpiringCache;
use crate::config::AppConfig;
use crate::error::AutopilotError;
use crate::execution::ExecutionEngine;
use crate::ledger::ChangeLedger;
use crate::middleware::{rate_limit_middleware, request_logging, SlidingWindowLimiter};
use crate::recommend::RecommendationEngine;
use crate::approval::ApprovalStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub approval: Arc<ApprovalStore>,
    pub ledger: Arc<ChangeLedger>,
    pub execution: Arc<ExecutionEngine>,
    pub recommend: Arc<RecommendationEngine>,
    pub cache: Arc<ExpiringCache>,
    pub execute_limiter: SlidingWindowLimiter,
    pub batch_limiter: SlidingWindowLimiter,
}

/// JSON error envelope plus HTTP status.
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_failed", message)
    }
}

impl From<AutopilotError> for ApiError {
    fn from(err: AutopilotError) -> Self {
        let status = match &err {
            AutopilotError::ValidationFailed { .. } => StatusCode::BAD_REQUEST,
            AutopilotError::NotFound(_) => StatusCode::NOT_FOUND,
            AutopilotError::IllegalTransition { .. } => StatusCode::CONFLICT,
            AutopilotError::GenerationInFlight { .. } => StatusCode::CONFLICT,
            AutopilotError::WarehouseUnavailable(_)
            | AutopilotError::LedgerUnavailable(_)
            | AutopilotError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let execute_limited = Router::new()
        .route(
            "/api/execute-recommendation",
            post(routes::execute_recommendation),
        )
        .layer(axum_mw::from_fn_with_state(
            state.execute_limiter.clone(),
            rate_limit_middleware,
        ));

    let batch_limited = Router::new()
        .route("/api/execute-batch", post(routes::execute_batch))
        .layer(axum_mw::from_fn_with_state(
            state.batch_limiter.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .merge(execute_limited)
        .merge(batch_limited)
        .route("/api/approve", post(routes::approve))
        .route("/api/reject", post(routes::reject))
        .route("/api/status/:id", get(routes::status))
        .route("/api/changes", get(routes::changes))
        .route("/api/generate", post(routes::generate))
        .route("/api/cache-stats", get(routes::cache_stats))
        .route("/health", get(routes::health))
        .layer(axum_mw::from_fn(request_logging))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
