//! Typed error kinds surfaced at component boundaries.
//!
//! Guardrail rejections are not errors; they are ordinary result values in
//! `guardrails::Verdict`. The kinds here are the ones that cross the API
//! boundary or abort an engine run.

use thiserror::Error;

use crate::models::RecommendationStatus;

#[derive(Debug, Error)]
pub enum AutopilotError {
    #[error("validation failed on field `{field}`: {message}")]
    ValidationFailed { field: String, message: String },

    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: RecommendationStatus,
        to: RecommendationStatus,
    },

    #[error("recommendation `{0}` not found")]
    NotFound(String),

    #[error("warehouse unavailable: {0}")]
    WarehouseUnavailable(String),

    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("approval store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("generation already in flight for customer {customer_id} snapshot {snapshot_date}")]
    GenerationInFlight {
        customer_id: i64,
        snapshot_date: chrono::NaiveDate,
    },
}

impl AutopilotError {
    /// Stable machine-readable code, used in the API error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AutopilotError::ValidationFailed { .. } => "validation_failed",
            AutopilotError::IllegalTransition { .. } => "illegal_transition",
            AutopilotError::NotFound(_) => "not_found",
            AutopilotError::WarehouseUnavailable(_) => "warehouse_unavailable",
            AutopilotError::LedgerUnavailable(_) => "ledger_unavailable",
            AutopilotError::StoreUnavailable(_) => "store_unavailable",
            AutopilotError::GenerationInFlight { .. } => "generation_in_flight",
        }
    }
}

pub type Result<T> = std::result::Result<T, AutopilotError>;
