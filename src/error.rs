use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::SettlementStatus;

/// Top-level error type for the settlement service
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Ledger read failed: {0}")]
    Ledger(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Settlement state and scheduling errors
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Invalid settlement transition for period {period_id}: {from} -> {to}")]
    InvalidTransition {
        period_id: Uuid,
        from: SettlementStatus,
        to: SettlementStatus,
    },

    #[error("Scheduler already running")]
    AlreadyRunning,

    #[error("Settlement period already exists for account {account_id} starting {period_start}")]
    DuplicatePeriod {
        account_id: Uuid,
        period_start: chrono::DateTime<chrono::Utc>,
    },

    #[error("Period {0} was computed without balance snapshots and cannot be invoiced")]
    DegradedReport(Uuid),

    #[error("Period {period_id} is {status} and cannot be invoiced")]
    NotInvoiceable {
        period_id: Uuid,
        status: SettlementStatus,
    },
}

/// Payment gateway errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Payment gateway is not configured")]
    NotConfigured,

    #[error("Gateway API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("No price configured for tier: {0}")]
    NoPriceForTier(String),
}

impl AppError {
    /// Transient infrastructure failures that the next tick or a manual retry may clear
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Database(_) | AppError::Ledger(_) | AppError::Timeout(_) => true,
            AppError::Gateway(GatewayError::Api { status, .. }) => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            AppError::Gateway(GatewayError::InvalidSignature) => {
                (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE")
            }
            AppError::Gateway(GatewayError::MalformedPayload(_)) => {
                (StatusCode::BAD_REQUEST, "MALFORMED_PAYLOAD")
            }
            AppError::Gateway(GatewayError::NotConfigured) => {
                (StatusCode::SERVICE_UNAVAILABLE, "GATEWAY_NOT_CONFIGURED")
            }
            AppError::Settlement(SettlementError::InvalidTransition { .. }) => {
                (StatusCode::CONFLICT, "INVALID_TRANSITION")
            }
            AppError::Settlement(SettlementError::AlreadyRunning) => {
                (StatusCode::CONFLICT, "ALREADY_RUNNING")
            }
            AppError::Settlement(SettlementError::DuplicatePeriod { .. }) => {
                (StatusCode::CONFLICT, "DUPLICATE_PERIOD")
            }
            AppError::Settlement(_) => (StatusCode::UNPROCESSABLE_ENTITY, "NOT_INVOICEABLE"),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        // Database details stay in the logs
        let message = match &self {
            AppError::Database(_) => "A database error occurred".to_string(),
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            AppError::Timeout(format!("HTTP request: {:?}", error))
        } else {
            AppError::Gateway(GatewayError::Api {
                status: error.status().map(|s| s.as_u16()).unwrap_or(0),
                message: format!("HTTP request error: {:?}", error),
            })
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Gateway(GatewayError::MalformedPayload(error.to_string()))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
