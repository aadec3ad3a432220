// src/errors.rs
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::transaction::{LedgerState, PaymentMethod, PaymentStatus};

/// Failures raised by a provider adapter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rejected the request: {0}")]
    Rejected(String),

    #[error("provider call timed out")]
    Timeout,

    #[error("provider authentication failed: {0}")]
    Authentication(String),

    #[error("unexpected provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// The request may or may not have reached the provider.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_) | ProviderError::Timeout)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else {
            ProviderError::Unavailable(format!("HTTP request failed: {}", err))
        }
    }
}

/// Failures raised by a transaction ledger.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("transaction {0} not found")]
    NotFound(Uuid),

    #[error("stale state for {id}: expected {expected}, found {actual}")]
    StaleState {
        id: Uuid,
        expected: LedgerState,
        actual: LedgerState,
    },

    #[error("illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: Uuid,
        from: LedgerState,
        to: LedgerState,
    },

    #[error("duplicate transaction reference: {0}")]
    DuplicateReference(String),

    #[error("duplicate provider reference: {0}")]
    DuplicateProviderReference(String),

    #[error("invalid transition fields: {0}")]
    InvalidFields(String),

    #[error("disbursement claim unavailable for {id}: {reason}")]
    ClaimUnavailable { id: Uuid, reason: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Races and uniqueness violations. Callers re-read instead of failing the payment.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            LedgerError::StaleState { .. }
                | LedgerError::DuplicateReference(_)
                | LedgerError::DuplicateProviderReference(_)
                | LedgerError::ClaimUnavailable { .. }
        )
    }
}

impl From<mongodb::error::Error> for LedgerError {
    fn from(err: mongodb::error::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

/// Outcomes of orchestrator operations that callers have to act on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PaymentError {
    #[error("transaction {0} not found")]
    NotFound(String),

    #[error("payment rejected by provider: {reason}")]
    Rejected { transaction_id: Uuid, reason: String },

    #[error("provider temporarily unavailable, retry later: {reason}")]
    RetryLater {
        transaction_id: Uuid,
        transaction_reference: String,
        reason: String,
    },

    #[error("transaction {id} is {actual}, expected {expected}")]
    InvalidState {
        id: Uuid,
        expected: PaymentStatus,
        actual: PaymentStatus,
    },

    #[error("escrow operation not allowed: transaction {id} is {state}")]
    EscrowPrecondition { id: Uuid, state: LedgerState },

    #[error("concurrent update detected: {0}")]
    Conflict(String),

    #[error("payment method {0} is reconciled manually")]
    UnsupportedMethod(PaymentMethod),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("upstream service error: {0}")]
    Upstream(String),

    #[error("ledger error: {0}")]
    Ledger(LedgerError),
}

impl From<LedgerError> for PaymentError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => PaymentError::NotFound(id.to_string()),
            e if e.is_integrity() => PaymentError::Conflict(e.to_string()),
            e => PaymentError::Ledger(e),
        }
    }
}

/// Failures at the webhook boundary. Each maps to the status providers retry on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WebhookError {
    #[error("signature verification failed: {0}")]
    InvalidSignature(String),

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
            WebhookError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            WebhookError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "status": "error",
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("MongoDB error: {0}")]
    MongoDB(#[from] mongodb::error::Error),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("HTTP client error: {0}")]
    HttpClientError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let this = match self {
            AppError::Webhook(err) => return err.into_response(),
            other => other,
        };

        let (status, error_message) = match &this {
            AppError::MongoDB(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error"),
            AppError::Payment(err) => match err {
                PaymentError::NotFound(_) => (StatusCode::NOT_FOUND, "Transaction not found"),
                PaymentError::Rejected { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "Payment rejected")
                }
                PaymentError::RetryLater { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "Provider unavailable")
                }
                PaymentError::InvalidState { .. } => (StatusCode::CONFLICT, "Invalid state"),
                PaymentError::EscrowPrecondition { .. } => {
                    (StatusCode::CONFLICT, "Escrow precondition failed")
                }
                PaymentError::Conflict(_) => (StatusCode::CONFLICT, "Concurrent update"),
                PaymentError::UnsupportedMethod(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "Unsupported payment method")
                }
                PaymentError::Validation(_) => (StatusCode::BAD_REQUEST, "Validation failed"),
                PaymentError::Upstream(_) => (StatusCode::BAD_GATEWAY, "Upstream service error"),
                PaymentError::Ledger(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Ledger error"),
            },
            AppError::Webhook(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Webhook error"),
            AppError::ValidationError(_) => (StatusCode::BAD_REQUEST, "Validation failed"),
            AppError::ConfigurationError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Configuration error")
            }
            AppError::HttpClientError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "HTTP client error")
            }
        };

        let mut body = json!({
            "error": error_message,
            "message": this.to_string(),
            "success": false,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        if let AppError::Payment(PaymentError::RetryLater {
            transaction_id,
            transaction_reference,
            ..
        }) = &this
        {
            body["transaction_id"] = json!(transaction_id);
            body["transaction_reference"] = json!(transaction_reference);
            let mut response = (status, Json(body)).into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("30"));
            return response;
        }

        (status, Json(body)).into_response()
    }
}

impl AppError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        AppError::ConfigurationError(msg.into())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::HttpClientError(format!("HTTP client setup failed: {}", err))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::ValidationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
