//! Error types for the faucet service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Which limiter key class rejected a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    Address,
    Origin,
}

impl std::fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaScope::Address => write!(f, "address"),
            QuotaScope::Origin => write!(f, "origin"),
        }
    }
}

/// Faucet service errors
#[derive(Error, Debug)]
pub enum FaucetError {
    #[error("Blockchain config [{0}] not found")]
    UnsupportedNetwork(String),

    #[error("Address '{0}' is not supported.")]
    UnsupportedAddressFormat(String),

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("{message}")]
    QuotaExceeded { scope: QuotaScope, message: String },

    #[error("IP added to blocklist.")]
    OriginBlocked,

    #[error("Recaptcha verification failed")]
    CaptchaFailed,

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Limiter store unavailable: {0}")]
    LimiterStoreUnavailable(String),

    #[error("Invalid status transition for {claim}: {from} -> {to}")]
    InvalidStatusTransition {
        claim: String,
        from: String,
        to: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl FaucetError {
    /// Short machine-readable code included in every error body
    pub fn error_code(&self) -> &'static str {
        match self {
            FaucetError::UnsupportedNetwork(_) => "UNSUPPORTED_NETWORK",
            FaucetError::UnsupportedAddressFormat(_) => "UNSUPPORTED_ADDRESS",
            FaucetError::MissingField(_) => "MISSING_FIELD",
            FaucetError::QuotaExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            FaucetError::OriginBlocked => "ORIGIN_BLOCKED",
            FaucetError::CaptchaFailed => "CAPTCHA_FAILED",
            FaucetError::TransferFailed(_) => "TRANSFER_FAILED",
            // reported to clients exactly like an exhausted quota
            FaucetError::LimiterStoreUnavailable(_) => "RATE_LIMIT_EXCEEDED",
            FaucetError::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            FaucetError::Config(_) => "CONFIG_ERROR",
            FaucetError::DatabaseError(_) => "DATABASE_ERROR",
            FaucetError::RpcError(_) => "RPC_ERROR",
            FaucetError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            FaucetError::UnsupportedNetwork(_)
            | FaucetError::UnsupportedAddressFormat(_)
            | FaucetError::MissingField(_) => StatusCode::BAD_REQUEST,
            FaucetError::QuotaExceeded { .. } | FaucetError::LimiterStoreUnavailable(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            FaucetError::OriginBlocked => StatusCode::FORBIDDEN,
            FaucetError::CaptchaFailed => StatusCode::UNAUTHORIZED,
            FaucetError::RpcError(_) => StatusCode::BAD_GATEWAY,
            FaucetError::TransferFailed(_)
            | FaucetError::InvalidStatusTransition { .. }
            | FaucetError::Config(_)
            | FaucetError::DatabaseError(_)
            | FaucetError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the HTTP caller. Internal failures are not echoed back.
    fn client_message(&self) -> String {
        match self {
            FaucetError::LimiterStoreUnavailable(_) => {
                "Faucet request limits cannot be verified right now. Try again later.".to_string()
            }
            FaucetError::TransferFailed(_)
            | FaucetError::InvalidStatusTransition { .. }
            | FaucetError::Config(_)
            | FaucetError::DatabaseError(_)
            | FaucetError::InternalError(_) => {
                "Failed, please contact the faucet operator.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for FaucetError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "code": 1,
            "error": self.error_code(),
            "message": self.client_message(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }));

        (status, body).into_response()
    }
}

pub type FaucetResult<T> = Result<T, FaucetError>;
