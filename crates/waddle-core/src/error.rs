use thiserror::Error;

use crate::types::{AuthFailure, QuotaDetail};

/// Gateway-wide error taxonomy. Every terminal pipeline state maps to
/// exactly one of these kinds; handlers translate them into the wire
/// response via `status()` and `code()`.
#[derive(Debug, Error)]
pub enum WaddleError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(AuthFailure),

    #[error("Authorization denied: {permission}")]
    AuthorizationDenied { permission: String },

    #[error("Request blocked by security policy: {threat}")]
    SecurityRejected { threat: String },

    #[error("Quota exceeded")]
    QuotaExceeded { detail: QuotaDetail },

    #[error("Upstream provider failed: {0}")]
    UpstreamFailed(String),

    #[error("All providers failed: {last_error}")]
    AllProvidersFailed { last_error: String },

    #[error("Server is at capacity")]
    Overloaded,

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error [{correlation_id}]")]
    Internal {
        correlation_id: String,
        /// Logged, never sent to the client.
        message: String,
    },
}

impl WaddleError {
    /// Wrap an arbitrary internal failure with a fresh correlation id.
    /// The id appears in both the structured log and the client response
    /// so operators can join the two.
    pub fn internal(message: impl Into<String>) -> Self {
        WaddleError::Internal {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
        }
    }

    /// Short opaque code string sent to clients in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            WaddleError::Config(_) => "config_error",
            WaddleError::AuthenticationFailed(_) => "auth_failed",
            WaddleError::AuthorizationDenied { .. } => "forbidden",
            WaddleError::SecurityRejected { .. } => "security_rejected",
            WaddleError::QuotaExceeded { .. } => "quota_exceeded",
            WaddleError::UpstreamFailed(_) => "upstream_failed",
            WaddleError::AllProvidersFailed { .. } => "all_providers_failed",
            WaddleError::Overloaded => "overloaded",
            WaddleError::MalformedRequest(_) => "malformed_request",
            WaddleError::Database(_) => "internal_error",
            WaddleError::Serialization(_) => "internal_error",
            WaddleError::Internal { .. } => "internal_error",
        }
    }

    /// Fixed HTTP status for each kind.
    pub fn status(&self) -> u16 {
        match self {
            WaddleError::AuthenticationFailed(_) => 401,
            WaddleError::AuthorizationDenied { .. } => 403,
            WaddleError::SecurityRejected { .. } => 400,
            WaddleError::MalformedRequest(_) => 400,
            WaddleError::QuotaExceeded { .. } => 429,
            WaddleError::UpstreamFailed(_) => 502,
            WaddleError::AllProvidersFailed { .. } => 503,
            WaddleError::Overloaded => 503,
            WaddleError::Config(_)
            | WaddleError::Database(_)
            | WaddleError::Serialization(_)
            | WaddleError::Internal { .. } => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, WaddleError>;
