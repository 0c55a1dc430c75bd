use thiserror::Error;
use waddle_core::types::AuthFailure;

/// Identity-layer errors. Kept separate from WaddleError so the gateway
/// can map them to wire statuses without coupling layers.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Authentication failed: {0}")]
    Authentication(AuthFailure),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Hashing error: {0}")]
    Hashing(String),

    #[error("Token error: {0}")]
    Token(String),
}

impl From<IdentityError> for waddle_core::WaddleError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Authentication(reason) => {
                waddle_core::WaddleError::AuthenticationFailed(reason)
            }
            IdentityError::PermissionDenied(permission) => {
                waddle_core::WaddleError::AuthorizationDenied { permission }
            }
            IdentityError::Database(e) => waddle_core::WaddleError::Database(e.to_string()),
            other => waddle_core::WaddleError::internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, IdentityError>;
