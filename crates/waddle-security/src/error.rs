use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Unknown security policy: {0}")]
    UnknownPolicy(String),
}

pub type Result<T> = std::result::Result<T, SecurityError>;
