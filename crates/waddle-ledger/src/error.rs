use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Unknown credential: {0}")]
    UnknownCredential(String),

    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
