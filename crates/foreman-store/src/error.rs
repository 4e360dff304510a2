use thiserror::Error;

use foreman_types::ForemanError;

/// DAO failure modes. Governance maps `Integrity` to `Conflict` and missing
/// rows to `NotFound` at its boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("integrity: {0}")]
    Integrity(String),

    #[error("storage: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound("no matching row".into()),
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
                    StoreError::Integrity(err.to_string())
                } else {
                    StoreError::Conflict(err.to_string())
                }
            }
            _ => StoreError::Storage(err.to_string()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Storage(format!("column serialization: {err}"))
    }
}

impl From<StoreError> for ForemanError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => ForemanError::NotFound(msg),
            StoreError::Conflict(msg) => ForemanError::Conflict(msg),
            StoreError::Integrity(msg) => ForemanError::Conflict(msg),
            StoreError::Storage(msg) => ForemanError::Storage(msg),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
