use thiserror::Error;

/// Error taxonomy shared by every Foreman component. Each variant maps to a
/// stable wire code via [`ForemanError::code`].
#[derive(Debug, Error)]
pub enum ForemanError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("preconditions: {0}")]
    Preconditions(String),

    #[error("engine failure: {0}")]
    EngineFailure(String),

    #[error("parse: {0}")]
    Parse(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal: {0}")]
    Internal(String),
}

impl ForemanError {
    /// Stable machine-readable code for the transport boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation",
            Self::Forbidden(_) => "forbidden",
            Self::Preconditions(_) => "preconditions",
            Self::EngineFailure(_) => "engine_failure",
            Self::Parse(_) => "parse",
            Self::Timeout(_) => "timeout",
            Self::Storage(_) => "storage",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for ForemanError {
    fn from(err: std::io::Error) -> Self {
        ForemanError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ForemanError {
    fn from(err: serde_json::Error) -> Self {
        ForemanError::Internal(format!("json: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, ForemanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ForemanError::NotFound("x".into()).code(), "not_found");
        assert_eq!(ForemanError::Forbidden("x".into()).code(), "forbidden");
        assert_eq!(ForemanError::Cancelled.code(), "cancelled");
    }
}
