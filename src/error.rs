use thiserror::Error;

/// Operation failures surfaced to the caller. Persistence failures abort the
/// enclosing database transaction, leaving no partial state.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

pub type AppResult<T> = Result<T, AppError>;
