use service_core::error::AppError;
use thiserror::Error;

use crate::services::audit::AuditError;
use crate::services::jwt::TokenError;

/// Failure of a persistence adapter.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Concurrent or stale write; nothing was persisted.
    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum ServiceError {
    /// Uniform authentication failure. The cause is logged where it happens.
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Missing required role: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            StoreError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            StoreError::Unavailable(_) => AppError::ServiceUnavailable,
            StoreError::Corrupt(msg) => AppError::InternalError(anyhow::anyhow!(msg)),
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unauthorized => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid credentials"))
            }
            ServiceError::Forbidden(role) => {
                AppError::Forbidden(anyhow::anyhow!("Missing required role: {}", role))
            }
            ServiceError::NotFound(what) => AppError::NotFound(anyhow::anyhow!(what)),
            ServiceError::Validation(e) => AppError::ValidationError(e),
            ServiceError::Storage(e) => e.into(),
            ServiceError::Audit(AuditError::Store(e)) => e.into(),
            ServiceError::Audit(e) => AppError::InternalError(anyhow::Error::new(e)),
            ServiceError::Token(e) if e.is_configuration() => {
                AppError::ConfigError(anyhow::Error::new(e))
            }
            ServiceError::Token(e) => AppError::InternalError(anyhow::Error::new(e)),
            ServiceError::Cancelled => {
                AppError::InternalError(anyhow::anyhow!("Operation cancelled"))
            }
        }
    }
}
