use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    #[error("Invalid move: {0}")]
    InvalidMove(String),

    #[error("Missing security context: {0}")]
    MissingContext(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ScopeError {
    /// True for failures of the underlying store, which callers may retry.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, ScopeError::Store(_) | ScopeError::StoreUnavailable(_))
    }
}

impl From<ScopeError> for AppError {
    fn from(err: ScopeError) -> Self {
        match err {
            ScopeError::Store(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ScopeError::StoreUnavailable(e) => AppError::DatabaseError(anyhow::anyhow!(e)),
            ScopeError::InvalidGrant(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ScopeError::InvalidMove(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ScopeError::MissingContext(e) => AppError::Unauthorized(anyhow::anyhow!(e)),
            ScopeError::Internal(e) => AppError::InternalError(e),
        }
    }
}
