//! Typed error kinds surfaced by the engine.

/// Errors surfaced by assignment, lifecycle, ledger, and dispatch
/// operations.
///
/// `Conflict` is retried internally by the store helpers and only reaches
/// callers once the retry budget is exhausted. Everything else propagates
/// directly.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("serialization conflict, retry budget exhausted")]
    Conflict,

    #[error("operation cancelled")]
    Cancelled,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn forbidden(why: impl Into<String>) -> Self {
        Self::Forbidden(why.into())
    }

    pub fn invalid_state(why: impl Into<String>) -> Self {
        Self::InvalidState(why.into())
    }

    /// Whether this error is a PostgreSQL serialization failure
    /// (SQLSTATE 40001) or deadlock (40P01) hiding somewhere in the
    /// chain, i.e. worth retrying on a fresh transaction.
    pub fn is_serialization_conflict(&self) -> bool {
        let Self::Other(inner) = self else {
            return false;
        };
        inner.chain().any(|cause| {
            cause
                .downcast_ref::<sqlx::Error>()
                .is_some_and(sqlx_error_is_conflict)
        })
    }
}

/// Check a raw sqlx error for the retryable SQLSTATEs.
pub(crate) fn sqlx_error_is_conflict(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "40001" || code == "40P01")
}
