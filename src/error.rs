//! Error taxonomy shared by every service in the crate.
//!
//! Domain operations return [`RagResult`]; the CLI wraps these in `anyhow`
//! and the HTTP layer maps [`RagError::code`] onto status codes.

use thiserror::Error;

pub type RagResult<T> = Result<T, RagError>;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{0}")]
    Validation(String),

    #[error("tenant is not active: {0}")]
    TenantInactive(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Embedding or generation provider failure.
    #[error("upstream provider error: {0}")]
    Upstream(String),

    #[error("{0}")]
    Processing(String),

    /// A query failed after it was assigned `request_id`; the cause is in the
    /// log line carrying the same id.
    #[error("failed to process query (request {request_id})")]
    QueryFailed { request_id: String },

    #[error("database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RagError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        RagError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        RagError::Validation(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        RagError::Upstream(message.into())
    }

    /// Stable machine-readable code used in error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::NotFound { .. } => "not_found",
            RagError::Validation(_) => "bad_request",
            RagError::TenantInactive(_) => "tenant_inactive",
            RagError::LimitExceeded(_) => "limit_exceeded",
            RagError::Upstream(_) => "upstream_error",
            RagError::Processing(_) | RagError::QueryFailed { .. } => "processing_failed",
            RagError::Storage(_)
            | RagError::Serialization(_)
            | RagError::Io(_)
            | RagError::Other(_) => "internal",
        }
    }

    /// Correlation id already assigned to the failed operation, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            RagError::QueryFailed { request_id } => Some(request_id),
            _ => None,
        }
    }

    /// Client-side errors are not worth retrying.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RagError::NotFound { .. }
                | RagError::Validation(_)
                | RagError::TenantInactive(_)
                | RagError::LimitExceeded(_)
        )
    }
}
