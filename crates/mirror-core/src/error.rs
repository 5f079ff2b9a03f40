use thiserror::Error;

/// Errors produced by the mobilemirror service layer.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("external tool failed: {0}")]
    Tool(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl MirrorError {
    /// Short machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            MirrorError::InvalidRequest(_) => "INVALID_REQUEST",
            MirrorError::NotFound(_) => "NOT_FOUND",
            MirrorError::PermissionDenied(_) => "PERMISSION_DENIED",
            MirrorError::Unauthorized => "UNAUTHORIZED",
            MirrorError::RateLimited(_) => "RATE_LIMITED",
            MirrorError::Tool(_) => "TOOL_FAILED",
            MirrorError::Timeout(_) => "TIMEOUT",
            MirrorError::Io(_) => "IO_ERROR",
            MirrorError::Other(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(e: serde_json::Error) -> Self {
        MirrorError::InvalidRequest(e.to_string())
    }
}

pub type MirrorResult<T> = Result<T, MirrorError>;
