use axum::http::StatusCode;

/// Failure taxonomy for a single trigger.
#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    #[error("no finalized segments available for merging")]
    NoDataAvailable,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("concatenation failed: {0}")]
    ToolFailure(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("{what} timed out after {secs}s")]
    Timeout { what: &'static str, secs: u64 },

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("encoder is not running: {0}")]
    EncoderDown(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClipError {
    pub fn status(&self) -> StatusCode {
        match self {
            ClipError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
