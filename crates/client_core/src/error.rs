use reqwest::StatusCode;
use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

/// Nothing here is fatal to the process; callers surface it and move on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{} attachment(s) failed: {reason}", failed_files.len())]
    PartialFailure {
        failed_files: Vec<String>,
        reason: String,
    },
    #[error("server error: {0}")]
    Server(String),
}

impl ClientError {
    pub fn not_logged_in() -> Self {
        Self::Authorization("not logged in".to_string())
    }

    pub fn from_status(status: StatusCode, api_error: Option<ApiError>) -> Self {
        let message = api_error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| status.to_string());
        match api_error.map(|e| e.code) {
            Some(ErrorCode::Validation | ErrorCode::PayloadTooLarge) => Self::Validation(message),
            Some(ErrorCode::Unauthorized | ErrorCode::Forbidden) => Self::Authorization(message),
            Some(ErrorCode::NotFound) => Self::NotFound(message),
            Some(ErrorCode::Internal) => Self::Server(message),
            None => match status {
                StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => {
                    Self::Validation(message)
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Authorization(message),
                StatusCode::NOT_FOUND => Self::NotFound(message),
                _ => Self::Server(message),
            },
        }
    }

    /// Only failures that never reached the application are worth resending.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::from_status(status, None),
            None if err.is_decode() => Self::Server(err.to_string()),
            None => Self::Transport(err.to_string()),
        }
    }
}
