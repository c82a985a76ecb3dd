use reqwest::StatusCode;
use shared::error::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not connected")]
    NotConnected,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("request failed with status {status}{}", detail.as_ref().map(|e| format!(": {}", e.message)).unwrap_or_default())]
    Rest {
        status: StatusCode,
        detail: Option<ApiError>,
    },
    #[error("request could not reach the server: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl SyncError {
    /// Only failures where no response arrived are worth repeating.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Unreachable(_) | SyncError::Timeout(_))
    }
}
