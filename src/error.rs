use studysync_api_types::ApiErrorBody;
use thiserror::Error;

use crate::transport::TransportError;

/// Failures surfaced by the query, mutation and session layers.
///
/// Values are cloned to every caller attached to a shared in-flight fetch,
/// so the variants only carry owned text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("network unreachable: {message}")]
    NetworkUnreachable { message: String },
    #[error("unauthorized (HTTP 401)")]
    Unauthorized { body: String },
    #[error("server error (HTTP {status}): {body}")]
    ServerError { status: u16, body: String },
    #[error("response body could not be decoded: {message}")]
    ParseFailure { message: String },
    #[error("session mismatch: {detail}")]
    SessionMismatch { detail: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl SyncError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkUnreachable {
            message: message.into(),
        }
    }

    pub fn server(status: u16, body: impl Into<String>) -> Self {
        Self::ServerError {
            status,
            body: body.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::ParseFailure {
            message: message.into(),
        }
    }

    pub fn session_mismatch(detail: impl Into<String>) -> Self {
        Self::SessionMismatch {
            detail: detail.into(),
        }
    }

    /// Failures the retry policy may repeat.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnreachable { .. } | Self::ServerError { .. }
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized { .. } => Some(401),
            Self::ServerError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Human-readable reason, preferring the API's own error envelope.
    pub fn message(&self) -> String {
        match self {
            Self::Unauthorized { body } | Self::ServerError { body, .. } => {
                match ApiErrorBody::parse(body) {
                    Some(parsed) => parsed.reason().unwrap_or_default().to_string(),
                    None if body.trim().is_empty() => self.to_string(),
                    None => body.trim().to_string(),
                }
            }
            _ => self.to_string(),
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Unreachable { .. } => Self::network(error.to_string()),
            TransportError::InvalidTarget { .. } => Self::InvalidRequest {
                message: error.to_string(),
            },
        }
    }
}
