use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::SyncError;
use crate::transport::ApiResponse;

/// Decoded body of a response as stored in the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
    /// Cached absence: an absorbed 401 or a response without a body.
    Empty,
}

impl Payload {
    /// Decode a successful response without ever failing.
    ///
    /// A body that claims to be JSON but does not parse is recorded as a
    /// parse failure and kept as raw text.
    pub fn from_response(response: &ApiResponse) -> Self {
        match Self::decode_strict(response) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    status = response.status,
                    error = %err,
                    "Response declared JSON but did not parse; keeping raw text"
                );
                Self::Text(response.text())
            }
        }
    }

    /// Decode a response, reporting a declared-JSON body that does not parse.
    ///
    /// Undeclared bodies get a best-effort JSON parse and fall back to text.
    pub fn decode_strict(response: &ApiResponse) -> Result<Self, SyncError> {
        if response.body.is_empty() {
            return Ok(Self::Empty);
        }

        if response.declares_json() {
            return serde_json::from_slice(&response.body)
                .map(Self::Json)
                .map_err(|err| SyncError::parse(err.to_string()));
        }

        let text = response.text();
        Ok(serde_json::from_str(&text)
            .map(Self::Json)
            .unwrap_or(Self::Text(text)))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Deserialize a JSON payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SyncError> {
        match self {
            Self::Json(value) => {
                T::deserialize(value).map_err(|err| SyncError::parse(err.to_string()))
            }
            Self::Text(_) => Err(SyncError::parse("payload is plain text, not JSON")),
            Self::Empty => Err(SyncError::parse("payload is empty")),
        }
    }
}
