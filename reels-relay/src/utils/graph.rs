//! Graph API wire helpers shared by identity resolution and publishing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default Graph API root, including the API version.
pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.facebook.com/v18.0";

/// Message recorded when an error response carries no readable message.
pub const UNKNOWN_API_ERROR: &str = "Unknown error";

/// Graph API endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_base_url() -> String {
    DEFAULT_GRAPH_BASE_URL.to_string()
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

impl GraphConfig {
    /// Join `path` onto the base URL.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// A failed Graph API call.
///
/// Messages never include request URLs, which carry access tokens.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Graph API returned {status}: {message}")]
    Api {
        status: u16,
        message: String,
        code: Option<i64>,
    },

    #[error("Request timed out")]
    Timeout,

    #[error("Connection reset")]
    ConnectionReset,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GraphError {
    /// Build from a non-success response body.
    pub fn from_body(status: u16, body: &str) -> Self {
        let detail = serde_json::from_str::<ErrorEnvelope>(body)
            .ok()
            .and_then(|envelope| envelope.error);

        Self::Api {
            status,
            message: detail
                .as_ref()
                .and_then(|d| d.message.clone())
                .unwrap_or_else(|| UNKNOWN_API_ERROR.to_string()),
            code: detail.and_then(|d| d.code),
        }
    }

    /// HTTP status, when the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Check if this error is transient and may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::ConnectionReset | Self::Network(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::InvalidResponse(_) | Self::Io(_) => false,
        }
    }
}

impl From<reqwest::Error> for GraphError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::Timeout;
        }
        if is_connection_reset(&error) {
            return Self::ConnectionReset;
        }
        if error.is_decode() {
            return Self::InvalidResponse(error.without_url().to_string());
        }
        Self::Network(error.without_url().to_string())
    }
}

fn is_connection_reset(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = error.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
            ) {
                return true;
            }
        }
        source = err.source();
    }
    false
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: Option<String>,
    code: Option<i64>,
}

/// `{"id": "..."}` responses.
#[derive(Debug, Clone, Deserialize)]
pub struct IdResponse {
    pub id: String,
}

/// Read a response body as JSON, mapping non-success statuses to [`GraphError::Api`].
pub async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, GraphError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(GraphError::from_body(status.as_u16(), &body));
    }

    serde_json::from_str(&body).map_err(|e| GraphError::InvalidResponse(e.to_string()))
}
