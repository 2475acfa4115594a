//! Plex Client Error Types

use thiserror::Error;

/// Maximum response body size accepted from the server (16 MiB).
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum PlexError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error {status} for {url}")]
    Http { status: reqwest::StatusCode, url: String },

    #[error("API error: {0}")]
    Api(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),
}

/// Check HTTP response status before processing the body.
pub fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, PlexError> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(PlexError::Auth(format!("{status} for {}", resp.url())));
    }
    if status.is_client_error() || status.is_server_error() {
        return Err(PlexError::Http {
            status,
            url: resp.url().to_string(),
        });
    }
    Ok(resp)
}

/// Deserialize a JSON body with a size cap.
pub async fn json_with_limit<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, PlexError> {
    if let Some(len) = resp.content_length() {
        if len as usize > MAX_BODY_BYTES {
            return Err(PlexError::Parse(format!("Response body too large: {len} bytes")));
        }
    }
    let bytes = resp.bytes().await?;
    if bytes.len() > MAX_BODY_BYTES {
        return Err(PlexError::Parse(format!(
            "Response body too large: {} bytes",
            bytes.len()
        )));
    }
    serde_json::from_slice(&bytes).map_err(Into::into)
}

impl From<reqwest::Error> for PlexError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<serde_json::Error> for PlexError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<reqwest::header::InvalidHeaderValue> for PlexError {
    fn from(err: reqwest::header::InvalidHeaderValue) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}
