//! Trakt.tv HTTP Client
//!
//! Only the trending-movies endpoint is consumed; titles are resolved
//! against the media library by the caller.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

static SHARED_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to build Trakt shared HTTP client")
});

const DEFAULT_API_BASE: &str = "https://api.trakt.tv";

#[derive(Debug, Error)]
pub enum TraktError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error {0}")]
    Http(reqwest::StatusCode),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),
}

impl From<reqwest::Error> for TraktError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<reqwest::header::InvalidHeaderValue> for TraktError {
    fn from(err: reqwest::header::InvalidHeaderValue) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TrendingEntry {
    #[serde(default)]
    watchers: u64,
    movie: TrendingMovieIds,
}

#[derive(Debug, Clone, Deserialize)]
struct TrendingMovieIds {
    #[serde(default)]
    title: String,
    #[serde(default)]
    year: Option<u32>,
}

/// One trending movie.
#[derive(Debug, Clone)]
pub struct TrendingMovie {
    pub title: String,
    pub year: Option<u32>,
    pub watchers: u64,
}

/// Trakt.tv API client.
pub struct TraktClient {
    client_id: String,
    client: Client,
    api_base: String,
}

impl TraktClient {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client: SHARED_CLIENT.clone(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    /// Override the API base URL.
    pub fn set_api_base(&mut self, base: impl Into<String>) {
        self.api_base = base.into().trim_end_matches('/').to_string();
    }

    fn build_headers(&self) -> Result<HeaderMap, TraktError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("trakt-api-version", HeaderValue::from_static("2"));
        headers.insert("trakt-api-key", HeaderValue::from_str(&self.client_id)?);
        Ok(headers)
    }

    /// Currently trending movies, most-watched first.
    pub async fn trending_movies(&self, count: usize) -> Result<Vec<TrendingMovie>, TraktError> {
        let url = format!("{}/movies/trending?limit={count}", self.api_base);
        let response = self
            .client
            .get(&url)
            .headers(self.build_headers()?)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TraktError::Http(status));
        }

        let entries: Vec<TrendingEntry> = response
            .json()
            .await
            .map_err(|e| TraktError::Parse(e.to_string()))?;

        Ok(entries
            .into_iter()
            .map(|e| TrendingMovie {
                title: e.movie.title,
                year: e.movie.year,
                watchers: e.watchers,
            })
            .collect())
    }
}

impl std::fmt::Debug for TraktClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraktClient")
            .field("api_base", &self.api_base)
            .field("client_id", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn trending_movies_parses_titles() {
        let server = MockServer::start().await;
        let body = json!([
            {"watchers": 120, "movie": {"title": "First", "year": 2024}},
            {"watchers": 80, "movie": {"title": "Second", "year": 2023}}
        ]);
        Mock::given(method("GET"))
            .and(path("/movies/trending"))
            .and(header("trakt-api-version", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let mut client = TraktClient::new("abc");
        client.set_api_base(server.uri());
        let movies = client.trending_movies(2).await.expect("trending");
        assert_eq!(movies.len(), 2);
        assert_eq!(movies[0].title, "First");
        assert_eq!(movies[0].watchers, 120);
    }
}
