//! Plex HTTP Client

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;

use super::error::{check_response, json_with_limit, PlexError};
use super::types::{
    HomeUser, HomeUsersResponse, MediaContainer, MediaContainerResponse, Metadata,
    SectionDirectory, SwitchUserResponse,
};

/// URL-encode a string for safe use in query parameters
fn url_encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// Shared HTTP client for all Plex requests (connection pooling).
/// Redirects are disabled to prevent SSRF via redirect to private IPs.
static SHARED_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(10)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("Failed to build Plex shared HTTP client")
});

const X_PLEX_TOKEN: &str = "X-Plex-Token";
const X_PLEX_CLIENT_IDENTIFIER: &str = "X-Plex-Client-Identifier";
const X_PLEX_PRODUCT: &str = "X-Plex-Product";

const DEFAULT_PLEX_TV_BASE: &str = "https://plex.tv";
const DEFAULT_DISCOVER_BASE: &str = "https://discover.provider.plex.tv";

/// Plex HTTP Client
///
/// One instance per (server, token) pair; home users get their own instance
/// via [`PlexClient::with_token`] after a token switch.
#[derive(Clone)]
pub struct PlexClient {
    host: String,
    token: String,
    client: Client,
    plex_tv_base: String,
    discover_base: String,
}

impl PlexClient {
    /// Create a new Plex client (reuses the shared connection pool).
    pub fn new(host: impl Into<String>, token: impl Into<String>) -> Result<Self, PlexError> {
        let host = host.into();
        let host = host.trim_end_matches('/').to_string();
        if host.is_empty() {
            return Err(PlexError::InvalidConfig("Missing Plex host".to_string()));
        }
        Ok(Self {
            host,
            token: token.into(),
            client: SHARED_CLIENT.clone(),
            plex_tv_base: DEFAULT_PLEX_TV_BASE.to_string(),
            discover_base: DEFAULT_DISCOVER_BASE.to_string(),
        })
    }

    /// Derive a client for the same server with a different (home user) token.
    #[must_use]
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            host: self.host.clone(),
            token: token.into(),
            client: self.client.clone(),
            plex_tv_base: self.plex_tv_base.clone(),
            discover_base: self.discover_base.clone(),
        }
    }

    /// Override the plex.tv base URL (home users, token switch).
    pub fn set_plex_tv_base(&mut self, base: impl Into<String>) {
        self.plex_tv_base = base.into().trim_end_matches('/').to_string();
    }

    /// Override the discover base URL (watchlist).
    pub fn set_discover_base(&mut self, base: impl Into<String>) {
        self.discover_base = base.into().trim_end_matches('/').to_string();
    }

    /// Build request headers
    fn build_headers(&self) -> Result<HeaderMap, PlexError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(X_PLEX_TOKEN, HeaderValue::from_str(&self.token)?);
        headers.insert(
            X_PLEX_CLIENT_IDENTIFIER,
            HeaderValue::from_static("tiercache"),
        );
        headers.insert(X_PLEX_PRODUCT, HeaderValue::from_static("tiercache"));
        Ok(headers)
    }

    async fn get_container(&self, url: &str) -> Result<MediaContainer, PlexError> {
        let response = self
            .client
            .get(url)
            .headers(self.build_headers()?)
            .send()
            .await?;
        let response = check_response(response)?;
        let wrapped: MediaContainerResponse = json_with_limit(response).await?;
        Ok(wrapped.media_container)
    }

    /// Server identity; used as the connectivity probe.
    pub async fn identity(&self) -> Result<MediaContainer, PlexError> {
        self.get_container(&format!("{}/identity", self.host)).await
    }

    /// OnDeck items for the account this client's token belongs to.
    pub async fn on_deck(&self) -> Result<Vec<Metadata>, PlexError> {
        let container = self
            .get_container(&format!("{}/library/onDeck", self.host))
            .await?;
        Ok(container.metadata)
    }

    /// Snapshot of active playback sessions.
    pub async fn sessions(&self) -> Result<Vec<Metadata>, PlexError> {
        let container = self
            .get_container(&format!("{}/status/sessions", self.host))
            .await?;
        Ok(container.metadata)
    }

    /// All library sections.
    pub async fn library_sections(&self) -> Result<Vec<SectionDirectory>, PlexError> {
        let container = self
            .get_container(&format!("{}/library/sections", self.host))
            .await?;
        Ok(container.directories)
    }

    /// Items of one section, optionally filtered by title.
    pub async fn section_items(
        &self,
        section_key: &str,
        title: Option<&str>,
    ) -> Result<Vec<Metadata>, PlexError> {
        let mut url = format!(
            "{}/library/sections/{}/all",
            self.host,
            url_encode(section_key)
        );
        if let Some(title) = title {
            url.push_str(&format!("?title={}", url_encode(title)));
        }
        let container = self.get_container(&url).await?;
        Ok(container.metadata)
    }

    /// Every episode of a show, in library order.
    pub async fn show_episodes(&self, show_rating_key: &str) -> Result<Vec<Metadata>, PlexError> {
        let container = self
            .get_container(&format!(
                "{}/library/metadata/{}/allLeaves",
                self.host,
                url_encode(show_rating_key)
            ))
            .await?;
        Ok(container.metadata)
    }

    /// Home users of the account (plex.tv).
    pub async fn home_users(&self) -> Result<Vec<HomeUser>, PlexError> {
        let url = format!("{}/api/v2/home/users", self.plex_tv_base);
        let response = self
            .client
            .get(&url)
            .headers(self.build_headers()?)
            .send()
            .await?;
        let response = check_response(response)?;
        let parsed: HomeUsersResponse = json_with_limit(response).await?;
        Ok(parsed.users)
    }

    /// Obtain a server token for a home user (plex.tv user switch).
    pub async fn switch_user_token(&self, user_uuid: &str) -> Result<String, PlexError> {
        let url = format!(
            "{}/api/v2/home/users/{}/switch",
            self.plex_tv_base,
            url_encode(user_uuid)
        );
        let response = self
            .client
            .post(&url)
            .headers(self.build_headers()?)
            .send()
            .await?;
        let response = check_response(response)?;
        let parsed: SwitchUserResponse = json_with_limit(response).await?;
        if parsed.auth_token.is_empty() {
            return Err(PlexError::Auth(format!("Empty token for user {user_uuid}")));
        }
        Ok(parsed.auth_token)
    }

    /// Watchlist titles of the account this client's token belongs to.
    ///
    /// These are discover items, not library items: they carry no file paths
    /// and must be resolved against the library by title.
    pub async fn watchlist(&self) -> Result<Vec<Metadata>, PlexError> {
        let url = format!(
            "{}/library/sections/watchlist/all",
            self.discover_base
        );
        let container = self.get_container(&url).await?;
        Ok(container.metadata)
    }
}

impl std::fmt::Debug for PlexClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlexClient")
            .field("host", &self.host)
            .field("token", &"<redacted>")
            .finish()
    }
}
