//! Plex adapter for the `MediaServer` trait.
//!
//! Wraps the pure HTTP `PlexClient` and performs the discovery logic that
//! needs library lookups: per-user on-deck fans out through home-user token
//! switches, episodes expand to the configured look-ahead, and watchlist
//! titles resolve to concrete library files.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::RwLock;

use tiercache_providers::plex::{Metadata, PlexClient, PlexError};
use tiercache_providers::trakt::TraktClient;

use super::{MediaServer, UpstreamError};
use crate::models::{EpisodeInfo, OnDeckItem, PlaybackState, Session, WatchlistItem};

const MAIN_USERNAME: &str = "Main";

impl From<PlexError> for UpstreamError {
    fn from(err: PlexError) -> Self {
        match err {
            PlexError::Parse(e) => Self::Invalid(e),
            other => Self::Request(other.to_string()),
        }
    }
}

/// A Plex server (plus optional Trakt) seen through the upstream contract.
pub struct PlexMediaServer {
    client: PlexClient,
    /// Library section IDs to process; empty = all.
    library_sections: Vec<i64>,
    trakt: Option<TraktClient>,
    /// Home-user tokens, keyed by user uuid. Tokens are stable for the
    /// lifetime of the process.
    user_tokens: RwLock<HashMap<String, String>>,
}

impl PlexMediaServer {
    #[must_use]
    pub fn new(client: PlexClient, library_sections: Vec<i64>) -> Self {
        Self {
            client,
            library_sections,
            trakt: None,
            user_tokens: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_trakt(mut self, trakt: TraktClient) -> Self {
        self.trakt = Some(trakt);
        self
    }

    fn section_allowed(&self, section_id: Option<i64>) -> bool {
        if self.library_sections.is_empty() {
            return true;
        }
        section_id.is_some_and(|id| self.library_sections.contains(&id))
    }

    async fn user_client(&self, uuid: &str) -> Result<PlexClient, PlexError> {
        if let Some(token) = self.user_tokens.read().await.get(uuid) {
            return Ok(self.client.with_token(token.clone()));
        }
        let token = self.client.switch_user_token(uuid).await?;
        self.user_tokens
            .write()
            .await
            .insert(uuid.to_string(), token.clone());
        Ok(self.client.with_token(token))
    }

    /// On-deck items of a single account.
    async fn user_ondeck(
        &self,
        client: &PlexClient,
        username: &str,
        episodes_ahead: u32,
        days_to_monitor: u32,
    ) -> Result<Vec<OnDeckItem>, PlexError> {
        let mut items = Vec::new();
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days_to_monitor));

        for metadata in client.on_deck().await? {
            if !self.section_allowed(metadata.library_section_id) {
                continue;
            }
            if let Some(last_viewed) = metadata.last_viewed_at.and_then(unix_to_datetime) {
                if last_viewed < cutoff {
                    continue;
                }
            }

            match metadata.media_type.as_str() {
                "episode" => {
                    items.extend(self.expand_episode(client, &metadata, username, episodes_ahead).await);
                }
                "movie" => {
                    if let Some(file) = metadata.first_file() {
                        items.push(OnDeckItem {
                            file_path: PathBuf::from(file),
                            username: username.to_string(),
                            title: metadata.title.clone(),
                            is_current_ondeck: true,
                            episode_info: None,
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(items)
    }

    /// The on-deck episode plus the next `episodes_ahead` episodes of the
    /// same show.
    async fn expand_episode(
        &self,
        client: &PlexClient,
        current: &Metadata,
        username: &str,
        episodes_ahead: u32,
    ) -> Vec<OnDeckItem> {
        let show = current.grandparent_title.clone().unwrap_or_default();
        let (season, episode) = match (current.parent_index, current.index) {
            (Some(season), Some(episode)) => (season, episode),
            _ => return Vec::new(),
        };

        let mut items = Vec::new();
        if let Some(file) = current.first_file() {
            items.push(OnDeckItem {
                file_path: PathBuf::from(file),
                username: username.to_string(),
                title: format!("{show} - {}", current.title),
                is_current_ondeck: true,
                episode_info: Some(EpisodeInfo {
                    show: show.clone(),
                    season,
                    episode,
                    is_current_ondeck: true,
                    episodes_ahead: 0,
                }),
            });
        }

        if episodes_ahead == 0 {
            return items;
        }
        let Some(show_key) = current.grandparent_rating_key.as_deref() else {
            return items;
        };
        let mut leaves = match client.show_episodes(show_key).await {
            Ok(leaves) => leaves,
            Err(e) => {
                tracing::warn!(show = %show, error = %e, "Could not fetch next episodes");
                return items;
            }
        };
        leaves.sort_by_key(|m| (m.parent_index, m.index));

        let mut ahead: u32 = 0;
        for leaf in leaves {
            let (Some(leaf_season), Some(leaf_episode)) = (leaf.parent_index, leaf.index) else {
                continue;
            };
            let is_after = leaf_season > season || (leaf_season == season && leaf_episode > episode);
            if !is_after {
                continue;
            }
            if ahead >= episodes_ahead {
                break;
            }
            ahead += 1;
            if let Some(file) = leaf.first_file() {
                items.push(OnDeckItem {
                    file_path: PathBuf::from(file),
                    username: username.to_string(),
                    title: format!("{show} - {}", leaf.title),
                    is_current_ondeck: false,
                    episode_info: Some(EpisodeInfo {
                        show: show.clone(),
                        season: leaf_season,
                        episode: leaf_episode,
                        is_current_ondeck: false,
                        episodes_ahead: ahead,
                    }),
                });
            }
        }
        items
    }

    /// Resolve one watchlist title to library files.
    async fn resolve_title(
        &self,
        title: &str,
        media_type: &str,
        username: &str,
        added_at: Option<DateTime<Utc>>,
        episodes_per_show: u32,
    ) -> Vec<WatchlistItem> {
        let sections = match self.client.library_sections().await {
            Ok(sections) => sections,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list library sections");
                return Vec::new();
            }
        };

        let mut items = Vec::new();
        for section in sections {
            if section.section_type != media_type_to_section(media_type) {
                continue;
            }
            if !self.section_allowed(section.key.parse().ok()) {
                continue;
            }
            let matches = match self.client.section_items(&section.key, Some(title)).await {
                Ok(matches) => matches,
                Err(e) => {
                    tracing::warn!(section = %section.title, error = %e, "Library search failed");
                    continue;
                }
            };

            for found in matches {
                if media_type == "show" {
                    items.extend(
                        self.unwatched_episodes(&found, username, added_at, episodes_per_show)
                            .await,
                    );
                } else {
                    for file in found.all_files() {
                        items.push(WatchlistItem {
                            file_path: PathBuf::from(file),
                            username: username.to_string(),
                            title: title.to_string(),
                            added_at,
                        });
                    }
                }
            }
        }
        items
    }

    /// First `episodes_per_show` unwatched episodes, chronological order.
    async fn unwatched_episodes(
        &self,
        show: &Metadata,
        username: &str,
        added_at: Option<DateTime<Utc>>,
        episodes_per_show: u32,
    ) -> Vec<WatchlistItem> {
        let mut leaves = match self.client.show_episodes(&show.rating_key).await {
            Ok(leaves) => leaves,
            Err(e) => {
                tracing::warn!(show = %show.title, error = %e, "Could not fetch show episodes");
                return Vec::new();
            }
        };
        leaves.sort_by_key(|m| (m.parent_index, m.index));

        let mut items = Vec::new();
        for leaf in leaves {
            if items.len() as u32 >= episodes_per_show {
                break;
            }
            if leaf.view_count.unwrap_or(0) > 0 {
                continue;
            }
            if let Some(file) = leaf.first_file() {
                items.push(WatchlistItem {
                    file_path: PathBuf::from(file),
                    username: username.to_string(),
                    title: format!("{} - {}", show.title, leaf.title),
                    added_at,
                });
            }
        }
        items
    }

    async fn account_watchlist(
        &self,
        client: &PlexClient,
        username: &str,
        episodes_per_show: u32,
    ) -> Result<Vec<WatchlistItem>, PlexError> {
        let mut items = Vec::new();
        for entry in client.watchlist().await? {
            let added_at = entry.added_at.and_then(unix_to_datetime);
            items.extend(
                self.resolve_title(
                    &entry.title,
                    &entry.media_type,
                    username,
                    added_at,
                    episodes_per_show,
                )
                .await,
            );
        }
        Ok(items)
    }
}

#[async_trait]
impl MediaServer for PlexMediaServer {
    async fn list_ondeck(
        &self,
        episodes_ahead: u32,
        days_to_monitor: u32,
        skip_users: Vec<String>,
    ) -> Result<Vec<OnDeckItem>, UpstreamError> {
        let mut items = self
            .user_ondeck(&self.client, MAIN_USERNAME, episodes_ahead, days_to_monitor)
            .await?;

        match self.client.home_users().await {
            Ok(users) => {
                for user in users {
                    if user.admin || skip_users.iter().any(|s| s == &user.title) {
                        continue;
                    }
                    match self.user_client(&user.uuid).await {
                        Ok(client) => {
                            match self
                                .user_ondeck(&client, &user.title, episodes_ahead, days_to_monitor)
                                .await
                            {
                                Ok(user_items) => items.extend(user_items),
                                Err(e) => {
                                    tracing::warn!(user = %user.title, error = %e, "Could not get on-deck for user");
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(user = %user.title, error = %e, "Could not switch to user");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not list home users");
            }
        }

        Ok(items)
    }

    async fn list_watchlist(
        &self,
        episodes_per_show: u32,
        skip_users: Vec<String>,
    ) -> Result<Vec<WatchlistItem>, UpstreamError> {
        let mut items = self
            .account_watchlist(&self.client, MAIN_USERNAME, episodes_per_show)
            .await?;

        match self.client.home_users().await {
            Ok(users) => {
                for user in users {
                    if user.admin || skip_users.iter().any(|s| s == &user.title) {
                        continue;
                    }
                    match self.user_client(&user.uuid).await {
                        Ok(client) => match self
                            .account_watchlist(&client, &user.title, episodes_per_show)
                            .await
                        {
                            Ok(user_items) => items.extend(user_items),
                            Err(e) => {
                                tracing::warn!(user = %user.title, error = %e, "Could not get watchlist for user");
                            }
                        },
                        Err(e) => {
                            tracing::warn!(user = %user.title, error = %e, "Could not switch to user");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not list home users");
            }
        }

        Ok(items)
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, UpstreamError> {
        let mut sessions = Vec::new();
        for metadata in self.client.sessions().await? {
            let Some(file) = metadata.first_file() else {
                continue;
            };
            let (user_id, username) = metadata
                .user
                .as_ref()
                .map_or(("unknown".to_string(), "Unknown".to_string()), |u| {
                    (u.id.clone(), u.title.clone())
                });
            sessions.push(Session {
                session_key: metadata
                    .session_key
                    .clone()
                    .unwrap_or_else(|| metadata.rating_key.clone()),
                user_id,
                username,
                file_path: PathBuf::from(file),
                state: metadata
                    .player
                    .as_ref()
                    .map_or(PlaybackState::Buffering, |p| PlaybackState::parse(&p.state)),
                view_offset_ms: metadata.view_offset.unwrap_or(0),
                duration_ms: metadata.duration.unwrap_or(0),
            });
        }
        Ok(sessions)
    }

    async fn list_watched_files(
        &self,
        library_sections: Vec<i64>,
    ) -> Result<Vec<PathBuf>, UpstreamError> {
        let wanted = if library_sections.is_empty() {
            self.library_sections.clone()
        } else {
            library_sections
        };

        let mut watched = Vec::new();
        for section in self.client.library_sections().await? {
            let section_id: Option<i64> = section.key.parse().ok();
            if !wanted.is_empty() && !section_id.is_some_and(|id| wanted.contains(&id)) {
                continue;
            }
            let items = match self.client.section_items(&section.key, None).await {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(section = %section.title, error = %e, "Could not list section");
                    continue;
                }
            };
            match section.section_type.as_str() {
                "movie" => {
                    for item in items {
                        if item.view_count.unwrap_or(0) > 0 {
                            watched.extend(item.all_files().into_iter().map(PathBuf::from));
                        }
                    }
                }
                "show" => {
                    for show in items {
                        let leaves = match self.client.show_episodes(&show.rating_key).await {
                            Ok(leaves) => leaves,
                            Err(e) => {
                                tracing::warn!(show = %show.title, error = %e, "Could not list episodes");
                                continue;
                            }
                        };
                        for leaf in leaves {
                            if leaf.view_count.unwrap_or(0) > 0 {
                                watched.extend(leaf.all_files().into_iter().map(PathBuf::from));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(watched)
    }

    async fn has_active_sessions(&self) -> Result<bool, UpstreamError> {
        Ok(!self.client.sessions().await?.is_empty())
    }

    async fn list_trending(&self, count: usize) -> Result<Vec<WatchlistItem>, UpstreamError> {
        let Some(trakt) = &self.trakt else {
            return Ok(Vec::new());
        };
        let trending = trakt
            .trending_movies(count)
            .await
            .map_err(|e| UpstreamError::Request(e.to_string()))?;

        let mut items = Vec::new();
        for movie in trending {
            // Trending entries carry no user: they are a server-wide hint.
            items.extend(self.resolve_title(&movie.title, "movie", "", None, 0).await);
        }
        Ok(items)
    }
}

impl std::fmt::Debug for PlexMediaServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlexMediaServer")
            .field("library_sections", &self.library_sections)
            .field("trakt", &self.trakt.is_some())
            .finish()
    }
}

fn media_type_to_section(media_type: &str) -> &str {
    match media_type {
        "show" | "episode" => "show",
        _ => "movie",
    }
}

fn unix_to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}
