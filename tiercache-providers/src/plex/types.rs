//! Plex API Data Structures
//!
//! Field names follow the Plex JSON wire format; everything tiercache does
//! not consume is left out.

use serde::Deserialize;

/// Top-level wrapper every Plex server response uses.
#[derive(Debug, Deserialize)]
pub struct MediaContainerResponse {
    #[serde(rename = "MediaContainer")]
    pub media_container: MediaContainer,
}

#[derive(Debug, Default, Deserialize)]
pub struct MediaContainer {
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "machineIdentifier", default)]
    pub machine_identifier: Option<String>,
    #[serde(rename = "friendlyName", default)]
    pub friendly_name: Option<String>,
    #[serde(rename = "Metadata", default)]
    pub metadata: Vec<Metadata>,
    #[serde(rename = "Directory", default)]
    pub directories: Vec<SectionDirectory>,
}

/// One library or session item.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Metadata {
    #[serde(rename = "ratingKey", default)]
    pub rating_key: String,
    #[serde(default)]
    pub key: String,
    #[serde(rename = "type", default)]
    pub media_type: String,
    #[serde(default)]
    pub title: String,
    /// Show title for episodes.
    #[serde(rename = "grandparentTitle", default)]
    pub grandparent_title: Option<String>,
    #[serde(rename = "grandparentRatingKey", default)]
    pub grandparent_rating_key: Option<String>,
    /// Season number for episodes.
    #[serde(rename = "parentIndex", default)]
    pub parent_index: Option<i32>,
    /// Episode number for episodes.
    #[serde(default)]
    pub index: Option<i32>,
    #[serde(rename = "librarySectionID", default)]
    pub library_section_id: Option<i64>,
    #[serde(rename = "viewCount", default)]
    pub view_count: Option<u32>,
    #[serde(rename = "viewOffset", default)]
    pub view_offset: Option<u64>,
    #[serde(default)]
    pub duration: Option<u64>,
    /// Unix seconds of the last playback of this item.
    #[serde(rename = "lastViewedAt", default)]
    pub last_viewed_at: Option<i64>,
    /// Unix seconds the item was added (watchlist responses).
    #[serde(rename = "addedAt", default)]
    pub added_at: Option<i64>,
    #[serde(rename = "sessionKey", default)]
    pub session_key: Option<String>,
    #[serde(rename = "User", default)]
    pub user: Option<SessionUser>,
    #[serde(rename = "Player", default)]
    pub player: Option<SessionPlayer>,
    #[serde(rename = "Media", default)]
    pub media: Vec<MediaItem>,
}

impl Metadata {
    /// First on-disk file path of the item, if any.
    #[must_use]
    pub fn first_file(&self) -> Option<&str> {
        self.media
            .iter()
            .flat_map(|m| m.parts.iter())
            .find_map(|p| p.file.as_deref())
    }

    /// All on-disk file paths of the item.
    #[must_use]
    pub fn all_files(&self) -> Vec<&str> {
        self.media
            .iter()
            .flat_map(|m| m.parts.iter())
            .filter_map(|p| p.file.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaItem {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(rename = "Part", default)]
    pub parts: Vec<MediaPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaPart {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// User block on a session item.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionUser {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// Player block on a session item.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionPlayer {
    #[serde(default)]
    pub state: String,
}

/// One library section from `/library/sections`.
#[derive(Debug, Clone, Deserialize)]
pub struct SectionDirectory {
    pub key: String,
    #[serde(rename = "type")]
    pub section_type: String,
    #[serde(default)]
    pub title: String,
}

/// Response of `https://plex.tv/api/v2/home/users`.
#[derive(Debug, Deserialize)]
pub struct HomeUsersResponse {
    #[serde(default)]
    pub users: Vec<HomeUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HomeUser {
    pub id: i64,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub admin: bool,
}

/// Response of the home-user switch endpoint.
#[derive(Debug, Deserialize)]
pub struct SwitchUserResponse {
    #[serde(rename = "authToken")]
    pub auth_token: String,
}
