//! Shared domain types.
//!
//! Identity throughout the system is the bulk-tier path (`original_path`);
//! every tracker and component indexes by it.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a cached file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheSource {
    OnDeck,
    ContinueWatching,
    Watchlist,
    TraktTrending,
    ActiveWatching,
    Manual,
    Unknown,
}

impl Default for CacheSource {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for CacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OnDeck => "on-deck",
            Self::ContinueWatching => "continue-watching",
            Self::Watchlist => "watchlist",
            Self::TraktTrending => "trakt-trending",
            Self::ActiveWatching => "active-watching",
            Self::Manual => "manual",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// How files are placed on the cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMethod {
    /// Move the file; only the cache copy exists afterwards.
    Move,
    /// Copy the file; both copies exist.
    Copy,
    /// Move, then leave a symlink at the original path.
    MoveWithSymlink,
}

impl Default for CacheMethod {
    fn default() -> Self {
        Self::MoveWithSymlink
    }
}

/// Episode position of a cached TV file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeInfo {
    pub show: String,
    pub season: i32,
    pub episode: i32,
    #[serde(default)]
    pub is_current_ondeck: bool,
    /// Distance from the current on-deck episode (0 = current).
    #[serde(default)]
    pub episodes_ahead: u32,
}

/// Playback state reported by the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Playing,
    Paused,
    Buffering,
}

impl PlaybackState {
    /// Map an upstream state string; anything unrecognized counts as buffering.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "playing" => Self::Playing,
            "paused" => Self::Paused,
            _ => Self::Buffering,
        }
    }
}

/// One active playback session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_key: String,
    pub user_id: String,
    pub username: String,
    pub file_path: PathBuf,
    pub state: PlaybackState,
    pub view_offset_ms: u64,
    pub duration_ms: u64,
}

impl Session {
    /// Fraction watched, 0.0–1.0.
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        (self.view_offset_ms as f64 / self.duration_ms as f64).clamp(0.0, 1.0)
    }
}

/// One item discovered as on deck.
#[derive(Debug, Clone)]
pub struct OnDeckItem {
    pub file_path: PathBuf,
    pub username: String,
    pub title: String,
    pub is_current_ondeck: bool,
    pub episode_info: Option<EpisodeInfo>,
}

/// One watchlist title resolved to a library file.
#[derive(Debug, Clone)]
pub struct WatchlistItem {
    pub file_path: PathBuf,
    pub username: String,
    pub title: String,
    pub added_at: Option<DateTime<Utc>>,
}

/// Outcome of a single file transfer.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub dest_path: PathBuf,
    pub bytes_transferred: u64,
}

/// Result of one cache cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    pub ondeck_items: usize,
    pub watchlist_items: usize,
    pub trakt_items: usize,
    pub transferred: usize,
    pub bytes_transferred: u64,
    pub restored: usize,
    pub bytes_restored: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eviction: Option<EvictionResult>,
    pub duration_seconds: f64,
    pub errors: Vec<String>,
}

/// Result of a limit-enforcement pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictionResult {
    pub needed: bool,
    pub performed: bool,
    pub files_evicted: usize,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
}

/// Result of a reconciliation sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationResult {
    pub files_checked: usize,
    pub orphaned_found: usize,
    pub stale_removed: usize,
    /// Files on the cache tier with no tracker entry. Reported, never removed.
    pub untracked_found: Vec<PathBuf>,
    pub errors: Vec<String>,
}

/// Coarse cache pressure bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheHealth {
    Healthy,
    Moderate,
    Warning,
    Critical,
}

/// Aggregated cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_size_bytes: u64,
    pub limit_bytes: u64,
    pub used_percent: f64,
    pub file_count: usize,
    pub ondeck_count: usize,
    pub ondeck_bytes: u64,
    pub watchlist_count: usize,
    pub watchlist_bytes: u64,
    pub trakt_count: usize,
    pub trakt_bytes: u64,
    pub active_watching_count: usize,
    pub active_watching_bytes: u64,
    pub other_count: usize,
    pub other_bytes: u64,
    pub active_sessions: usize,
    pub tracked_entries: usize,
    pub health: CacheHealth,
}

impl Default for CacheStats {
    fn default() -> Self {
        Self {
            total_size_bytes: 0,
            limit_bytes: 0,
            used_percent: 0.0,
            file_count: 0,
            ondeck_count: 0,
            ondeck_bytes: 0,
            watchlist_count: 0,
            watchlist_bytes: 0,
            trakt_count: 0,
            trakt_bytes: 0,
            active_watching_count: 0,
            active_watching_bytes: 0,
            other_count: 0,
            other_bytes: 0,
            active_sessions: 0,
            tracked_entries: 0,
            health: CacheHealth::Healthy,
        }
    }
}

impl CacheStats {
    /// Health band from used percentage: 75 / 90 / 95.
    #[must_use]
    pub fn health_for(used_percent: f64) -> CacheHealth {
        if used_percent >= 95.0 {
            CacheHealth::Critical
        } else if used_percent >= 90.0 {
            CacheHealth::Warning
        } else if used_percent >= 75.0 {
            CacheHealth::Moderate
        } else {
            CacheHealth::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_source_serializes_kebab_case() {
        let s = serde_json::to_string(&CacheSource::OnDeck).expect("serialize");
        assert_eq!(s, "\"on-deck\"");
        let s = serde_json::to_string(&CacheSource::TraktTrending).expect("serialize");
        assert_eq!(s, "\"trakt-trending\"");
        let back: CacheSource = serde_json::from_str("\"active-watching\"").expect("parse");
        assert_eq!(back, CacheSource::ActiveWatching);
    }

    #[test]
    fn session_progress_clamps() {
        let mut session = Session {
            session_key: "1".into(),
            user_id: "u".into(),
            username: "alice".into(),
            file_path: PathBuf::from("/bulk/a.mkv"),
            state: PlaybackState::Playing,
            view_offset_ms: 90,
            duration_ms: 100,
        };
        assert!((session.progress() - 0.9).abs() < f64::EPSILON);
        session.duration_ms = 0;
        assert_eq!(session.progress(), 0.0);
        session.duration_ms = 50;
        assert_eq!(session.progress(), 1.0);
    }

    #[test]
    fn health_bands() {
        assert_eq!(CacheStats::health_for(10.0), CacheHealth::Healthy);
        assert_eq!(CacheStats::health_for(80.0), CacheHealth::Moderate);
        assert_eq!(CacheStats::health_for(92.0), CacheHealth::Warning);
        assert_eq!(CacheStats::health_for(97.0), CacheHealth::Critical);
    }
}
