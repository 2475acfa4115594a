//! Cache-timestamp tracker.
//!
//! Records when each file landed on the cache tier and why. The cached_at
//! stamp is written exactly once; re-caching a file never resets its age.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TrackerFile;
use crate::models::{CacheMethod, CacheSource, EpisodeInfo};

const TRACKER_FILE: &str = "cache_timestamps.json";

/// One cached file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampEntry {
    pub cached_at: DateTime<Utc>,
    #[serde(default)]
    pub source: CacheSource,
    #[serde(default)]
    pub file_size_bytes: u64,
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    #[serde(default)]
    pub cache_method: Option<CacheMethod>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub watched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub episode_info: Option<EpisodeInfo>,
    #[serde(default)]
    pub access_count: u32,
    /// Subtitle files cached alongside this one; they share its state.
    #[serde(default)]
    pub siblings: Vec<PathBuf>,
}

/// Legacy shape: a bare timestamp string.
fn migrate_legacy(_path: &str, value: &serde_json::Value) -> Option<TimestampEntry> {
    let raw = value.as_str()?;
    let cached_at = DateTime::parse_from_rfc3339(raw).ok()?.with_timezone(&Utc);
    Some(TimestampEntry {
        cached_at,
        source: CacheSource::Unknown,
        file_size_bytes: 0,
        cache_path: None,
        cache_method: None,
        users: Vec::new(),
        last_seen: None,
        watched_at: None,
        episode_info: None,
        access_count: 0,
        siblings: Vec::new(),
    })
}

/// Tracks when files were cached and their source.
///
/// Drives retention (recently cached files are not moved back) and feeds
/// the eviction scorer.
#[derive(Debug)]
pub struct CacheTimestampTracker {
    inner: TrackerFile<TimestampEntry>,
}

impl CacheTimestampTracker {
    #[must_use]
    pub fn load(state_dir: &Path) -> Self {
        Self {
            inner: TrackerFile::load(state_dir.join(TRACKER_FILE), "cache_timestamp", migrate_legacy),
        }
    }

    /// Record a completed transfer. No-op when an entry already exists: the
    /// original cached_at survives any re-cache.
    pub fn record(
        &self,
        path: &Path,
        source: CacheSource,
        file_size_bytes: u64,
        cache_path: PathBuf,
        cache_method: CacheMethod,
        siblings: Vec<PathBuf>,
    ) {
        let entry = TimestampEntry {
            cached_at: Utc::now(),
            source,
            file_size_bytes,
            cache_path: Some(cache_path),
            cache_method: Some(cache_method),
            users: Vec::new(),
            last_seen: Some(Utc::now()),
            watched_at: None,
            episode_info: None,
            access_count: 0,
            siblings,
        };
        if !self.inner.insert_if_absent(path.to_path_buf(), entry) {
            tracing::debug!(path = %path.display(), "Cache timestamp already recorded");
        }
    }

    pub fn get(&self, path: &Path) -> Option<TimestampEntry> {
        self.inner.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.inner.contains(path)
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.inner.remove(path)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn snapshot(&self) -> std::collections::HashMap<PathBuf, TimestampEntry> {
        self.inner.snapshot()
    }

    /// Hours since the file was cached.
    #[must_use]
    pub fn age_hours(&self, path: &Path) -> Option<f64> {
        let entry = self.inner.get(path)?;
        let age = Utc::now().signed_duration_since(entry.cached_at);
        Some(age.num_milliseconds() as f64 / 3_600_000.0)
    }

    /// Whether the file is still inside the given retention window.
    #[must_use]
    pub fn is_within_retention(&self, path: &Path, retention_hours: f64) -> bool {
        self.age_hours(path)
            .is_some_and(|age| age < retention_hours)
    }

    #[must_use]
    pub fn source(&self, path: &Path) -> CacheSource {
        self.inner
            .get(path)
            .map_or(CacheSource::Unknown, |e| e.source)
    }

    /// Discovery scan refresh: merge a user, bump last_seen, and replace
    /// episode info. cached_at and source are untouched.
    pub fn refresh_discovery(&self, path: &Path, user: &str, episode_info: Option<EpisodeInfo>) {
        self.inner.update(path, |entry| {
            if !entry.users.iter().any(|u| u == user) {
                entry.users.push(user.to_string());
            }
            entry.last_seen = Some(Utc::now());
            if episode_info.is_some() {
                entry.episode_info = episode_info;
            }
        });
    }

    /// Set the watched stamp once; later playbacks do not move it.
    pub fn mark_watched(&self, path: &Path) {
        self.inner.update(path, |entry| {
            if entry.watched_at.is_none() {
                entry.watched_at = Some(Utc::now());
            }
        });
    }

    /// Count one playback of a tracked file.
    pub fn record_access(&self, path: &Path) {
        self.inner.update(path, |entry| {
            entry.access_count = entry.access_count.saturating_add(1);
        });
    }

    /// Demote an active-watching entry once its session is gone: the file
    /// was started but not finished, so it scores as continue-watching
    /// rather than holding the active-playback bonus forever.
    pub fn demote_to_continue_watching(&self, path: &Path) {
        self.inner.update(path, |entry| {
            if entry.source == CacheSource::ActiveWatching {
                entry.source = CacheSource::ContinueWatching;
            }
        });
    }

    /// Remove rows whose file exists on neither tier. The caller supplies
    /// the existence check so both tiers can be consulted.
    pub fn cleanup_missing<F: FnMut(&Path, &TimestampEntry) -> bool>(&self, exists: F) -> usize {
        let mut exists = exists;
        let removed = self.inner.retain(|path, entry| exists(path, entry));
        if removed > 0 {
            tracing::info!(removed, "Cleaned up stale timestamp entries");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record_simple(tracker: &CacheTimestampTracker, path: &str, source: CacheSource) {
        tracker.record(
            Path::new(path),
            source,
            1_000,
            PathBuf::from(format!("/cache{path}")),
            CacheMethod::Move,
            Vec::new(),
        );
    }

    #[test]
    fn cached_at_is_written_at_most_once() {
        let dir = TempDir::new().expect("tempdir");
        let tracker = CacheTimestampTracker::load(dir.path());

        record_simple(&tracker, "/bulk/a.mkv", CacheSource::OnDeck);
        let first = tracker.get(Path::new("/bulk/a.mkv")).expect("entry");

        // A re-cache with a different source must not touch the entry.
        record_simple(&tracker, "/bulk/a.mkv", CacheSource::Watchlist);
        let second = tracker.get(Path::new("/bulk/a.mkv")).expect("entry");

        assert_eq!(first.cached_at, second.cached_at);
        assert_eq!(second.source, CacheSource::OnDeck);
    }

    #[test]
    fn age_and_retention() {
        let dir = TempDir::new().expect("tempdir");
        let tracker = CacheTimestampTracker::load(dir.path());
        record_simple(&tracker, "/bulk/a.mkv", CacheSource::OnDeck);

        let age = tracker.age_hours(Path::new("/bulk/a.mkv")).expect("age");
        assert!(age >= 0.0 && age < 0.1);
        assert!(tracker.is_within_retention(Path::new("/bulk/a.mkv"), 1.0));
        assert!(!tracker.is_within_retention(Path::new("/bulk/missing.mkv"), 1.0));
    }

    #[test]
    fn watched_stamp_is_sticky() {
        let dir = TempDir::new().expect("tempdir");
        let tracker = CacheTimestampTracker::load(dir.path());
        record_simple(&tracker, "/bulk/a.mkv", CacheSource::OnDeck);

        tracker.mark_watched(Path::new("/bulk/a.mkv"));
        let first = tracker
            .get(Path::new("/bulk/a.mkv"))
            .and_then(|e| e.watched_at)
            .expect("watched");
        tracker.mark_watched(Path::new("/bulk/a.mkv"));
        let second = tracker
            .get(Path::new("/bulk/a.mkv"))
            .and_then(|e| e.watched_at)
            .expect("watched");
        assert_eq!(first, second);
    }

    #[test]
    fn demotion_only_touches_active_watching_entries() {
        let dir = TempDir::new().expect("tempdir");
        let tracker = CacheTimestampTracker::load(dir.path());
        record_simple(&tracker, "/bulk/live.mkv", CacheSource::ActiveWatching);
        record_simple(&tracker, "/bulk/od.mkv", CacheSource::OnDeck);

        tracker.demote_to_continue_watching(Path::new("/bulk/live.mkv"));
        tracker.demote_to_continue_watching(Path::new("/bulk/od.mkv"));
        tracker.demote_to_continue_watching(Path::new("/bulk/missing.mkv"));

        assert_eq!(
            tracker.source(Path::new("/bulk/live.mkv")),
            CacheSource::ContinueWatching
        );
        assert_eq!(tracker.source(Path::new("/bulk/od.mkv")), CacheSource::OnDeck);
    }

    #[test]
    fn legacy_bare_timestamp_is_migrated() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(
            dir.path().join(TRACKER_FILE),
            br#"{"/bulk/old.mkv": "2024-05-01T10:00:00+00:00"}"#,
        )
        .expect("write");

        let tracker = CacheTimestampTracker::load(dir.path());
        let entry = tracker.get(Path::new("/bulk/old.mkv")).expect("migrated");
        assert_eq!(entry.source, CacheSource::Unknown);
        assert_eq!(entry.cached_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");

        // The rewrite is durable: reload parses it as the current shape.
        let reloaded = CacheTimestampTracker::load(dir.path());
        assert!(reloaded.contains(Path::new("/bulk/old.mkv")));
    }

    #[test]
    fn cleanup_missing_uses_caller_predicate() {
        let dir = TempDir::new().expect("tempdir");
        let tracker = CacheTimestampTracker::load(dir.path());
        record_simple(&tracker, "/bulk/keep.mkv", CacheSource::OnDeck);
        record_simple(&tracker, "/bulk/gone.mkv", CacheSource::OnDeck);

        let removed = tracker.cleanup_missing(|path, _| path.ends_with("keep.mkv"));
        assert_eq!(removed, 1);
        assert!(tracker.contains(Path::new("/bulk/keep.mkv")));
        assert!(!tracker.contains(Path::new("/bulk/gone.mkv")));
    }
}
