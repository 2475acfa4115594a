//! On-deck tracker.
//!
//! Ephemeral: cleared at the start of every cycle and refilled from the
//! discovery scan. Holds episode positions used by the scorer.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{no_migration, TrackerFile};
use crate::models::EpisodeInfo;

const TRACKER_FILE: &str = "ondeck_tracker.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnDeckEntry {
    #[serde(default)]
    pub users: Vec<String>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub episode_info: Option<EpisodeInfo>,
}

/// Tracks on-deck items, their users, and episode positions.
#[derive(Debug)]
pub struct OnDeckTracker {
    inner: TrackerFile<OnDeckEntry>,
}

impl OnDeckTracker {
    #[must_use]
    pub fn load(state_dir: &Path) -> Self {
        Self {
            inner: TrackerFile::load(state_dir.join(TRACKER_FILE), "ondeck", no_migration),
        }
    }

    /// Clear all entries at the start of a cycle.
    pub fn clear(&self) {
        self.inner.clear();
        tracing::debug!("Cleared on-deck tracker for new cycle");
    }

    pub fn update(&self, path: &Path, user: &str, episode_info: Option<EpisodeInfo>) {
        let now = Utc::now();
        self.inner.upsert(
            path,
            || OnDeckEntry {
                users: Vec::new(),
                last_seen: now,
                episode_info: None,
            },
            |entry| {
                if !entry.users.iter().any(|u| u == user) {
                    entry.users.push(user.to_string());
                }
                entry.last_seen = now;
                if episode_info.is_some() {
                    entry.episode_info = episode_info;
                }
            },
        );
    }

    pub fn get(&self, path: &Path) -> Option<OnDeckEntry> {
        self.inner.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.inner.contains(path)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn snapshot(&self) -> std::collections::HashMap<PathBuf, OnDeckEntry> {
        self.inner.snapshot()
    }

    #[must_use]
    pub fn user_count(&self, path: &Path) -> usize {
        self.inner.get(path).map_or(0, |e| e.users.len())
    }

    /// Current on-deck (season, episode) positions for a show across all
    /// users, sorted ascending.
    #[must_use]
    pub fn current_positions(&self, show: &str) -> Vec<(i32, i32)> {
        let show_lower = show.to_lowercase();
        let mut positions: Vec<(i32, i32)> = self
            .inner
            .snapshot()
            .values()
            .filter_map(|entry| entry.episode_info.as_ref())
            .filter(|info| info.is_current_ondeck && info.show.to_lowercase() == show_lower)
            .map(|info| (info.season, info.episode))
            .collect();
        positions.sort_unstable();
        positions.dedup();
        positions
    }

    /// Earliest on-deck position for a show.
    #[must_use]
    pub fn earliest_position(&self, show: &str) -> Option<(i32, i32)> {
        self.current_positions(show).into_iter().next()
    }

    /// Remove entries not seen in `max_days` (shorter window than the
    /// watchlist; on-deck data goes stale within a cycle or two).
    pub fn cleanup_stale(&self, max_days: u32) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_days));
        self.inner.retain(|_, entry| entry.last_seen >= cutoff)
    }

    /// Remove rows whose file exists on neither tier.
    pub fn cleanup_missing<F: FnMut(&Path) -> bool>(&self, exists: F) -> usize {
        let mut exists = exists;
        self.inner.retain(|path, _| exists(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn episode(show: &str, season: i32, episode: i32, current: bool) -> EpisodeInfo {
        EpisodeInfo {
            show: show.to_string(),
            season,
            episode,
            is_current_ondeck: current,
            episodes_ahead: 0,
        }
    }

    #[test]
    fn clear_empties_the_tracker() {
        let dir = TempDir::new().expect("tempdir");
        let tracker = OnDeckTracker::load(dir.path());
        tracker.update(Path::new("/bulk/a.mkv"), "alice", None);
        assert_eq!(tracker.len(), 1);
        tracker.clear();
        assert!(tracker.is_empty());

        // The clear is persisted, not just in-memory.
        let reloaded = OnDeckTracker::load(dir.path());
        assert!(reloaded.is_empty());
    }

    #[test]
    fn positions_are_sorted_and_case_insensitive() {
        let dir = TempDir::new().expect("tempdir");
        let tracker = OnDeckTracker::load(dir.path());
        tracker.update(
            Path::new("/bulk/x/s2e1.mkv"),
            "bob",
            Some(episode("Some Show", 2, 1, true)),
        );
        tracker.update(
            Path::new("/bulk/x/s1e5.mkv"),
            "alice",
            Some(episode("some show", 1, 5, true)),
        );
        tracker.update(
            Path::new("/bulk/x/s1e6.mkv"),
            "alice",
            Some(episode("Some Show", 1, 6, false)),
        );

        assert_eq!(tracker.current_positions("SOME SHOW"), vec![(1, 5), (2, 1)]);
        assert_eq!(tracker.earliest_position("Some Show"), Some((1, 5)));
        assert!(tracker.current_positions("Other").is_empty());
    }
}
