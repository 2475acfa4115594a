//! Watchlist tracker.
//!
//! Additive: entries accumulate as users watchlist titles and only cleanup
//! removes them. Drives the watchlist retention window.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{no_migration, TrackerFile};

const TRACKER_FILE: &str = "watchlist_tracker.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub users: Vec<String>,
    pub last_seen: DateTime<Utc>,
}

/// Tracks watchlist items and their users.
#[derive(Debug)]
pub struct WatchlistTracker {
    inner: TrackerFile<WatchlistEntry>,
}

impl WatchlistTracker {
    #[must_use]
    pub fn load(state_dir: &Path) -> Self {
        Self {
            inner: TrackerFile::load(state_dir.join(TRACKER_FILE), "watchlist", no_migration),
        }
    }

    /// Merge one discovery sighting: add the user if new, bump last_seen,
    /// and advance added_at only when the upstream reports a newer stamp.
    pub fn update(&self, path: &Path, user: &str, added_at: Option<DateTime<Utc>>) {
        let now = Utc::now();
        self.inner.upsert(
            path,
            || WatchlistEntry {
                added_at: added_at.unwrap_or(now),
                users: Vec::new(),
                last_seen: now,
            },
            |entry| {
                if !entry.users.iter().any(|u| u == user) {
                    entry.users.push(user.to_string());
                }
                entry.last_seen = now;
                if let Some(added_at) = added_at {
                    if added_at > entry.added_at {
                        entry.added_at = added_at;
                    }
                }
            },
        );
    }

    pub fn get(&self, path: &Path) -> Option<WatchlistEntry> {
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

    pub fn snapshot(&self) -> std::collections::HashMap<PathBuf, WatchlistEntry> {
        self.inner.snapshot()
    }

    #[must_use]
    pub fn user_count(&self, path: &Path) -> usize {
        self.inner.get(path).map_or(0, |e| e.users.len())
    }

    /// Days since the title was first watchlisted.
    #[must_use]
    pub fn days_since_added(&self, path: &Path) -> Option<f64> {
        let entry = self.inner.get(path)?;
        let age = Utc::now().signed_duration_since(entry.added_at);
        Some(age.num_milliseconds() as f64 / 86_400_000.0)
    }

    /// Remove entries no discovery scan has seen for `max_days`.
    pub fn cleanup_stale(&self, max_days: u32) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_days));
        let removed = self.inner.retain(|_, entry| entry.last_seen >= cutoff);
        if removed > 0 {
            tracing::info!(removed, "Cleaned up stale watchlist entries");
        }
        removed
    }

    /// Remove rows whose file exists on neither tier.
    pub fn cleanup_missing<F: FnMut(&Path) -> bool>(&self, exists: F) -> usize {
        let mut exists = exists;
        self.inner.retain(|path, _| exists(path))
    }
}
