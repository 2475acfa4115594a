//! Priority scoring for smart eviction.
//!
//! Pure functions over tracker entries; the single most valuable test
//! surface in the crate. Scores are 0-100, higher = keep longer.
//!
//! - Base: 50
//! - Active playback: 100 (never evict)
//! - Source: on-deck +20, continue-watching +15, watchlist +10, trakt +5
//! - User count: +5 per user (max +15)
//! - Recency: recently cached +5 to +20, old files -10 to -20
//! - Episode position: current on-deck +15, next episodes +10
//! - Access count: +2 per play (max +10)

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::models::CacheSource;
use crate::tracker::TimestampEntry;

/// A file selected for eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub path: PathBuf,
    pub priority: u8,
    pub size_bytes: u64,
}

/// Knobs for candidate selection.
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    /// Bytes the selection must cover.
    pub target_bytes: u64,
    /// Only entries scoring strictly below this are evictable.
    pub min_priority: u8,
    /// Entries younger than this never qualify.
    pub protected_hours: f64,
    /// The configured episode look-ahead; bounds the next-episode bonus.
    pub episodes_ahead: u32,
}

const fn source_bonus(source: CacheSource) -> i32 {
    match source {
        CacheSource::ActiveWatching => 50,
        CacheSource::OnDeck => 20,
        CacheSource::ContinueWatching => 15,
        CacheSource::Watchlist => 10,
        CacheSource::TraktTrending => 5,
        CacheSource::Manual | CacheSource::Unknown => 0,
    }
}

fn age_bonus(age_hours: f64) -> i32 {
    if age_hours < 2.0 {
        20
    } else if age_hours < 6.0 {
        15
    } else if age_hours < 24.0 {
        10
    } else if age_hours < 72.0 {
        5
    } else if age_hours > 336.0 {
        -20
    } else if age_hours > 168.0 {
        -10
    } else {
        0
    }
}

/// Priority score for one cached file.
#[must_use]
pub fn score(
    entry: &TimestampEntry,
    is_playing: bool,
    episodes_ahead: u32,
    now: DateTime<Utc>,
) -> u8 {
    if is_playing {
        return 100;
    }

    let mut score: i32 = 50;
    score += source_bonus(entry.source);
    score += (entry.users.len() as i32 * 5).min(15);

    let age_hours = now
        .signed_duration_since(entry.cached_at)
        .num_milliseconds() as f64
        / 3_600_000.0;
    score += age_bonus(age_hours);

    if let Some(info) = &entry.episode_info {
        if info.is_current_ondeck {
            score += 15;
        } else {
            let window = (episodes_ahead / 2).max(1);
            if info.episodes_ahead > 0 && info.episodes_ahead <= window {
                score += 10;
            }
        }
    }

    score += (i32::try_from(entry.access_count).unwrap_or(i32::MAX / 2) * 2).min(10);

    score.clamp(0, 100) as u8
}

/// Files to evict to free `policy.target_bytes`, lowest priority first.
///
/// Playing files and files younger than the protected window are never
/// returned. Ties break on oldest cached_at, then on path, so the output is
/// deterministic for identical inputs.
#[must_use]
pub fn candidates(
    entries: &HashMap<PathBuf, TimestampEntry>,
    playing_paths: &HashSet<PathBuf>,
    policy: &EvictionPolicy,
    now: DateTime<Utc>,
) -> Vec<EvictionCandidate> {
    let mut scored: Vec<(EvictionCandidate, DateTime<Utc>)> = Vec::new();

    for (path, entry) in entries {
        if playing_paths.contains(path) {
            continue;
        }

        let age_hours = now
            .signed_duration_since(entry.cached_at)
            .num_milliseconds() as f64
            / 3_600_000.0;
        if age_hours < policy.protected_hours {
            continue;
        }

        let priority = score(entry, false, policy.episodes_ahead, now);
        if priority < policy.min_priority {
            scored.push((
                EvictionCandidate {
                    path: path.clone(),
                    priority,
                    size_bytes: entry.file_size_bytes,
                },
                entry.cached_at,
            ));
        }
    }

    scored.sort_by(|(a, a_cached), (b, b_cached)| {
        a.priority
            .cmp(&b.priority)
            .then(a_cached.cmp(b_cached))
            .then(a.path.cmp(&b.path))
    });

    let mut selected = Vec::new();
    let mut freed: u64 = 0;
    for (candidate, _) in scored {
        if freed >= policy.target_bytes {
            break;
        }
        freed += candidate.size_bytes;
        selected.push(candidate);
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CacheMethod, EpisodeInfo};
    use chrono::Duration;

    fn entry(source: CacheSource, age_hours: i64, size: u64) -> TimestampEntry {
        TimestampEntry {
            cached_at: Utc::now() - Duration::hours(age_hours),
            source,
            file_size_bytes: size,
            cache_path: None,
            cache_method: Some(CacheMethod::Move),
            users: Vec::new(),
            last_seen: None,
            watched_at: None,
            episode_info: None,
            access_count: 0,
            siblings: Vec::new(),
        }
    }

    const GIB: u64 = 1 << 30;

    #[test]
    fn playing_always_scores_100() {
        let e = entry(CacheSource::Manual, 500, GIB);
        assert_eq!(score(&e, true, 5, Utc::now()), 100);
    }

    #[test]
    fn source_and_age_bonuses_apply() {
        let now = Utc::now();
        // 24h old on-deck: 50 + 20 + 5 (under 72h) = 75.
        let ondeck = entry(CacheSource::OnDeck, 24, GIB);
        assert_eq!(score(&ondeck, false, 5, now), 75);
        // 24h old watchlist: 50 + 10 + 5 = 65.
        let watchlist = entry(CacheSource::Watchlist, 24, GIB);
        assert_eq!(score(&watchlist, false, 5, now), 65);
        // Continue-watching sits between on-deck and watchlist: 50 + 15 + 5.
        let continued = entry(CacheSource::ContinueWatching, 24, GIB);
        assert_eq!(score(&continued, false, 5, now), 70);
        // Three-week-old manual file: 50 + 0 - 20 = 30.
        let stale = entry(CacheSource::Manual, 24 * 21, GIB);
        assert_eq!(score(&stale, false, 5, now), 30);
    }

    #[test]
    fn user_and_access_bonuses_are_capped() {
        let now = Utc::now();
        let mut e = entry(CacheSource::Manual, 100, GIB);
        e.users = (0..10).map(|i| format!("user{i}")).collect();
        e.access_count = 50;
        // 50 + 0 (source) + 15 (user cap) + 0 (100h) + 10 (access cap) = 75.
        assert_eq!(score(&e, false, 5, now), 75);
    }

    #[test]
    fn episode_bonuses() {
        let now = Utc::now();
        let mut current = entry(CacheSource::OnDeck, 100, GIB);
        current.episode_info = Some(EpisodeInfo {
            show: "X".into(),
            season: 1,
            episode: 5,
            is_current_ondeck: true,
            episodes_ahead: 0,
        });
        // 50 + 20 + 15 = 85.
        assert_eq!(score(&current, false, 5, now), 85);

        let mut next = entry(CacheSource::OnDeck, 100, GIB);
        next.episode_info = Some(EpisodeInfo {
            show: "X".into(),
            season: 1,
            episode: 6,
            is_current_ondeck: false,
            episodes_ahead: 1,
        });
        // Within the look-ahead window: 50 + 20 + 10 = 80.
        assert_eq!(score(&next, false, 5, now), 80);

        let mut far = entry(CacheSource::OnDeck, 100, GIB);
        far.episode_info = Some(EpisodeInfo {
            show: "X".into(),
            season: 1,
            episode: 10,
            is_current_ondeck: false,
            episodes_ahead: 5,
        });
        // Outside the window (5/2 = 2): no bonus.
        assert_eq!(score(&far, false, 5, now), 70);
    }

    fn policy(target: u64) -> EvictionPolicy {
        EvictionPolicy {
            target_bytes: target,
            min_priority: 60,
            protected_hours: 2.0,
            episodes_ahead: 5,
        }
    }

    #[test]
    fn playing_paths_are_never_candidates() {
        let mut entries = HashMap::new();
        entries.insert(
            PathBuf::from("/bulk/playing.mkv"),
            entry(CacheSource::Manual, 100, GIB),
        );
        let playing: HashSet<PathBuf> = [PathBuf::from("/bulk/playing.mkv")].into();

        let selected = candidates(&entries, &playing, &policy(GIB), Utc::now());
        assert!(selected.is_empty());
    }

    #[test]
    fn protected_age_is_never_returned() {
        let mut entries = HashMap::new();
        entries.insert(
            PathBuf::from("/bulk/fresh.mkv"),
            entry(CacheSource::Manual, 1, GIB),
        );
        let selected = candidates(&entries, &HashSet::new(), &policy(GIB), Utc::now());
        assert!(selected.is_empty());
    }

    #[test]
    fn selection_reaches_target_lowest_priority_first() {
        let mut entries = HashMap::new();
        for i in 0..5 {
            entries.insert(
                PathBuf::from(format!("/bulk/wl{i}.mkv")),
                entry(CacheSource::Watchlist, 24, GIB),
            );
            entries.insert(
                PathBuf::from(format!("/bulk/od{i}.mkv")),
                entry(CacheSource::OnDeck, 24, GIB),
            );
        }

        // Watchlist entries score 65 (< 60? no). Use min_priority 70 so only
        // watchlist entries (65) qualify while on-deck (75) stay protected.
        let policy = EvictionPolicy {
            target_bytes: 3 * GIB,
            min_priority: 70,
            protected_hours: 2.0,
            episodes_ahead: 5,
        };
        let selected = candidates(&entries, &HashSet::new(), &policy, Utc::now());

        assert_eq!(selected.len(), 3);
        let total: u64 = selected.iter().map(|c| c.size_bytes).sum();
        assert!(total >= 3 * GIB);
        for candidate in &selected {
            assert!(candidate.path.to_string_lossy().contains("wl"));
            assert_eq!(candidate.priority, 65);
        }
    }

    #[test]
    fn output_is_deterministic() {
        let mut entries = HashMap::new();
        for i in 0..8 {
            entries.insert(
                PathBuf::from(format!("/bulk/f{i}.mkv")),
                entry(CacheSource::Manual, 24 + i, GIB),
            );
        }
        let now = Utc::now();
        let a = candidates(&entries, &HashSet::new(), &policy(4 * GIB), now);
        let b = candidates(&entries, &HashSet::new(), &policy(4 * GIB), now);
        assert_eq!(a, b);
        // Oldest first among equal scores.
        assert!(a.windows(2).all(|w| {
            let first = entries[&w[0].path].cached_at;
            let second = entries[&w[1].path].cached_at;
            first <= second
        }));
    }
}
