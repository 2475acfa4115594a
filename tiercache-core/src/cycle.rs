//! The cache cycle.
//!
//! One idempotent pass: gate on active sessions, snapshot playing paths,
//! refresh discovery trackers, classify and transfer new files, sweep
//! retention, then enforce the size ceiling. A process-wide mutex keeps a
//! single cycle in flight; the session monitor may interleave reactive
//! transfers, which the mover's per-path locks serialize.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::disk::DiskUsage;
use crate::error::Error;
use crate::models::{CacheSource, CycleSummary, EpisodeInfo, EvictionResult};
use crate::mover::{find_siblings, FileMover};
use crate::scorer::{self, EvictionPolicy};
use crate::tracker::{CacheTimestampTracker, OnDeckTracker, TimestampEntry, WatchlistTracker};
use crate::upstream::MediaServer;

/// One file queued for transfer.
#[derive(Debug, Clone)]
struct TransferPlan {
    path: PathBuf,
    source: CacheSource,
}

/// Why the retention sweep restores a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestoreReason {
    WatchedExpired,
    MaxCacheTime,
    NoLongerNeeded,
}

impl RestoreReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::WatchedExpired => "watched_expired",
            Self::MaxCacheTime => "max_cache_time",
            Self::NoLongerNeeded => "no_longer_needed",
        }
    }
}

/// Drives one cache cycle end to end.
pub struct CycleRunner {
    config: Arc<Config>,
    upstream: Arc<dyn MediaServer>,
    mover: Arc<FileMover>,
    timestamps: Arc<CacheTimestampTracker>,
    ondeck: Arc<OnDeckTracker>,
    watchlist: Arc<WatchlistTracker>,
    disk: Arc<dyn DiskUsage>,
    cycle_lock: Mutex<()>,
}

impl CycleRunner {
    pub fn new(
        config: Arc<Config>,
        upstream: Arc<dyn MediaServer>,
        mover: Arc<FileMover>,
        timestamps: Arc<CacheTimestampTracker>,
        ondeck: Arc<OnDeckTracker>,
        watchlist: Arc<WatchlistTracker>,
        disk: Arc<dyn DiskUsage>,
    ) -> Self {
        Self {
            config,
            upstream,
            mover,
            timestamps,
            ondeck,
            watchlist,
            disk,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Run one full cycle. Partial failures land in `summary.errors`;
    /// nothing here aborts the process.
    pub async fn run_cycle(&self) -> CycleSummary {
        let _cycle = self.cycle_lock.lock().await;
        let started = Instant::now();
        let mut summary = CycleSummary::default();

        // Step 1: gate.
        if self.config.upstream.exit_if_active_session {
            match self.upstream.has_active_sessions().await {
                Ok(true) => {
                    tracing::info!("Active sessions detected, skipping cache cycle");
                    summary.skipped = Some("active_sessions".to_string());
                    summary.duration_seconds = started.elapsed().as_secs_f64();
                    return summary;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Could not check active sessions");
                }
            }
        }

        // Step 2: snapshot playing paths. Never touch these.
        let playing = self.playing_paths().await;

        // Steps 3-4: discovery.
        let plans = self.discover(&playing, &mut summary).await;

        // Steps 5-6: transfer.
        self.transfer(plans, &mut summary).await;

        // Step 7: retention sweep. Library watched state is pulled first so
        // files finished outside a monitored session still age out.
        if self.config.retention.watched_move {
            self.sync_watched().await;
        }
        self.retention_sweep(&playing, &mut summary).await;

        // Step 8: limit enforcement.
        if self.config.cache.eviction_enabled {
            summary.eviction = Some(self.enforce_limits(&playing).await);
        }

        summary.duration_seconds = started.elapsed().as_secs_f64();
        tracing::info!(
            transferred = summary.transferred,
            restored = summary.restored,
            errors = summary.errors.len(),
            duration_seconds = summary.duration_seconds,
            "Cache cycle complete"
        );
        summary
    }

    async fn playing_paths(&self) -> HashSet<PathBuf> {
        match self.upstream.list_sessions().await {
            Ok(sessions) => sessions.into_iter().map(|s| s.file_path).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not list sessions, assuming none");
                HashSet::new()
            }
        }
    }

    /// Refresh the discovery trackers and build the transfer queue.
    async fn discover(
        &self,
        playing: &HashSet<PathBuf>,
        summary: &mut CycleSummary,
    ) -> Vec<TransferPlan> {
        let mut plans: Vec<TransferPlan> = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        // OnDeck status is ephemeral: refill from scratch each cycle.
        self.ondeck.clear();

        let ondeck_items = match self
            .upstream
            .list_ondeck(
                self.config.upstream.episodes_ahead,
                self.config.upstream.days_to_monitor,
                self.config.upstream.skip_ondeck_users.clone(),
            )
            .await
        {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(error = %e, "OnDeck discovery failed");
                summary.errors.push(format!("ondeck: {e}"));
                Vec::new()
            }
        };
        summary.ondeck_items = ondeck_items.len();

        for item in ondeck_items {
            self.ondeck
                .update(&item.file_path, &item.username, item.episode_info.clone());
            self.register(
                &mut plans,
                &mut seen,
                playing,
                item.file_path,
                CacheSource::OnDeck,
                &item.username,
                item.episode_info,
            );
        }

        if self.config.upstream.watchlist_enabled {
            let watchlist_items = match self
                .upstream
                .list_watchlist(
                    self.config.upstream.watchlist_episodes_per_show,
                    self.config.upstream.skip_watchlist_users.clone(),
                )
                .await
            {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(error = %e, "Watchlist discovery failed");
                    summary.errors.push(format!("watchlist: {e}"));
                    Vec::new()
                }
            };
            summary.watchlist_items = watchlist_items.len();

            for item in watchlist_items {
                self.watchlist
                    .update(&item.file_path, &item.username, item.added_at);
                self.register(
                    &mut plans,
                    &mut seen,
                    playing,
                    item.file_path,
                    CacheSource::Watchlist,
                    &item.username,
                    None,
                );
            }
        }

        if self.config.trakt.enabled {
            match self
                .upstream
                .list_trending(self.config.trakt.trending_movies_count)
                .await
            {
                Ok(items) => {
                    summary.trakt_items = items.len();
                    for item in items {
                        self.register(
                            &mut plans,
                            &mut seen,
                            playing,
                            item.file_path,
                            CacheSource::TraktTrending,
                            &item.username,
                            None,
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Trakt discovery failed");
                    summary.errors.push(format!("trakt: {e}"));
                }
            }
        }

        plans
    }

    /// Classify one discovered file: refresh tracker state when it is
    /// already cached, otherwise queue it for transfer.
    #[allow(clippy::too_many_arguments)]
    fn register(
        &self,
        plans: &mut Vec<TransferPlan>,
        seen: &mut HashSet<PathBuf>,
        playing: &HashSet<PathBuf>,
        path: PathBuf,
        source: CacheSource,
        username: &str,
        episode_info: Option<EpisodeInfo>,
    ) {
        if !seen.insert(path.clone()) {
            return;
        }
        if self.timestamps.contains(&path) {
            if !username.is_empty() {
                self.timestamps
                    .refresh_discovery(&path, username, episode_info);
            }
            return;
        }
        if playing.contains(&path) {
            return;
        }
        if self.mover.is_cached_on_disk(&path) {
            return;
        }
        plans.push(TransferPlan { path, source });
    }

    /// Drive queued transfers with bounded parallelism. An
    /// insufficient-space failure aborts the rest of the batch; eviction in
    /// the next cycle may recover the headroom.
    async fn transfer(&self, plans: Vec<TransferPlan>, summary: &mut CycleSummary) {
        if plans.is_empty() {
            return;
        }
        tracing::info!(files = plans.len(), "Transferring files to cache");

        let abort = Arc::new(AtomicBool::new(false));
        let results: Vec<(TransferPlan, Option<String>, usize, u64)> = stream::iter(plans)
            .map(|plan| {
                let abort = abort.clone();
                async move {
                    if abort.load(Ordering::Relaxed) {
                        return (plan, Some("batch_aborted".to_string()), 0, 0);
                    }
                    let siblings = find_siblings(&plan.path);
                    match self.mover.copy_group_to_cache(&plan.path, &siblings).await {
                        Ok(outcomes) => {
                            let video_outcome = &outcomes[0];
                            if video_outcome.bytes_transferred == 0 {
                                // Raced with a reactive transfer; already there.
                                return (plan, None, 0, 0);
                            }
                            let bytes: u64 =
                                outcomes.iter().map(|o| o.bytes_transferred).sum();
                            self.timestamps.record(
                                &plan.path,
                                plan.source,
                                video_outcome.bytes_transferred,
                                video_outcome.dest_path.clone(),
                                self.mover.method(),
                                siblings,
                            );
                            (plan, None, outcomes.len(), bytes)
                        }
                        Err(Error::SourceMissing(path)) => {
                            tracing::warn!(path = %path.display(), "Source vanished mid-cycle, skipping");
                            (plan, Some(format!("source missing: {}", path.display())), 0, 0)
                        }
                        Err(e @ Error::InsufficientSpace { .. }) => {
                            abort.store(true, Ordering::Relaxed);
                            tracing::warn!(error = %e, "Cache tier out of space, aborting transfer batch");
                            (plan, Some(e.to_string()), 0, 0)
                        }
                        Err(e) => {
                            tracing::warn!(path = %plan.path.display(), error = %e, "Transfer failed");
                            (plan, Some(e.to_string()), 0, 0)
                        }
                    }
                }
            })
            .buffer_unordered(self.config.transfers.max_concurrent_to_cache.max(1))
            .collect()
            .await;

        for (_, error, files, bytes) in results {
            summary.transferred += files;
            summary.bytes_transferred += bytes;
            if let Some(error) = error {
                summary.errors.push(error);
            }
        }
    }

    /// Stamp tracked files the library reports as watched. Catches
    /// playbacks the session monitor never saw (external players, downtime).
    async fn sync_watched(&self) {
        let watched = match self
            .upstream
            .list_watched_files(self.config.upstream.library_sections.clone())
            .await
        {
            Ok(watched) => watched,
            Err(e) => {
                tracing::warn!(error = %e, "Could not fetch watched files");
                return;
            }
        };
        let watched: HashSet<PathBuf> = watched.into_iter().collect();
        for path in self.timestamps.snapshot().keys() {
            if watched.contains(path) {
                self.timestamps.mark_watched(path);
            }
        }
    }

    /// Evaluate every tracked file against retention policy and restore the
    /// expired ones.
    async fn retention_sweep(&self, playing: &HashSet<PathBuf>, summary: &mut CycleSummary) {
        for (path, entry) in self.timestamps.snapshot() {
            if playing.contains(&path) {
                continue;
            }
            let Some(reason) = self.should_restore(&path, &entry) else {
                continue;
            };
            tracing::info!(path = %path.display(), reason = reason.as_str(), "Restoring to array");
            match self
                .mover
                .restore_group_to_array(&path, &entry.siblings)
                .await
            {
                Ok(outcomes) => {
                    summary.restored += outcomes.len();
                    summary.bytes_restored +=
                        outcomes.iter().map(|o| o.bytes_transferred).sum::<u64>();
                    self.timestamps.remove(&path);
                }
                Err(Error::NotCached(_)) => {
                    // Nothing on the cache tier; reconciliation territory.
                    self.timestamps.remove(&path);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Restore failed");
                    summary.errors.push(format!("restore {}: {e}", path.display()));
                }
            }
        }
    }

    /// Retention decision for one tracked file. `None` keeps the file.
    fn should_restore(&self, path: &std::path::Path, entry: &TimestampEntry) -> Option<RestoreReason> {
        let retention = &self.config.retention;

        if self
            .timestamps
            .is_within_retention(path, f64::from(retention.min_retention_hours))
        {
            return None;
        }

        let on_deck = self.ondeck.contains(path);
        if on_deck && retention.ondeck_protected {
            return None;
        }

        let on_watchlist = self.watchlist.contains(path);
        if on_watchlist {
            let days = self.watchlist.days_since_added(path).unwrap_or(0.0);
            if retention.watchlist_retention_days == 0
                || days < f64::from(retention.watchlist_retention_days)
            {
                return None;
            }
        }

        if retention.watched_move {
            if let Some(watched_at) = entry.watched_at {
                let hours = Utc::now()
                    .signed_duration_since(watched_at)
                    .num_milliseconds() as f64
                    / 3_600_000.0;
                if hours >= f64::from(retention.watched_cache_expiry_hours) {
                    return Some(RestoreReason::WatchedExpired);
                }
            }
        }

        if retention.max_cache_hours > 0 {
            if let Some(age) = self.timestamps.age_hours(path) {
                if age >= f64::from(retention.max_cache_hours) {
                    return Some(RestoreReason::MaxCacheTime);
                }
            }
        }

        if !on_deck && !on_watchlist {
            return Some(RestoreReason::NoLongerNeeded);
        }

        None
    }

    /// Enforce the size ceiling through prioritized eviction.
    async fn enforce_limits(&self, playing: &HashSet<PathBuf>) -> EvictionResult {
        let mut result = EvictionResult::default();

        let limit_bytes = match self.config.limit_bytes(self.disk.as_ref()) {
            Ok(limit) => limit,
            Err(e) => {
                result.errors.push(e.to_string());
                return result;
            }
        };
        if limit_bytes == 0 {
            return result;
        }

        let entries: HashMap<PathBuf, TimestampEntry> = self.timestamps.snapshot();
        let usage: u64 = entries.values().map(|e| e.file_size_bytes).sum();
        let threshold =
            limit_bytes / 100 * u64::from(self.config.cache.eviction_threshold_percent);
        if usage < threshold {
            return result;
        }
        result.needed = true;

        let target_usage = limit_bytes / 100 * u64::from(self.config.cache.eviction_target_percent);
        let to_free = usage.saturating_sub(target_usage);
        tracing::info!(
            usage,
            limit_bytes,
            to_free,
            "Cache over threshold, evicting"
        );

        let playing_owned: HashSet<PathBuf> = playing.clone();
        let candidates = scorer::candidates(
            &entries,
            &playing_owned,
            &EvictionPolicy {
                target_bytes: to_free,
                min_priority: self.config.cache.eviction_min_priority,
                protected_hours: self.config.cache.eviction_protected_hours,
                episodes_ahead: self.config.upstream.episodes_ahead,
            },
            Utc::now(),
        );

        if candidates.is_empty() {
            tracing::warn!("No eviction candidates below priority threshold");
            return result;
        }

        for candidate in candidates {
            let siblings = entries
                .get(&candidate.path)
                .map(|e| e.siblings.clone())
                .unwrap_or_default();
            tracing::info!(
                path = %candidate.path.display(),
                priority = candidate.priority,
                "Evicting"
            );
            match self
                .mover
                .restore_group_to_array(&candidate.path, &siblings)
                .await
            {
                Ok(_) => {
                    result.files_evicted += 1;
                    result.bytes_freed += candidate.size_bytes;
                    self.timestamps.remove(&candidate.path);
                }
                Err(e) => {
                    result
                        .errors
                        .push(format!("evict {}: {e}", candidate.path.display()));
                }
            }
        }

        result.performed = true;
        tracing::info!(
            files = result.files_evicted,
            bytes = result.bytes_freed,
            "Eviction complete"
        );
        result
    }
}

impl std::fmt::Debug for CycleRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleRunner").finish()
    }
}
