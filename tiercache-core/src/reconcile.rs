//! Startup reconciliation.
//!
//! The trackers are authoritative while the process runs, but crashes and
//! out-of-band file operations make them drift from the filesystem. The
//! reconciler repairs the divergence: orphaned tracker rows are removed,
//! rows whose file exists on neither tier are dropped, and cache-tier files
//! nobody tracks are reported for the operator to decide on.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::models::ReconciliationResult;
use crate::mover::FileMover;
use crate::tracker::{CacheTimestampTracker, OnDeckTracker, WatchlistTracker};

const WATCHLIST_STALE_DAYS: u32 = 7;
const ONDECK_STALE_DAYS: u32 = 1;

/// Repairs tracker/filesystem divergence.
pub struct Reconciler {
    mover: Arc<FileMover>,
    timestamps: Arc<CacheTimestampTracker>,
    ondeck: Arc<OnDeckTracker>,
    watchlist: Arc<WatchlistTracker>,
    /// Walk the cache tier looking for untracked files. Skipped when the
    /// cache tier is too large to scan cheaply.
    scan_cache_tier: bool,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        mover: Arc<FileMover>,
        timestamps: Arc<CacheTimestampTracker>,
        ondeck: Arc<OnDeckTracker>,
        watchlist: Arc<WatchlistTracker>,
        scan_cache_tier: bool,
    ) -> Self {
        Self {
            mover,
            timestamps,
            ondeck,
            watchlist,
            scan_cache_tier,
        }
    }

    /// Run one reconciliation sweep. Never fails; problems are counted and
    /// logged.
    pub fn reconcile(&self, cache_root: &Path) -> ReconciliationResult {
        let mut result = ReconciliationResult::default();

        // Orphaned rows: tracker says cached, cache tier says otherwise.
        let entries = self.timestamps.snapshot();
        result.files_checked = entries.len();
        for (path, entry) in &entries {
            let cache_path = entry
                .cache_path
                .clone()
                .or_else(|| self.mover.cache_path_for(path).ok());
            let present = cache_path.as_deref().is_some_and(Path::exists);
            if !present {
                tracing::warn!(path = %path.display(), "Orphaned tracker entry, removing");
                result.orphaned_found += 1;
                self.timestamps.remove(path);
            }
        }

        // Rows whose file exists on neither tier.
        result.stale_removed += self
            .timestamps
            .cleanup_missing(|path, entry| self.exists_on_either_tier(path, entry.cache_path.as_deref()));
        result.stale_removed += self
            .watchlist
            .cleanup_missing(|path| self.exists_on_either_tier(path, None));
        result.stale_removed += self
            .ondeck
            .cleanup_missing(|path| self.exists_on_either_tier(path, None));

        // Age-based cleanup of the discovery trackers.
        result.stale_removed += self.watchlist.cleanup_stale(WATCHLIST_STALE_DAYS);
        result.stale_removed += self.ondeck.cleanup_stale(ONDECK_STALE_DAYS);

        if self.scan_cache_tier {
            result.untracked_found = self.find_untracked(cache_root);
        }

        tracing::info!(
            checked = result.files_checked,
            orphaned = result.orphaned_found,
            stale = result.stale_removed,
            untracked = result.untracked_found.len(),
            "Reconciliation complete"
        );
        result
    }

    fn exists_on_either_tier(&self, path: &Path, recorded_cache_path: Option<&Path>) -> bool {
        if path.exists() {
            return true;
        }
        if recorded_cache_path.is_some_and(Path::exists) {
            return true;
        }
        self.mover
            .cache_path_for(path)
            .map(|cache_path| cache_path.exists())
            .unwrap_or(false)
    }

    /// Files on the cache tier no tracker entry accounts for. Reported
    /// only; removal is an operator decision.
    fn find_untracked(&self, cache_root: &Path) -> Vec<PathBuf> {
        let mut tracked: HashSet<PathBuf> = HashSet::new();
        for (path, entry) in self.timestamps.snapshot() {
            if let Some(cache_path) = entry
                .cache_path
                .clone()
                .or_else(|| self.mover.cache_path_for(&path).ok())
            {
                tracked.insert(cache_path);
            }
            for sibling in &entry.siblings {
                if let Ok(sibling_cache) = self.mover.cache_path_for(sibling) {
                    tracked.insert(sibling_cache);
                }
            }
        }

        let mut untracked = Vec::new();
        let mut stack = vec![cache_root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Could not scan cache directory");
                    continue;
                }
            };
            for entry in entries.filter_map(std::result::Result::ok) {
                let path = entry.path();
                match entry.file_type() {
                    Ok(file_type) if file_type.is_dir() => stack.push(path),
                    Ok(file_type) if file_type.is_file() => {
                        if !tracked.contains(&path) {
                            untracked.push(path);
                        }
                    }
                    _ => {}
                }
            }
        }
        untracked.sort();
        untracked
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("scan_cache_tier", &self.scan_cache_tier)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::FixedDisk;
    use crate::models::{CacheMethod, CacheSource};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        array: PathBuf,
        cache: PathBuf,
        state: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let array = dir.path().join("bulk");
        let cache = dir.path().join("cache");
        let state = dir.path().join("state");
        for p in [&array, &cache, &state] {
            std::fs::create_dir_all(p).expect("mkdir");
        }
        Fixture {
            _dir: dir,
            array,
            cache,
            state,
        }
    }

    fn build(fx: &Fixture, scan: bool) -> (Reconciler, Arc<CacheTimestampTracker>) {
        let mover = Arc::new(FileMover::new(
            fx.array.clone(),
            fx.cache.clone(),
            CacheMethod::Copy,
            1,
            1,
            Arc::new(FixedDisk {
                total: u64::MAX,
                free: u64::MAX,
            }),
        ));
        let timestamps = Arc::new(CacheTimestampTracker::load(&fx.state));
        let ondeck = Arc::new(OnDeckTracker::load(&fx.state));
        let watchlist = Arc::new(WatchlistTracker::load(&fx.state));
        (
            Reconciler::new(mover, timestamps.clone(), ondeck, watchlist, scan),
            timestamps,
        )
    }

    #[test]
    fn orphaned_entries_are_removed() {
        let fx = fixture();
        let (reconciler, timestamps) = build(&fx, false);

        // Tracked but no cache copy on disk.
        timestamps.record(
            &fx.array.join("a.mkv"),
            CacheSource::OnDeck,
            100,
            fx.cache.join("a.mkv"),
            CacheMethod::Copy,
            Vec::new(),
        );

        let result = reconciler.reconcile(&fx.cache);
        assert_eq!(result.files_checked, 1);
        assert_eq!(result.orphaned_found, 1);
        assert!(timestamps.is_empty());
        assert!(result.errors.is_empty());
    }

    #[test]
    fn present_entries_survive() {
        let fx = fixture();
        let (reconciler, timestamps) = build(&fx, false);

        let original = fx.array.join("a.mkv");
        let cached = fx.cache.join("a.mkv");
        std::fs::write(&original, b"x").expect("seed");
        std::fs::write(&cached, b"x").expect("seed");
        timestamps.record(
            &original,
            CacheSource::OnDeck,
            1,
            cached,
            CacheMethod::Copy,
            Vec::new(),
        );

        let result = reconciler.reconcile(&fx.cache);
        assert_eq!(result.orphaned_found, 0);
        assert_eq!(timestamps.len(), 1);
    }

    #[test]
    fn untracked_cache_files_are_reported_not_removed() {
        let fx = fixture();
        let (reconciler, timestamps) = build(&fx, true);

        let original = fx.array.join("tracked.mkv");
        let cached = fx.cache.join("tracked.mkv");
        std::fs::write(&original, b"x").expect("seed");
        std::fs::write(&cached, b"x").expect("seed");
        timestamps.record(
            &original,
            CacheSource::OnDeck,
            1,
            cached,
            CacheMethod::Copy,
            Vec::new(),
        );
        let stray = fx.cache.join("stray.mkv");
        std::fs::write(&stray, b"y").expect("seed");

        let result = reconciler.reconcile(&fx.cache);
        assert_eq!(result.untracked_found, vec![stray.clone()]);
        assert!(stray.exists());
    }
}
