//! Cache manager façade.
//!
//! Owns the trackers, mover, upstream handle, cycle runner, reconciler, and
//! session monitor, and exposes the small lifecycle surface the binary
//! drives: start, stop, run_cycle, reconcile, stats.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::cycle::CycleRunner;
use crate::disk::{DiskUsage, SystemDisk};
use crate::error::{Error, Result};
use crate::models::{CacheSource, CacheStats, CycleSummary, ReconciliationResult};
use crate::monitor::SessionMonitor;
use crate::mover::FileMover;
use crate::reconcile::Reconciler;
use crate::tracker::{CacheTimestampTracker, OnDeckTracker, WatchlistTracker};
use crate::upstream::MediaServer;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    Init,
    Running,
    Stopped,
}

/// Central coordinator; the only singleton in the system.
pub struct CacheManager {
    config: Arc<Config>,
    upstream: Arc<dyn MediaServer>,
    timestamps: Arc<CacheTimestampTracker>,
    ondeck: Arc<OnDeckTracker>,
    watchlist: Arc<WatchlistTracker>,
    cycle: CycleRunner,
    reconciler: Reconciler,
    monitor: Arc<SessionMonitor>,
    monitor_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    state: SyncMutex<ManagerState>,
    /// Serializes run_cycle and reconcile: the reconciler never runs
    /// concurrently with a cycle.
    op_lock: Mutex<()>,
    disk: Arc<dyn DiskUsage>,
}

impl CacheManager {
    /// Build a manager over the real filesystem.
    pub fn new(config: Config, upstream: Arc<dyn MediaServer>) -> Result<Self> {
        Self::with_disk(config, upstream, Arc::new(SystemDisk))
    }

    /// Build a manager with a pinned disk probe (tests).
    pub fn with_disk(
        config: Config,
        upstream: Arc<dyn MediaServer>,
        disk: Arc<dyn DiskUsage>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let timestamps = Arc::new(CacheTimestampTracker::load(&config.paths.state_dir));
        let ondeck = Arc::new(OnDeckTracker::load(&config.paths.state_dir));
        let watchlist = Arc::new(WatchlistTracker::load(&config.paths.state_dir));

        let mover = Arc::new(FileMover::new(
            config.paths.array_source.clone(),
            config.paths.cache_destination.clone(),
            config.cache.cache_method,
            config.transfers.max_concurrent_to_cache,
            config.transfers.max_concurrent_to_array,
            disk.clone(),
        ));

        let cycle = CycleRunner::new(
            config.clone(),
            upstream.clone(),
            mover.clone(),
            timestamps.clone(),
            ondeck.clone(),
            watchlist.clone(),
            disk.clone(),
        );
        let reconciler = Reconciler::new(
            mover.clone(),
            timestamps.clone(),
            ondeck.clone(),
            watchlist.clone(),
            true,
        );
        let monitor = Arc::new(SessionMonitor::new(
            config.clone(),
            upstream.clone(),
            mover,
            timestamps.clone(),
        ));

        Ok(Self {
            config,
            upstream,
            timestamps,
            ondeck,
            watchlist,
            cycle,
            reconciler,
            monitor,
            monitor_handle: Mutex::new(None),
            state: SyncMutex::new(ManagerState::Init),
            op_lock: Mutex::new(()),
            disk,
        })
    }

    fn ensure_running(&self) -> Result<()> {
        match *self.state.lock() {
            ManagerState::Running => Ok(()),
            other => Err(Error::InvalidState(format!(
                "Operation requires a running manager (state: {other:?})"
            ))),
        }
    }

    /// Start background services: probe the upstream, run the startup
    /// reconciliation, and spawn the session monitor.
    pub async fn start(&self) -> Result<ReconciliationResult> {
        {
            let state = self.state.lock();
            if *state != ManagerState::Init {
                return Err(Error::InvalidState(format!(
                    "Cannot start from state {:?}",
                    *state
                )));
            }
        }

        // Upstream connectivity probe. Upstream errors stay soft: the next
        // cycle retries; only configuration problems are fatal.
        match self.upstream.has_active_sessions().await {
            Ok(_) => tracing::info!("Connected to upstream media server"),
            Err(e) => tracing::warn!(error = %e, "Upstream unreachable at startup"),
        }

        let reconciliation = {
            let _op = self.op_lock.lock().await;
            self.reconciler
                .reconcile(&self.config.paths.cache_destination)
        };

        if self.config.realtime.enabled {
            let handle = self.monitor.start();
            *self.monitor_handle.lock().await = Some(handle);
            tracing::info!("Session monitor started");
        }

        *self.state.lock() = ManagerState::Running;
        tracing::info!("Cache manager running");
        Ok(reconciliation)
    }

    /// Stop background services. Waits up to ten seconds for the monitor to
    /// drain; in-flight transfers complete.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != ManagerState::Running {
                return;
            }
            *state = ManagerState::Stopped;
        }

        self.monitor.shutdown();
        if let Some(handle) = self.monitor_handle.lock().await.take() {
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                tracing::warn!("Session monitor did not stop in time, detaching");
            }
        }
        tracing::info!("Cache manager stopped");
    }

    /// Run one cache cycle. Only valid while running.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        self.ensure_running()?;
        let _op = self.op_lock.lock().await;
        Ok(self.cycle.run_cycle().await)
    }

    /// On-demand reconciliation. Only valid while running.
    pub async fn reconcile(&self) -> Result<ReconciliationResult> {
        self.ensure_running()?;
        let _op = self.op_lock.lock().await;
        Ok(self
            .reconciler
            .reconcile(&self.config.paths.cache_destination))
    }

    /// Aggregated cache statistics.
    pub async fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();

        for entry in self.timestamps.snapshot().values() {
            let size = entry.file_size_bytes;
            stats.total_size_bytes += size;
            stats.file_count += 1;
            match entry.source {
                CacheSource::OnDeck | CacheSource::ContinueWatching => {
                    stats.ondeck_count += 1;
                    stats.ondeck_bytes += size;
                }
                CacheSource::Watchlist => {
                    stats.watchlist_count += 1;
                    stats.watchlist_bytes += size;
                }
                CacheSource::TraktTrending => {
                    stats.trakt_count += 1;
                    stats.trakt_bytes += size;
                }
                CacheSource::ActiveWatching => {
                    stats.active_watching_count += 1;
                    stats.active_watching_bytes += size;
                }
                CacheSource::Manual | CacheSource::Unknown => {
                    stats.other_count += 1;
                    stats.other_bytes += size;
                }
            }
        }

        stats.limit_bytes = self.config.limit_bytes(self.disk.as_ref()).unwrap_or(0);
        if stats.limit_bytes > 0 {
            stats.used_percent =
                stats.total_size_bytes as f64 / stats.limit_bytes as f64 * 100.0;
        }
        stats.health = CacheStats::health_for(stats.used_percent);
        stats.active_sessions = self.monitor.active_session_count().await;
        stats.tracked_entries =
            self.timestamps.len() + self.ondeck.len() + self.watchlist.len();
        stats
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::FixedDisk;
    use crate::models::CacheMethod;
    use crate::upstream::MockMediaServer;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        config: Config,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let mut config = Config::default();
        config.paths.array_source = dir.path().join("bulk");
        config.paths.cache_destination = dir.path().join("cache");
        config.paths.state_dir = dir.path().join("state");
        config.upstream.url = "http://plex.local:32400".to_string();
        config.upstream.token = "tok".to_string();
        config.realtime.enabled = false;
        for p in [
            &config.paths.array_source,
            &config.paths.cache_destination,
            &config.paths.state_dir,
        ] {
            std::fs::create_dir_all(p).expect("mkdir");
        }
        Fixture { dir, config }
    }

    fn quiet_upstream() -> MockMediaServer {
        let mut upstream = MockMediaServer::new();
        upstream.expect_has_active_sessions().returning(|| Ok(false));
        upstream.expect_list_sessions().returning(|| Ok(vec![]));
        upstream
    }

    fn manager_with(fx: &Fixture, upstream: MockMediaServer) -> CacheManager {
        CacheManager::with_disk(
            fx.config.clone(),
            Arc::new(upstream),
            Arc::new(FixedDisk {
                total: u64::MAX,
                free: u64::MAX,
            }),
        )
        .expect("manager")
    }

    #[tokio::test]
    async fn run_cycle_requires_start() {
        let fx = fixture();
        let manager = manager_with(&fx, quiet_upstream());
        let err = manager.run_cycle().await.expect_err("must refuse");
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn invalid_config_is_fatal_at_construction() {
        let fx = fixture();
        let mut config = fx.config.clone();
        config.upstream.url = String::new();
        let err = CacheManager::with_disk(
            config,
            Arc::new(quiet_upstream()),
            Arc::new(FixedDisk {
                total: u64::MAX,
                free: u64::MAX,
            }),
        )
        .err()
        .expect("must fail");
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn startup_reconcile_removes_orphans() {
        let fx = fixture();

        // An entry for a cache file that does not exist.
        let state_dir = fx.config.paths.state_dir.clone();
        let tracker = CacheTimestampTracker::load(&state_dir);
        tracker.record(
            &fx.config.paths.array_source.join("a.mkv"),
            CacheSource::OnDeck,
            100,
            fx.config.paths.cache_destination.join("a.mkv"),
            CacheMethod::Copy,
            Vec::new(),
        );
        drop(tracker);

        let manager = manager_with(&fx, quiet_upstream());
        let reconciliation = manager.start().await.expect("start");
        assert_eq!(reconciliation.orphaned_found, 1);
        assert!(reconciliation.errors.is_empty());
        assert_eq!(manager.timestamps.len(), 0);

        // The fixture dir outlives the assertions.
        assert!(fx.dir.path().exists());
    }

    #[tokio::test]
    async fn start_twice_is_refused() {
        let fx = fixture();
        let manager = manager_with(&fx, quiet_upstream());
        manager.start().await.expect("start");
        assert!(matches!(
            manager.start().await,
            Err(Error::InvalidState(_))
        ));
        manager.stop().await;
        // Stopped managers do not run cycles either.
        assert!(matches!(
            manager.run_cycle().await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn stats_aggregate_sources_and_health() {
        let fx = fixture();
        let manager = manager_with(&fx, quiet_upstream());

        const GIB: u64 = 1 << 30;
        manager.timestamps.record(
            &fx.config.paths.array_source.join("od.mkv"),
            CacheSource::OnDeck,
            GIB,
            fx.config.paths.cache_destination.join("od.mkv"),
            CacheMethod::Copy,
            Vec::new(),
        );
        manager.timestamps.record(
            &fx.config.paths.array_source.join("wl.mkv"),
            CacheSource::Watchlist,
            2 * GIB,
            fx.config.paths.cache_destination.join("wl.mkv"),
            CacheMethod::Copy,
            Vec::new(),
        );

        let stats = manager.stats().await;
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.total_size_bytes, 3 * GIB);
        assert_eq!(stats.ondeck_count, 1);
        assert_eq!(stats.ondeck_bytes, GIB);
        assert_eq!(stats.watchlist_count, 1);
        // No limit configured: percentage stays zero, health is green.
        assert_eq!(stats.limit_bytes, 0);
        assert_eq!(stats.health, crate::models::CacheHealth::Healthy);
    }
}
