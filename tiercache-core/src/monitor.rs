//! Real-time session monitor.
//!
//! Polls upstream playback sessions between cache cycles and reacts to
//! transitions: a just-started session can trigger an immediate transfer,
//! and crossing the watched threshold stamps the tracker. Shares the mover
//! and trackers with the cycle; the mover's per-path locks make a racing
//! reactive transfer a no-op.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::models::{CacheSource, Session};
use crate::mover::{find_siblings, FileMover};
use crate::tracker::CacheTimestampTracker;
use crate::upstream::MediaServer;

/// Session monitor state and loop.
pub struct SessionMonitor {
    config: Arc<Config>,
    upstream: Arc<dyn MediaServer>,
    mover: Arc<FileMover>,
    timestamps: Arc<CacheTimestampTracker>,
    active_sessions: Arc<RwLock<HashMap<String, Session>>>,
    cancel_token: CancellationToken,
}

impl SessionMonitor {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        upstream: Arc<dyn MediaServer>,
        mover: Arc<FileMover>,
        timestamps: Arc<CacheTimestampTracker>,
    ) -> Self {
        Self {
            config,
            upstream,
            mover,
            timestamps,
            active_sessions: Arc::new(RwLock::new(HashMap::new())),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Start the monitoring loop.
    ///
    /// Returns the `JoinHandle` so the caller can detect completion. Use
    /// [`SessionMonitor::shutdown`] to stop the loop; it exits at the next
    /// tick boundary, within the tick interval.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut timer = interval(Duration::from_secs(u64::from(
            monitor.config.realtime.check_interval_seconds.max(1),
        )));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = monitor.cancel_token.cancelled() => {
                        tracing::info!("Session monitor shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        monitor.tick().await;
                    }
                }
            }
        })
    }

    /// Signal the loop to stop. In-flight transfers complete; no new ones
    /// start.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// Paths of currently playing files, from the last snapshot.
    pub async fn active_paths(&self) -> HashSet<PathBuf> {
        self.active_sessions
            .read()
            .await
            .values()
            .map(|s| s.file_path.clone())
            .collect()
    }

    /// Number of sessions in the last snapshot.
    pub async fn active_session_count(&self) -> usize {
        self.active_sessions.read().await.len()
    }

    /// One poll: diff the upstream snapshot against the previous one and
    /// react to started, updated, and ended sessions.
    async fn tick(&self) {
        let sessions = match self.upstream.list_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!(error = %e, "Session poll failed");
                return;
            }
        };

        let current: HashMap<String, Session> = sessions
            .into_iter()
            .map(|s| (s.session_key.clone(), s))
            .collect();
        let previous = self.active_sessions.read().await.clone();

        for (key, session) in &current {
            if previous.contains_key(key) {
                self.handle_updated(session).await;
            } else {
                self.handle_started(session).await;
            }
        }
        for (key, session) in &previous {
            if !current.contains_key(key) {
                self.handle_ended(session);
            }
        }

        *self.active_sessions.write().await = current;
    }

    /// A session disappeared from the upstream snapshot. No transfer here;
    /// the next cycle evaluates the file. An unfinished active-watching
    /// entry drops to continue-watching so the scorer stops treating it as
    /// live playback.
    fn handle_ended(&self, session: &Session) {
        tracing::info!(
            user = %session.username,
            path = %session.file_path.display(),
            progress = session.progress(),
            "Session ended"
        );
        if session.progress() < self.config.realtime.watched_threshold_percent {
            self.timestamps
                .demote_to_continue_watching(&session.file_path);
        }
    }

    async fn handle_started(&self, session: &Session) {
        tracing::info!(
            user = %session.username,
            path = %session.file_path.display(),
            "New session"
        );
        self.timestamps.record_access(&session.file_path);

        if !self.config.realtime.cache_on_play_start {
            return;
        }
        // Respect cancellation: no new transfers during shutdown.
        if self.cancel_token.is_cancelled() {
            return;
        }
        if self.timestamps.contains(&session.file_path)
            || self.mover.is_cached_on_disk(&session.file_path)
        {
            return;
        }

        tracing::info!(path = %session.file_path.display(), "Caching during playback");
        let siblings = find_siblings(&session.file_path);
        match self
            .mover
            .copy_group_to_cache(&session.file_path, &siblings)
            .await
        {
            Ok(outcomes) => {
                let video = &outcomes[0];
                if video.bytes_transferred > 0 {
                    self.timestamps.record(
                        &session.file_path,
                        CacheSource::ActiveWatching,
                        video.bytes_transferred,
                        video.dest_path.clone(),
                        self.mover.method(),
                        siblings,
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %session.file_path.display(),
                    error = %e,
                    "Reactive caching failed"
                );
            }
        }
    }

    async fn handle_updated(&self, session: &Session) {
        if session.progress() >= self.config.realtime.watched_threshold_percent {
            tracing::debug!(
                path = %session.file_path.display(),
                progress = session.progress(),
                "Marking watched"
            );
            self.timestamps.mark_watched(&session.file_path);
        }
    }
}

impl std::fmt::Debug for SessionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMonitor")
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish()
    }
}
