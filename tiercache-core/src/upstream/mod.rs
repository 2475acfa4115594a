//! Upstream media server contract.
//!
//! A narrow adapter surface, not a general client: exactly the operations
//! the cycle and the session monitor consume. Upstream failures are always
//! soft: callers treat an error as an empty result and log it; a failed
//! discovery never stops a cycle.

pub mod plex;

pub use plex::PlexMediaServer;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{OnDeckItem, Session, WatchlistItem};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Upstream request failed: {0}")]
    Request(String),

    #[error("Upstream response invalid: {0}")]
    Invalid(String),
}

/// The operations tiercache needs from a media server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaServer: Send + Sync {
    /// On-deck items for the main account and every non-skipped user; for
    /// TV this includes the next `episodes_ahead` episodes of each show.
    async fn list_ondeck(
        &self,
        episodes_ahead: u32,
        days_to_monitor: u32,
        skip_users: Vec<String>,
    ) -> Result<Vec<OnDeckItem>, UpstreamError>;

    /// Watchlist titles resolved to library files; shows expand to up to
    /// `episodes_per_show` unwatched episodes in chronological order.
    async fn list_watchlist(
        &self,
        episodes_per_show: u32,
        skip_users: Vec<String>,
    ) -> Result<Vec<WatchlistItem>, UpstreamError>;

    /// Snapshot of current playback.
    async fn list_sessions(&self) -> Result<Vec<Session>, UpstreamError>;

    /// Paths of watched library files in the given sections (all when empty).
    async fn list_watched_files(
        &self,
        library_sections: Vec<i64>,
    ) -> Result<Vec<PathBuf>, UpstreamError>;

    /// Lightweight cycle gate.
    async fn has_active_sessions(&self) -> Result<bool, UpstreamError>;

    /// Trending titles resolved to library files. Optional; servers without
    /// a trending source report nothing.
    async fn list_trending(&self, _count: usize) -> Result<Vec<WatchlistItem>, UpstreamError> {
        Ok(Vec::new())
    }
}
