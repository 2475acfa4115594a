//! tiercache core
//!
//! Decides which media files live on a fast cache tier and which stay on
//! the slow bulk array, driven by upstream on-deck, watchlist, and playback
//! activity. The [`manager::CacheManager`] façade binds the pieces: three
//! persistent trackers, a priority scorer, an atomic file mover, the cycle
//! orchestrator, a real-time session monitor, and a startup reconciler.

pub mod config;
pub mod cycle;
pub mod disk;
pub mod error;
pub mod logging;
pub mod manager;
pub mod models;
pub mod monitor;
pub mod mover;
pub mod reconcile;
pub mod scorer;
pub mod tracker;
pub mod upstream;

pub use config::Config;
pub use error::{Error, Result};
pub use manager::CacheManager;
pub use models::{
    CacheHealth, CacheMethod, CacheSource, CacheStats, CycleSummary, EpisodeInfo, EvictionResult,
    OnDeckItem, PlaybackState, ReconciliationResult, Session, WatchlistItem,
};
pub use upstream::{MediaServer, PlexMediaServer, UpstreamError};
