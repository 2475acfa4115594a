//! Plex HTTP client
//!
//! Thin client for the parts of the Plex API tiercache consumes:
//! - OnDeck discovery (per user)
//! - Watchlist fetching (plex.tv discover)
//! - Active session monitoring
//! - Library lookup and watched-status detection

pub mod client;
pub mod error;
pub mod types;

pub use client::PlexClient;
pub use error::PlexError;
pub use types::*;
