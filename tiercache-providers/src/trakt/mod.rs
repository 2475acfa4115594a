//! Trakt.tv client (trending content)

pub mod client;

pub use client::{TraktClient, TraktError, TrendingMovie};
