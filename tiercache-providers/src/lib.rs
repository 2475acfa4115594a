//! Upstream HTTP clients for tiercache.
//!
//! Pure HTTP layer: no tracker or mover types leak in here. The core crate
//! adapts these clients to its own `MediaServer` trait.

pub mod plex;
pub mod trakt;

pub use plex::{PlexClient, PlexError};
pub use trakt::{TraktClient, TraktError};
