//! # Shelf Data
//!
//! The music bot's persistence layer: guild settings and user playlists stored
//! in shelf-engine collections, plus short-lived in-memory caches.
//!
//! ```no_run
//! use shelf_data::{Config, Context};
//!
//! # #[tokio::main]
//! # async fn main() -> shelf_data::Result<()> {
//! let ctx = Context::open(&Config::from_env()?)?;
//! ctx.guilds.set_volume("guild-1", 80)?;
//! ctx.playlists.create("user-1", "Road trip")?;
//! ctx.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod guilds;
pub mod playlists;

pub use cache::TtlCache;
pub use config::{Config, ConfigError};
pub use context::Context;
pub use error::{DataError, Result};
pub use guilds::{GuildSettings, GuildSettingsRepo};
pub use playlists::{Playlist, PlaylistRepo, Track};
