//! Shared state handed to every command handler.

use crate::cache::TtlCache;
use crate::config::Config;
use crate::error::Result;
use crate::guilds::{self, GuildSettingsRepo};
use crate::playlists::{self, PlaylistRepo, Track};
use shelf_engine::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Autocomplete results are reused for this long.
pub const AUTOCOMPLETE_TTL: Duration = Duration::from_secs(30);
pub const AUTOCOMPLETE_CAPACITY: usize = 1024;

/// How long a user's last track pick is remembered.
pub const RECENT_TRACK_TTL: Duration = Duration::from_secs(15 * 60);
pub const RECENT_TRACK_CAPACITY: usize = 4096;

/// Everything the bot needs at runtime, built once at startup.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<Store>,
    pub guilds: GuildSettingsRepo,
    pub playlists: PlaylistRepo,
    /// Search results keyed by `user:query`
    pub autocomplete: Arc<TtlCache<String, Vec<Track>>>,
    /// Last track each user picked
    pub recent_tracks: Arc<TtlCache<String, Track>>,
}

impl Context {
    /// Open the store and its collections. Must run inside a Tokio runtime.
    pub fn open(config: &Config) -> Result<Self> {
        let store = Arc::new(Store::open(config.db_root.clone(), config.options.clone())?);
        let guilds = GuildSettingsRepo::new(store.collection(guilds::COLLECTION)?)?;
        let playlists = PlaylistRepo::new(store.collection(playlists::COLLECTION)?)?;

        info!(root = %config.db_root.display(), "Data context ready");

        Ok(Self {
            store,
            guilds,
            playlists,
            autocomplete: Arc::new(TtlCache::new(AUTOCOMPLETE_CAPACITY, AUTOCOMPLETE_TTL)),
            recent_tracks: Arc::new(TtlCache::new(RECENT_TRACK_CAPACITY, RECENT_TRACK_TTL)),
        })
    }

    /// Cache key for an autocomplete lookup.
    pub fn autocomplete_key(user_id: &str, query: &str) -> String {
        format!("{}:{}", user_id, query.trim().to_lowercase())
    }

    /// Flush and close the store. The context is unusable afterwards.
    pub fn shutdown(&self) -> Result<()> {
        self.autocomplete.purge_expired();
        self.recent_tracks.purge_expired();
        self.store.close()?;
        info!("Data context shut down");
        Ok(())
    }
}
