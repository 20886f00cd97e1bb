//! Per-guild bot settings, one document per guild.

use crate::error::{DataError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shelf_engine::{Collection, Error as EngineError, ID_FIELD};
use tracing::debug;

/// Collection holding guild settings.
pub const COLLECTION: &str = "guild_settings";

/// Loudest volume a guild may configure, in percent.
pub const MAX_VOLUME: u16 = 200;

/// Settings for one guild. Fields missing from a stored document take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuildSettings {
    pub guild_id: String,
    pub prefix: String,
    pub volume: u16,
    pub dj_role: Option<String>,
    pub announce_tracks: bool,
    pub stay_connected: bool,
    pub autoplay: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for GuildSettings {
    fn default() -> Self {
        Self {
            guild_id: String::new(),
            prefix: "!".to_string(),
            volume: 100,
            dj_role: None,
            announce_tracks: true,
            stay_connected: false,
            autoplay: false,
            updated_at: None,
        }
    }
}

impl GuildSettings {
    /// Default settings for a guild.
    pub fn new(guild_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            ..Self::default()
        }
    }
}

/// Guild settings stored in a shelf collection, looked up by `guildId`.
///
/// New documents use the guild id as their `_id`, so concurrent first saves
/// for one guild cannot create two documents.
#[derive(Debug, Clone)]
pub struct GuildSettingsRepo {
    collection: Collection,
}

impl GuildSettingsRepo {
    pub fn new(collection: Collection) -> Result<Self> {
        collection.ensure_index("guildId")?;
        Ok(Self { collection })
    }

    /// Stored settings, or the defaults when the guild has none.
    pub fn get(&self, guild_id: &str) -> Result<GuildSettings> {
        match self.collection.find_one(&json!({"guildId": guild_id}))? {
            Some(doc) => Ok(serde_json::from_value(Value::Object(doc))?),
            None => Ok(GuildSettings::new(guild_id)),
        }
    }

    /// Insert or replace a guild's settings.
    pub fn save(&self, settings: &GuildSettings) -> Result<GuildSettings> {
        if settings.guild_id.is_empty() {
            return Err(DataError::InvalidInput("guild id is empty".into()));
        }
        if settings.volume > MAX_VOLUME {
            return Err(DataError::InvalidInput(format!(
                "volume {} exceeds {}",
                settings.volume, MAX_VOLUME
            )));
        }

        let mut saved = settings.clone();
        saved.updated_at = Some(Utc::now());
        let value = serde_json::to_value(&saved)?;

        let query = json!({"guildId": saved.guild_id});
        if self.collection.update(&query, &value)? > 0 {
            return Ok(saved);
        }

        let mut keyed = value.clone();
        if let Value::Object(doc) = &mut keyed {
            doc.insert(ID_FIELD.to_string(), Value::String(saved.guild_id.clone()));
        }
        match self.collection.insert(keyed) {
            Ok(_) => debug!(guild = %saved.guild_id, "Created guild settings"),
            // Another save created it first
            Err(EngineError::DuplicateKey(_)) => {
                self.collection.update(&query, &value)?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(saved)
    }

    pub fn set_volume(&self, guild_id: &str, volume: u16) -> Result<GuildSettings> {
        let mut settings = self.get(guild_id)?;
        settings.volume = volume;
        self.save(&settings)
    }

    /// Forget a guild's settings. Returns whether any were stored.
    pub fn reset(&self, guild_id: &str) -> Result<bool> {
        Ok(self.collection.delete(&json!({"guildId": guild_id}))? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_engine::Options;

    fn repo(dir: &std::path::Path) -> GuildSettingsRepo {
        let collection =
            Collection::open(COLLECTION, dir, Options::default().with_watch_files(false)).unwrap();
        GuildSettingsRepo::new(collection).unwrap()
    }

    #[test]
    fn defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let guilds = repo(dir.path());
        let settings = guilds.get("g1").unwrap();
        assert_eq!(settings, GuildSettings::new("g1"));
        assert_eq!(settings.prefix, "!");
    }

    #[test]
    fn save_is_an_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let guilds = repo(dir.path());

        let mut settings = GuildSettings::new("g1");
        settings.prefix = "?".into();
        guilds.save(&settings).unwrap();
        settings.dj_role = Some("dj".into());
        guilds.save(&settings).unwrap();

        let stored = guilds.get("g1").unwrap();
        assert_eq!(stored.prefix, "?");
        assert_eq!(stored.dj_role.as_deref(), Some("dj"));
        assert!(stored.updated_at.is_some());
        assert_eq!(guilds.collection.count(&json!({})).unwrap(), 1);
    }

    #[test]
    fn concurrent_first_saves_store_one_document() {
        let dir = tempfile::tempdir().unwrap();
        let guilds = repo(dir.path());
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16u16)
            .map(|i| {
                let guilds = guilds.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let mut settings = GuildSettings::new("g1");
                    settings.volume = i;
                    barrier.wait();
                    guilds.save(&settings)
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(guilds.collection.count(&json!({})).unwrap(), 1);
        assert!(guilds.collection.find_by_id("g1").unwrap().is_some());
        assert!(guilds.get("g1").unwrap().volume < 16);
    }

    #[test]
    fn volume_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let guilds = repo(dir.path());
        assert_eq!(guilds.set_volume("g1", 150).unwrap().volume, 150);
        assert!(matches!(
            guilds.set_volume("g1", 500),
            Err(DataError::InvalidInput(_))
        ));
        assert_eq!(guilds.get("g1").unwrap().volume, 150);
    }

    #[test]
    fn reset_restores_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let guilds = repo(dir.path());
        guilds.set_volume("g1", 10).unwrap();

        assert!(guilds.reset("g1").unwrap());
        assert!(!guilds.reset("g1").unwrap());
        assert_eq!(guilds.get("g1").unwrap().volume, 100);
    }

    #[test]
    fn old_documents_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let guilds = repo(dir.path());
        guilds
            .collection
            .insert(json!({"guildId": "legacy", "prefix": "$"}))
            .unwrap();

        let settings = guilds.get("legacy").unwrap();
        assert_eq!(settings.prefix, "$");
        assert_eq!(settings.volume, 100);
        assert!(settings.announce_tracks);
    }
}
