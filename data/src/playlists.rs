//! User playlists, one document per playlist keyed by owner and name.

use crate::error::{DataError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shelf_engine::{Collection, Document, Error as EngineError, ID_FIELD};
use tracing::{debug, info};

/// Collection holding playlists.
pub const COLLECTION: &str = "playlists";

/// Most tracks one playlist may hold.
pub const MAX_TRACKS: usize = 500;

/// Longest accepted playlist name, in characters.
pub const MAX_NAME_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub title: String,
    pub uri: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub length_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub owner_id: String,
    pub name: String,
    /// Compact shard encoding drops empty arrays, so this may be absent on disk
    #[serde(default)]
    pub tracks: Vec<Track>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Playlist {
    /// Total length of every track.
    pub fn duration_ms(&self) -> u64 {
        self.tracks.iter().map(|t| t.length_ms).sum()
    }
}

/// Playlists stored in a shelf collection.
///
/// A playlist's `_id` is `"{owner}:{name}"`, so the collection's key check is
/// what keeps names unique per owner. Names are trimmed on every call.
#[derive(Debug, Clone)]
pub struct PlaylistRepo {
    collection: Collection,
}

impl PlaylistRepo {
    pub fn new(collection: Collection) -> Result<Self> {
        collection.ensure_index("ownerId")?;
        collection.ensure_index("name")?;
        Ok(Self { collection })
    }

    /// Create an empty playlist. An owner cannot have two with the same name.
    pub fn create(&self, owner_id: &str, name: &str) -> Result<Playlist> {
        validate_owner(owner_id)?;
        let name = validate_name(name)?;
        // Documents written before keyed ids carry a random `_id`
        if self.find_doc(owner_id, &name)?.is_some() {
            return Err(DataError::AlreadyExists(format!("playlist {name:?}")));
        }

        let now = Utc::now();
        let playlist = Playlist {
            owner_id: owner_id.to_string(),
            name,
            tracks: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.insert_keyed(&playlist)?;
        info!(owner = %owner_id, playlist = %playlist.name, "Created playlist");
        Ok(playlist)
    }

    /// Look up a playlist by owner and (trimmed) name.
    pub fn get(&self, owner_id: &str, name: &str) -> Result<Option<Playlist>> {
        match self.find_doc(owner_id, name)? {
            Some(doc) => Ok(Some(serde_json::from_value(Value::Object(doc))?)),
            None => Ok(None),
        }
    }

    /// Every playlist of an owner, sorted by name.
    pub fn list(&self, owner_id: &str) -> Result<Vec<Playlist>> {
        let mut playlists = self
            .collection
            .find(&json!({"ownerId": owner_id}))?
            .into_iter()
            .map(|doc| serde_json::from_value::<Playlist>(Value::Object(doc)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        playlists.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(playlists)
    }

    /// Append tracks, failing if the playlist would grow past [`MAX_TRACKS`].
    pub fn add_tracks(&self, owner_id: &str, name: &str, tracks: Vec<Track>) -> Result<Playlist> {
        let mut playlist = self.require(owner_id, name)?;
        if playlist.tracks.len() + tracks.len() > MAX_TRACKS {
            return Err(DataError::InvalidInput(format!(
                "playlist {name:?} would exceed {MAX_TRACKS} tracks"
            )));
        }
        playlist.tracks.extend(tracks);
        self.write_tracks(&mut playlist)?;
        Ok(playlist)
    }

    /// Remove the track at `index` and return it.
    pub fn remove_track(&self, owner_id: &str, name: &str, index: usize) -> Result<Track> {
        let mut playlist = self.require(owner_id, name)?;
        if index >= playlist.tracks.len() {
            return Err(DataError::InvalidInput(format!(
                "track {index} out of range for playlist {name:?}"
            )));
        }
        let removed = playlist.tracks.remove(index);
        self.write_tracks(&mut playlist)?;
        Ok(removed)
    }

    /// Give a playlist a new name. The renamed playlist gets the new keyed `_id`.
    pub fn rename(&self, owner_id: &str, name: &str, new_name: &str) -> Result<Playlist> {
        validate_owner(owner_id)?;
        let new_name = validate_name(new_name)?;
        let mut playlist = self.require(owner_id, name)?;
        let old_name = playlist.name.clone();
        playlist.updated_at = Utc::now();

        if new_name == old_name {
            self.collection.update(
                &json!({"ownerId": owner_id, "name": old_name}),
                &json!({"updatedAt": playlist.updated_at}),
            )?;
            return Ok(playlist);
        }
        if self.find_doc(owner_id, &new_name)?.is_some() {
            return Err(DataError::AlreadyExists(format!("playlist {new_name:?}")));
        }

        playlist.name = new_name;
        self.insert_keyed(&playlist)?;
        self.collection
            .delete(&json!({"ownerId": owner_id, "name": old_name}))?;
        debug!(owner = %owner_id, from = %old_name, to = %playlist.name, "Renamed playlist");
        Ok(playlist)
    }

    /// Delete a playlist. Returns whether it existed.
    pub fn delete(&self, owner_id: &str, name: &str) -> Result<bool> {
        Ok(self
            .collection
            .delete(&json!({"ownerId": owner_id, "name": name.trim()}))?
            > 0)
    }

    fn find_doc(&self, owner_id: &str, name: &str) -> Result<Option<Document>> {
        Ok(self
            .collection
            .find_one(&json!({"ownerId": owner_id, "name": name.trim()}))?)
    }

    fn insert_keyed(&self, playlist: &Playlist) -> Result<()> {
        let mut value = serde_json::to_value(playlist)?;
        if let Value::Object(doc) = &mut value {
            doc.insert(
                ID_FIELD.to_string(),
                Value::String(playlist_id(&playlist.owner_id, &playlist.name)),
            );
        }
        match self.collection.insert(value) {
            Ok(_) => Ok(()),
            Err(EngineError::DuplicateKey(_)) => Err(DataError::AlreadyExists(format!(
                "playlist {:?}",
                playlist.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn require(&self, owner_id: &str, name: &str) -> Result<Playlist> {
        self.get(owner_id, name)?
            .ok_or_else(|| DataError::NotFound(format!("playlist {name:?}")))
    }

    fn write_tracks(&self, playlist: &mut Playlist) -> Result<()> {
        playlist.updated_at = Utc::now();
        self.collection.update(
            &json!({"ownerId": playlist.owner_id, "name": playlist.name}),
            &json!({"tracks": playlist.tracks, "updatedAt": playlist.updated_at}),
        )?;
        Ok(())
    }
}

fn playlist_id(owner_id: &str, name: &str) -> String {
    format!("{owner_id}:{name}")
}

/// Owner ids form the first half of a playlist's `_id`.
fn validate_owner(owner_id: &str) -> Result<()> {
    if owner_id.is_empty() || owner_id.contains(':') {
        return Err(DataError::InvalidInput(format!("invalid owner id {owner_id:?}")));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(DataError::InvalidInput("playlist name is empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(DataError::InvalidInput(format!(
            "playlist name longer than {MAX_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_engine::Options;

    fn repo(dir: &std::path::Path) -> PlaylistRepo {
        let collection =
            Collection::open(COLLECTION, dir, Options::default().with_watch_files(false)).unwrap();
        PlaylistRepo::new(collection).unwrap()
    }

    fn track(n: u64) -> Track {
        Track {
            title: format!("Song {n}"),
            uri: format!("https://example.com/{n}"),
            author: "Artist".into(),
            length_ms: 1000 * n,
        }
    }

    #[test]
    fn create_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let playlists = repo(dir.path());
        playlists.create("u1", "Road trip").unwrap();

        assert!(matches!(
            playlists.create("u1", " Road trip "),
            Err(DataError::AlreadyExists(_))
        ));
        // Same name, different owner
        playlists.create("u2", "Road trip").unwrap();
    }

    #[test]
    fn names_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let playlists = repo(dir.path());
        assert!(matches!(playlists.create("u1", "  "), Err(DataError::InvalidInput(_))));
        assert!(playlists.create("u1", &"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(matches!(playlists.create("", "mix"), Err(DataError::InvalidInput(_))));
        assert!(matches!(playlists.create("u:1", "mix"), Err(DataError::InvalidInput(_))));
    }

    #[test]
    fn names_are_trimmed_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let playlists = repo(dir.path());
        playlists.create("u1", " mix ").unwrap();

        assert_eq!(playlists.get("u1", "mix").unwrap().unwrap().name, "mix");
        assert!(playlists.get("u1", " mix ").unwrap().is_some());
        playlists.add_tracks("u1", "  mix", vec![track(1), track(2)]).unwrap();
        assert_eq!(playlists.remove_track("u1", "mix  ", 0).unwrap(), track(1));
        playlists.rename("u1", " mix ", " tape ").unwrap();
        assert_eq!(playlists.get("u1", "tape ").unwrap().unwrap().tracks, vec![track(2)]);
        assert!(playlists.delete("u1", " tape").unwrap());
        assert!(playlists.list("u1").unwrap().is_empty());
    }

    #[test]
    fn concurrent_creates_keep_one_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let playlists = repo(dir.path());
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let playlists = playlists.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    playlists.create("u1", "mix")
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, DataError::AlreadyExists(_))));
        assert_eq!(playlists.list("u1").unwrap().len(), 1);
        assert!(playlists.collection.find_by_id("u1:mix").unwrap().is_some());
    }

    #[test]
    fn tracks_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let playlists = repo(dir.path());
        playlists.create("u1", "mix").unwrap();

        let playlist = playlists.add_tracks("u1", "mix", vec![track(1), track(2), track(3)]).unwrap();
        assert_eq!(playlist.duration_ms(), 6000);

        let removed = playlists.remove_track("u1", "mix", 1).unwrap();
        assert_eq!(removed, track(2));

        let stored = playlists.get("u1", "mix").unwrap().unwrap();
        assert_eq!(stored.tracks, vec![track(1), track(3)]);
        assert!(stored.updated_at >= stored.created_at);

        assert!(matches!(
            playlists.remove_track("u1", "mix", 9),
            Err(DataError::InvalidInput(_))
        ));
    }

    #[test]
    fn track_limit() {
        let dir = tempfile::tempdir().unwrap();
        let playlists = repo(dir.path());
        playlists.create("u1", "big").unwrap();
        let tracks: Vec<Track> = (0..MAX_TRACKS as u64).map(track).collect();
        playlists.add_tracks("u1", "big", tracks).unwrap();

        assert!(playlists.add_tracks("u1", "big", vec![track(0)]).is_err());
    }

    #[test]
    fn missing_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let playlists = repo(dir.path());
        assert!(playlists.get("u1", "nope").unwrap().is_none());
        assert!(matches!(
            playlists.add_tracks("u1", "nope", vec![]),
            Err(DataError::NotFound(_))
        ));
        assert!(!playlists.delete("u1", "nope").unwrap());
    }

    #[test]
    fn rename_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let playlists = repo(dir.path());
        playlists.create("u1", "b").unwrap();
        playlists.create("u1", "c").unwrap();

        assert!(matches!(
            playlists.rename("u1", "b", "c"),
            Err(DataError::AlreadyExists(_))
        ));
        playlists.rename("u1", "b", "a").unwrap();
        assert!(playlists.collection.find_by_id("u1:a").unwrap().is_some());
        assert!(playlists.collection.find_by_id("u1:b").unwrap().is_none());

        let names: Vec<String> = playlists.list("u1").unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert!(playlists.get("u1", "b").unwrap().is_none());

        assert!(playlists.delete("u1", "a").unwrap());
        assert_eq!(playlists.list("u1").unwrap().len(), 1);
    }
}
