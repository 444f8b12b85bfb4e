//! Prior-sync state: pairing and per-record baselines.
//!
//! The baseline is the last state both sides agreed on. A record whose
//! fingerprint still matches its baseline has not changed since then.

use crate::error::{SyncError, SyncResult};
use hotsync_storage::{FourCc, Preference, PreferenceKey, Record, RecordId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// SHA-256 digest of a record or block, serialized as hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of a record's payload, category and secret bit.
    #[must_use]
    pub fn of_record(record: &Record) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([record.category.as_u8(), u8::from(record.attributes.secret)]);
        hasher.update(&record.data);
        Self(hasher.finalize().into())
    }

    /// Fingerprint of an opaque block.
    #[must_use]
    pub fn of_block(block: &[u8]) -> Self {
        Self(Sha256::digest(block).into())
    }

    /// Fingerprint of a preference's version and data.
    #[must_use]
    pub fn of_preference(preference: &Preference) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(preference.version.to_be_bytes());
        hasher.update(&preference.data);
        Self(hasher.finalize().into())
    }

    /// Raw digest.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid fingerprint: {s}")))
    }
}

/// Prior-sync state of one database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbSyncMetadata {
    /// Database name.
    pub name: String,
    /// PC identifier of the desktop that synced it.
    pub pc_identifier: u32,
    /// Time of the last successful sync, seconds since the Unix epoch.
    pub last_sync: i64,
    /// Per-record baseline.
    #[serde(default)]
    pub records: BTreeMap<RecordId, Fingerprint>,
    /// Baseline of the app info block, if one existed.
    #[serde(default)]
    pub app_info: Option<Fingerprint>,
}

impl DbSyncMetadata {
    /// Empty metadata for a database that was never synced.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Returns true if a sync with this database completed before.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.last_sync != 0
    }

    /// Baseline fingerprint of a record.
    #[must_use]
    pub fn baseline(&self, id: RecordId) -> Option<Fingerprint> {
        self.records.get(&id).copied()
    }
}

/// Baseline of one preference block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceBaseline {
    /// Block key.
    pub key: PreferenceKey,
    /// Fingerprint at the last sync.
    pub fingerprint: Fingerprint,
}

/// Everything remembered about one creator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatorMetadata {
    /// Creator.
    pub creator: FourCc,
    /// Per-database state, by database name.
    #[serde(default)]
    pub databases: BTreeMap<String, DbSyncMetadata>,
    /// Preference baselines.
    #[serde(default)]
    pub preferences: Vec<PreferenceBaseline>,
}

impl CreatorMetadata {
    /// Empty metadata for a creator.
    pub fn new(creator: FourCc) -> Self {
        Self {
            creator,
            ..Self::default()
        }
    }

    /// Metadata of a database, if it was ever synced.
    #[must_use]
    pub fn database(&self, name: &str) -> Option<&DbSyncMetadata> {
        self.databases.get(name)
    }

    /// Stores the metadata of a database.
    pub fn set_database(&mut self, metadata: DbSyncMetadata) {
        self.databases.insert(metadata.name.clone(), metadata);
    }

    /// Baseline of a preference block.
    #[must_use]
    pub fn preference_baseline(&self, key: PreferenceKey) -> Option<Fingerprint> {
        self.preferences
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.fingerprint)
    }

    /// Sets or clears the baseline of a preference block.
    pub fn set_preference_baseline(&mut self, key: PreferenceKey, fingerprint: Option<Fingerprint>) {
        self.preferences.retain(|p| p.key != key);
        if let Some(fingerprint) = fingerprint {
            self.preferences.push(PreferenceBaseline { key, fingerprint });
            self.preferences.sort_by_key(|p| p.key);
        }
    }
}

/// Where prior-sync state is kept.
pub trait MetadataStore {
    /// Loads the metadata of a creator, empty if none was saved.
    fn load(&self, creator: FourCc) -> SyncResult<CreatorMetadata>;

    /// Saves the metadata of a creator.
    fn save(&mut self, metadata: &CreatorMetadata) -> SyncResult<()>;
}

/// In-memory metadata, for tests and one-shot sessions.
#[derive(Debug, Default, Clone)]
pub struct MemoryMetadataStore {
    entries: BTreeMap<FourCc, CreatorMetadata>,
}

impl MemoryMetadataStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets everything about a creator, forcing its next sync to be slow.
    pub fn forget(&mut self, creator: FourCc) {
        self.entries.remove(&creator);
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn load(&self, creator: FourCc) -> SyncResult<CreatorMetadata> {
        Ok(self
            .entries
            .get(&creator)
            .cloned()
            .unwrap_or_else(|| CreatorMetadata::new(creator)))
    }

    fn save(&mut self, metadata: &CreatorMetadata) -> SyncResult<()> {
        self.entries.insert(metadata.creator, metadata.clone());
        Ok(())
    }
}

/// JSON files, one per creator, in a directory.
#[derive(Debug, Clone)]
pub struct JsonMetadataStore {
    dir: PathBuf,
}

impl JsonMetadataStore {
    /// Uses `dir`, creating it on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, creator: FourCc) -> PathBuf {
        self.dir.join(format!("{:08x}.sync.json", creator.as_u32()))
    }
}

impl MetadataStore for JsonMetadataStore {
    fn load(&self, creator: FourCc) -> SyncResult<CreatorMetadata> {
        let path = self.path_for(creator);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CreatorMetadata::new(creator));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::metadata(format!("{}: {e}", path.display())))
    }

    fn save(&mut self, metadata: &CreatorMetadata) -> SyncResult<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(metadata.creator);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(metadata)
            .map_err(|e| SyncError::metadata(e.to_string()))?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        tracing::debug!(creator = %metadata.creator, path = %path.display(), "saved sync metadata");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotsync_storage::{CategoryId, RecordAttributes};
    use tempfile::tempdir;

    fn record(data: &[u8], category: u8, secret: bool) -> Record {
        Record {
            id: RecordId::new(9),
            index: 3,
            category: CategoryId::new(category).unwrap(),
            attributes: RecordAttributes {
                secret,
                ..RecordAttributes::default()
            },
            data: data.to_vec(),
            modified_at: None,
        }
    }

    #[test]
    fn fingerprint_covers_category_and_secret() {
        let base = Fingerprint::of_record(&record(b"abc", 0, false));
        assert_eq!(base, Fingerprint::of_record(&record(b"abc", 0, false)));
        assert_ne!(base, Fingerprint::of_record(&record(b"abc", 1, false)));
        assert_ne!(base, Fingerprint::of_record(&record(b"abc", 0, true)));
        assert_ne!(base, Fingerprint::of_record(&record(b"abd", 0, false)));

        // Dirty bit and index are not content.
        let mut moved = record(b"abc", 0, false);
        moved.index = 0;
        moved.attributes.dirty = true;
        assert_eq!(base, Fingerprint::of_record(&moved));
    }

    #[test]
    fn hex_roundtrip() {
        let fp = Fingerprint::of_block(b"block");
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()), Some(fp));
        assert_eq!(Fingerprint::from_hex("zz"), None);
    }

    #[test]
    fn preference_baselines() {
        let mut meta = CreatorMetadata::new(FourCc::from_bytes(*b"memo"));
        let key = PreferenceKey {
            id: 1,
            backed_up: true,
        };
        let fp = Fingerprint::of_block(b"x");
        meta.set_preference_baseline(key, Some(fp));
        assert_eq!(meta.preference_baseline(key), Some(fp));
        meta.set_preference_baseline(key, None);
        assert_eq!(meta.preference_baseline(key), None);
    }

    #[test]
    fn json_store_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = JsonMetadataStore::new(dir.path().join("meta"));
        let creator = FourCc::from_bytes(*b"memo");
        assert_eq!(store.load(creator).unwrap(), CreatorMetadata::new(creator));

        let mut meta = CreatorMetadata::new(creator);
        let mut db = DbSyncMetadata::new("MemoDB");
        db.pc_identifier = 42;
        db.last_sync = 1_000;
        db.records
            .insert(RecordId::new(5), Fingerprint::of_block(b"five"));
        db.app_info = Some(Fingerprint::of_block(b"info"));
        meta.set_database(db);
        store.save(&meta).unwrap();

        let loaded = store.load(creator).unwrap();
        assert_eq!(loaded, meta);
        assert!(loaded.database("MemoDB").unwrap().has_synced());
    }

    #[test]
    fn malformed_json_is_a_metadata_error() {
        let dir = tempdir().unwrap();
        let store = JsonMetadataStore::new(dir.path());
        let creator = FourCc::from_bytes(*b"memo");
        fs::write(store.path_for(creator), b"[1, 2").unwrap();
        assert!(matches!(store.load(creator), Err(SyncError::Metadata(_))));
    }
}
