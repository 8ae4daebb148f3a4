//! Collection-scoped record store on the local filesystem.
//!
//! Layout: `<root>/<collection>/<id>.json`, one pretty-printed JSON record
//! per file. Backups live under `<root>/backups/`.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::archive;
use crate::error::{StoreError, StoreResult};

/// File extension used for every record.
pub const RECORD_EXTENSION: &str = "json";

/// Directory (under the store root) that holds backup archives.
pub const BACKUP_DIR: &str = "backups";

/// Filesystem-backed key/value store scoped by collection.
///
/// Writes go to a temp file in the collection directory and are renamed
/// into place, so a reader never observes a half-written record. A single
/// `RwLock` per store serialises mutations while letting reads proceed
/// concurrently.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    lock: RwLock<()>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "file store opened");
        Ok(Self {
            root,
            lock: RwLock::new(()),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding backup archives.
    pub fn backup_dir(&self) -> PathBuf {
        self.root.join(BACKUP_DIR)
    }

    fn collection_dir(&self, collection: &str) -> StoreResult<PathBuf> {
        validate_key(collection)?;
        if collection == BACKUP_DIR {
            return Err(StoreError::InvalidKey(format!(
                "collection name '{BACKUP_DIR}' is reserved"
            )));
        }
        Ok(self.root.join(collection))
    }

    fn record_path(&self, collection: &str, id: &str) -> StoreResult<PathBuf> {
        let dir = self.collection_dir(collection)?;
        validate_key(id)?;
        Ok(dir.join(format!("{id}.{RECORD_EXTENSION}")))
    }

    /// Persist `value` under `collection/id`, replacing any previous record.
    pub fn save<T: Serialize>(&self, collection: &str, id: &str, value: &T) -> StoreResult<()> {
        let path = self.record_path(collection, id)?;
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let _guard = self.lock.write();
        let dir = self.collection_dir(collection)?;
        fs::create_dir_all(&dir)?;
        write_atomic(&dir, &path, &bytes)?;
        debug!(collection, id, bytes = bytes.len(), "record saved");
        Ok(())
    }

    /// Load the record stored under `collection/id`.
    pub fn load<T: DeserializeOwned>(&self, collection: &str, id: &str) -> StoreResult<T> {
        let path = self.record_path(collection, id)?;

        let bytes = {
            let _guard = self.lock.read();
            fs::read(&path).map_err(|e| not_found_or_io(e, collection, id))?
        };

        serde_json::from_slice(&bytes).map_err(|e| StoreError::Deserialization {
            collection: collection.to_string(),
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Whether a record exists.
    pub fn contains(&self, collection: &str, id: &str) -> StoreResult<bool> {
        let path = self.record_path(collection, id)?;
        let _guard = self.lock.read();
        Ok(path.is_file())
    }

    /// Remove the record under `collection/id`.
    pub fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        let path = self.record_path(collection, id)?;
        let _guard = self.lock.write();
        fs::remove_file(&path).map_err(|e| not_found_or_io(e, collection, id))?;
        debug!(collection, id, "record deleted");
        Ok(())
    }

    /// List record ids in `collection`, sorted ascending.
    ///
    /// Subdirectories, temp files and files with other extensions are
    /// ignored. A collection that was never written lists as empty.
    pub fn list(&self, collection: &str) -> StoreResult<Vec<String>> {
        let dir = self.collection_dir(collection)?;
        let _guard = self.lock.read();
        list_record_ids(&dir)
    }

    /// Write a time-stamped `tar.gz` archive of `collection` and return its path.
    pub fn backup(&self, collection: &str) -> StoreResult<PathBuf> {
        let dir = self.collection_dir(collection)?;
        let backup_dir = self.backup_dir();
        fs::create_dir_all(&backup_dir)?;

        let _guard = self.lock.read();
        let ids = list_record_ids(&dir)?;
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let archive_path = unique_archive_path(&backup_dir, collection, &stamp);

        archive::write_collection(&archive_path, collection, &dir, &ids)?;
        info!(
            collection,
            records = ids.len(),
            archive = %archive_path.display(),
            "collection backed up"
        );
        Ok(archive_path)
    }

    /// Replace the contents of `collection` with the records in `archive`.
    ///
    /// The archive is fully read and validated before the collection is
    /// touched; an invalid archive leaves the collection unchanged.
    /// Returns the number of records restored.
    pub fn restore(&self, archive_path: &Path, collection: &str) -> StoreResult<usize> {
        let dir = self.collection_dir(collection)?;
        let records = archive::read_collection(archive_path, collection)?;
        for (id, _) in &records {
            validate_key(id)?;
        }

        let restored = self.replace_collection(&dir, records.into_iter().map(Ok))?;
        info!(
            collection,
            records = restored,
            archive = %archive_path.display(),
            "collection restored"
        );
        Ok(restored)
    }

    /// Write `records` into a staging directory next to `dir`, then swap it
    /// in with renames. Any failure before the swap leaves `dir` untouched.
    fn replace_collection<I>(&self, dir: &Path, records: I) -> StoreResult<usize>
    where
        I: IntoIterator<Item = StoreResult<(String, Vec<u8>)>>,
    {
        let _guard = self.lock.write();
        let staging = tempfile::Builder::new()
            .prefix(".restore-")
            .tempdir_in(&self.root)?;
        let mut count = 0;
        for record in records {
            let (id, bytes) = record?;
            let path = staging.path().join(format!("{id}.{RECORD_EXTENSION}"));
            write_atomic(staging.path(), &path, &bytes)?;
            count += 1;
        }

        // The retired copy lives inside its own temp dir so it is removed
        // on drop once the new collection is in place.
        let retired = tempfile::Builder::new()
            .prefix(".retired-")
            .tempdir_in(&self.root)?;
        let old = retired.path().join("collection");
        let had_old = match fs::rename(dir, &old) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = fs::rename(staging.path(), dir) {
            if had_old {
                fs::rename(&old, dir)?;
            }
            return Err(e.into());
        }
        Ok(count)
    }
}

/// Reject anything that is not a single, visible path segment.
pub fn validate_key(key: &str) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key must not be empty".to_string()));
    }
    if key == "." || key == ".." || key.starts_with('.') {
        return Err(StoreError::InvalidKey(format!(
            "key must not start with '.': {key}"
        )));
    }
    if key.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidKey(format!(
            "key must not contain path separators: {key}"
        )));
    }
    Ok(())
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn not_found_or_io(err: std::io::Error, collection: &str, id: &str) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    } else {
        StoreError::Io(err)
    }
}

pub(crate) fn list_record_ids(dir: &Path) -> StoreResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if validate_key(stem).is_ok() {
            ids.push(stem.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

fn unique_archive_path(backup_dir: &Path, collection: &str, stamp: &str) -> PathBuf {
    let first = backup_dir.join(format!("{collection}_{stamp}.tar.gz"));
    if !first.exists() {
        return first;
    }
    let mut n = 1u32;
    loop {
        let candidate = backup_dir.join(format!("{collection}_{stamp}_{n}.tar.gz"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        name: String,
        count: u32,
    }

    fn make_store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, store) = make_store();
        let item = Item {
            name: "alpha".into(),
            count: 3,
        };
        store.save("items", "a1", &item).unwrap();
        let loaded: Item = store.load("items", "a1").unwrap();
        assert_eq!(loaded, item);
    }

    #[test]
    fn test_layout_on_disk() {
        let (dir, store) = make_store();
        store.save("items", "a1", &1u32).unwrap();
        assert!(dir.path().join("items").join("a1.json").is_file());
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let (_dir, store) = make_store();
        let err = store.load::<Item>("items", "missing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let (_dir, store) = make_store();
        let err = store.delete("items", "missing").unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_corrupt_record_is_deserialization_error() {
        let (dir, store) = make_store();
        fs::create_dir_all(dir.path().join("items")).unwrap();
        fs::write(dir.path().join("items").join("bad.json"), b"{not json").unwrap();
        let err = store.load::<Item>("items", "bad").unwrap_err();
        assert!(matches!(err, StoreError::Deserialization { .. }));
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let (_dir, store) = make_store();
        for key in ["", "..", ".hidden", "a/b", "a\\b"] {
            let err = store.save("items", key, &1u32).unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey(_)), "key {key:?}");
        }
        let err = store.save(BACKUP_DIR, "x", &1u32).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[test]
    fn test_list_ignores_noise() {
        let (dir, store) = make_store();
        store.save("items", "b", &2u32).unwrap();
        store.save("items", "a", &1u32).unwrap();
        let col = dir.path().join("items");
        fs::create_dir_all(col.join("nested.json")).unwrap();
        fs::write(col.join("notes.txt"), b"x").unwrap();
        fs::write(col.join(".tmpXYZ"), b"x").unwrap();

        assert_eq!(store.list("items").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_list_unknown_collection_is_empty() {
        let (_dir, store) = make_store();
        assert!(store.list("never_written").unwrap().is_empty());
    }

    #[test]
    fn test_failed_restore_leaves_collection_intact() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save("patterns", "a", &serde_json::json!({"v": 1})).unwrap();
        store.save("patterns", "b", &serde_json::json!({"v": 2})).unwrap();

        let records: Vec<StoreResult<(String, Vec<u8>)>> = vec![
            Ok(("c".to_string(), b"{}".to_vec())),
            Err(StoreError::Archive("truncated archive".to_string())),
            Ok(("d".to_string(), b"{}".to_vec())),
        ];
        let collection = store.collection_dir("patterns").unwrap();
        assert!(store.replace_collection(&collection, records).is_err());

        assert_eq!(store.list("patterns").unwrap(), vec!["a", "b"]);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn test_replace_collection_swaps_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save("patterns", "a", &serde_json::json!({"v": 1})).unwrap();

        let collection = store.collection_dir("patterns").unwrap();
        let records: Vec<StoreResult<(String, Vec<u8>)>> = vec![Ok(("c".to_string(), b"{\"v\":3}".to_vec()))];
        assert_eq!(store.replace_collection(&collection, records).unwrap(), 1);
        assert_eq!(store.list("patterns").unwrap(), vec!["c"]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_unique_archive_path_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_archive_path(dir.path(), "items", "20240101_000000");
        fs::write(&first, b"").unwrap();
        let second = unique_archive_path(dir.path(), "items", "20240101_000000");
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_1.tar.gz"));
    }
}
