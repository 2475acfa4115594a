//! Persistent file trackers.
//!
//! Three trackers share one skeleton: a concurrent map from the bulk-tier
//! path to a record, persisted as a JSON document per tracker. Loads are
//! best-effort (a corrupt file yields an empty tracker and a warning, never
//! a startup failure); writes go through a sibling temp file and an atomic
//! rename.

mod ondeck;
mod timestamp;
mod watchlist;

pub use ondeck::{OnDeckEntry, OnDeckTracker};
pub use timestamp::{CacheTimestampTracker, TimestampEntry};
pub use watchlist::{WatchlistEntry, WatchlistTracker};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Hook for upgrading legacy on-disk values that no longer deserialize as
/// `T`. Returning `None` drops the entry.
type MigrateFn<T> = fn(&str, &serde_json::Value) -> Option<T>;

/// Concurrent map persisted as a single JSON file.
pub struct TrackerFile<T> {
    file_path: PathBuf,
    name: &'static str,
    entries: RwLock<HashMap<PathBuf, T>>,
}

impl<T> TrackerFile<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Load a tracker from disk. A missing file starts empty; a corrupt file
    /// starts empty with a warning. `migrate` upgrades legacy value shapes;
    /// if anything was migrated the file is rewritten immediately.
    pub fn load(file_path: PathBuf, name: &'static str, migrate: MigrateFn<T>) -> Self {
        let mut entries = HashMap::new();
        let mut migrated = false;

        match std::fs::read(&file_path) {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, serde_json::Value>>(&bytes)
            {
                Ok(raw) => {
                    for (key, value) in raw {
                        match serde_json::from_value::<T>(value.clone()) {
                            Ok(entry) => {
                                entries.insert(PathBuf::from(key), entry);
                            }
                            Err(_) => {
                                if let Some(entry) = migrate(&key, &value) {
                                    entries.insert(PathBuf::from(key), entry);
                                    migrated = true;
                                } else {
                                    tracing::warn!(
                                        tracker = name,
                                        path = %key,
                                        "Dropping unreadable tracker entry"
                                    );
                                }
                            }
                        }
                    }
                    tracing::debug!(tracker = name, entries = entries.len(), "Tracker loaded");
                }
                Err(e) => {
                    tracing::warn!(tracker = name, error = %e, "Corrupt tracker file, starting empty");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(tracker = name, error = %e, "Could not read tracker file, starting empty");
            }
        }

        let tracker = Self {
            file_path,
            name,
            entries: RwLock::new(entries),
        };
        if migrated {
            tracing::info!(tracker = name, "Migrated legacy tracker format");
            tracker.persist();
        }
        tracker
    }

    pub fn get(&self, path: &Path) -> Option<T> {
        self.entries.read().get(path).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.read().contains_key(path)
    }

    /// Insert or replace, then persist.
    pub fn insert(&self, path: PathBuf, entry: T) {
        self.entries.write().insert(path, entry);
        self.persist();
    }

    /// Insert only if absent, then persist. Returns false when the key
    /// already existed (and nothing was written).
    pub fn insert_if_absent(&self, path: PathBuf, entry: T) -> bool {
        {
            let mut entries = self.entries.write();
            if entries.contains_key(&path) {
                return false;
            }
            entries.insert(path, entry);
        }
        self.persist();
        true
    }

    /// Remove an entry, then persist. Returns whether it existed.
    pub fn remove(&self, path: &Path) -> bool {
        let removed = self.entries.write().remove(path).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    /// Mutate the entry in place if present, then persist.
    pub fn update<F: FnOnce(&mut T)>(&self, path: &Path, f: F) -> bool {
        let updated = {
            let mut entries = self.entries.write();
            match entries.get_mut(path) {
                Some(entry) => {
                    f(entry);
                    true
                }
                None => false,
            }
        };
        if updated {
            self.persist();
        }
        updated
    }

    /// Mutate the entry, inserting `default()` first when absent; persists.
    pub fn upsert<D: FnOnce() -> T, F: FnOnce(&mut T)>(&self, path: &Path, default: D, f: F) {
        {
            let mut entries = self.entries.write();
            let entry = entries.entry(path.to_path_buf()).or_insert_with(default);
            f(entry);
        }
        self.persist();
    }

    /// Drop entries failing the predicate; persists when anything was
    /// removed. Returns the number removed.
    pub fn retain<F: FnMut(&Path, &T) -> bool>(&self, mut keep: F) -> usize {
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|path, entry| keep(path, entry));
            before - entries.len()
        };
        if removed > 0 {
            self.persist();
        }
        removed
    }

    /// Remove everything, then persist.
    pub fn clear(&self) {
        self.entries.write().clear();
        self.persist();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of all entries.
    pub fn snapshot(&self) -> HashMap<PathBuf, T> {
        self.entries.read().clone()
    }

    /// Write the tracker to disk via temp file + rename. Failures are
    /// logged; the in-memory map stays authoritative for the life of the
    /// process and the reconciler repairs divergence on the next start.
    pub fn persist(&self) {
        if let Err(e) = self.try_persist() {
            tracing::error!(tracker = self.name, error = %e, "Could not persist tracker");
        }
    }

    fn try_persist(&self) -> std::io::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = {
            let entries = self.entries.read();
            serde_json::to_vec_pretty(&*entries)?
        };
        let tmp = self.file_path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.file_path)?;
        Ok(())
    }
}

impl<T> std::fmt::Debug for TrackerFile<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerFile")
            .field("name", &self.name)
            .field("file", &self.file_path)
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

/// Default migration hook: drop anything unreadable.
pub(crate) fn no_migration<T>(_path: &str, _value: &serde_json::Value) -> Option<T> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Rec {
        n: u32,
    }

    fn tracker_in(dir: &TempDir) -> TrackerFile<Rec> {
        TrackerFile::load(dir.path().join("t.json"), "test", no_migration)
    }

    #[test]
    fn roundtrips_through_disk() {
        let dir = TempDir::new().expect("tempdir");
        let tracker = tracker_in(&dir);
        tracker.insert(PathBuf::from("/bulk/a.mkv"), Rec { n: 1 });
        tracker.insert(PathBuf::from("/bulk/b.mkv"), Rec { n: 2 });

        let reloaded = tracker_in(&dir);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get(Path::new("/bulk/a.mkv")), Some(Rec { n: 1 }));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("t.json"), b"{not json at all").expect("write");
        let tracker = tracker_in(&dir);
        assert!(tracker.is_empty());
        // And the tracker is usable afterwards.
        tracker.insert(PathBuf::from("/bulk/a.mkv"), Rec { n: 9 });
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn insert_if_absent_never_overwrites() {
        let dir = TempDir::new().expect("tempdir");
        let tracker = tracker_in(&dir);
        assert!(tracker.insert_if_absent(PathBuf::from("/bulk/a.mkv"), Rec { n: 1 }));
        assert!(!tracker.insert_if_absent(PathBuf::from("/bulk/a.mkv"), Rec { n: 7 }));
        assert_eq!(tracker.get(Path::new("/bulk/a.mkv")), Some(Rec { n: 1 }));
    }

    #[test]
    fn retain_reports_removed_count() {
        let dir = TempDir::new().expect("tempdir");
        let tracker = tracker_in(&dir);
        tracker.insert(PathBuf::from("/bulk/a.mkv"), Rec { n: 1 });
        tracker.insert(PathBuf::from("/bulk/b.mkv"), Rec { n: 2 });
        let removed = tracker.retain(|_, rec| rec.n > 1);
        assert_eq!(removed, 1);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn migration_hook_upgrades_legacy_values() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(
            dir.path().join("t.json"),
            br#"{"/bulk/a.mkv": "legacy", "/bulk/b.mkv": {"n": 3}}"#,
        )
        .expect("write");

        fn migrate(_path: &str, value: &serde_json::Value) -> Option<Rec> {
            value.as_str().map(|_| Rec { n: 0 })
        }

        let tracker: TrackerFile<Rec> =
            TrackerFile::load(dir.path().join("t.json"), "test", migrate);
        assert_eq!(tracker.get(Path::new("/bulk/a.mkv")), Some(Rec { n: 0 }));
        assert_eq!(tracker.get(Path::new("/bulk/b.mkv")), Some(Rec { n: 3 }));

        // Migration rewrote the file: a plain reload (no hook) sees both.
        let reloaded: TrackerFile<Rec> =
            TrackerFile::load(dir.path().join("t.json"), "test", no_migration);
        assert_eq!(reloaded.len(), 2);
    }
}
