//! Local snapshot storage: one JSON file per storage key

use std::fs;
use std::path::{Path, PathBuf};

use super::{Snapshot, SnapshotStorage, StorageKey};
use crate::error::PersistenceError;

/// Stores each snapshot as `<dir>/<key>.json`
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Platform data directory, e.g. `~/.local/share/listmesh`
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("listmesh"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &StorageKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }
}

impl SnapshotStorage for FileStorage {
    fn read(&self, key: &StorageKey) -> Result<Option<Snapshot>, PersistenceError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(json) => Snapshot::from_json(&json).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &StorageKey, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, snapshot.to_json()?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
