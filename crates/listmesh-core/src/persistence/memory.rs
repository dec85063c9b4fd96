use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{Snapshot, SnapshotStorage, StorageKey};
use crate::error::PersistenceError;

/// In-process storage, mostly for tests and ephemeral servers
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<StorageKey, String>>,
    failing: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent read and write fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Io("storage unavailable".into()));
        }
        Ok(())
    }
}

impl SnapshotStorage for MemoryStorage {
    fn read(&self, key: &StorageKey) -> Result<Option<Snapshot>, PersistenceError> {
        self.check()?;
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .get(key)
            .map(|json| Snapshot::from_json(json))
            .transpose()
    }

    fn write(&self, key: &StorageKey, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        self.check()?;
        let json = snapshot.to_json()?;
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), json);
        Ok(())
    }
}
