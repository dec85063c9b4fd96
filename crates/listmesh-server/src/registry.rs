//! Per-user store registry
//!
//! Every user id maps to exactly one [`UserEntry`]. The entry's store is
//! created and loaded on first use, shared by all of that user's
//! connections, and never reachable through any other id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, OnceCell};

use listmesh_core::persistence::{Persister, PersisterSettings, SnapshotStorage, StorageKey};
use listmesh_core::store::{shared, ChangeSource, DocumentStore, SharedStore, StoreRole};
use listmesh_core::{Changes, UserId};

/// Capacity of each user's update channel
const BROADCAST_CAPACITY: usize = 256;

/// Changes merged into a user's store
#[derive(Debug, Clone)]
pub struct StoreUpdate {
    /// Connection the changes arrived on; `None` for storage reloads
    pub origin: Option<u64>,
    pub changes: Arc<Changes>,
}

/// A loaded store and the persister keeping it on disk
pub struct LoadedStore {
    pub store: SharedStore,
    persister: tokio::sync::Mutex<Persister>,
}

impl LoadedStore {
    pub async fn is_degraded(&self) -> bool {
        self.persister.lock().await.is_degraded()
    }
}

/// Registry slot for one user
pub struct UserEntry {
    user: UserId,
    loaded: OnceCell<LoadedStore>,
    updates: broadcast::Sender<StoreUpdate>,
    connections: AtomicUsize,
    idle_since: Mutex<Instant>,
}

impl UserEntry {
    fn new(user: UserId) -> Self {
        let (updates, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            user,
            loaded: OnceCell::new(),
            updates,
            connections: AtomicUsize::new(0),
            idle_since: Mutex::new(Instant::now()),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }

    /// The store, if the first connection already loaded it
    pub fn loaded(&self) -> Option<&LoadedStore> {
        self.loaded.get()
    }

    /// Load the store on first call; later calls return the same store.
    /// Concurrent first calls wait for a single load.
    pub async fn load(
        &self,
        storage: &Arc<dyn SnapshotStorage>,
        settings: &PersisterSettings,
    ) -> &LoadedStore {
        self.loaded
            .get_or_init(|| async {
                let replica = format!("server-{}", uuid::Uuid::new_v4());
                let store = shared(DocumentStore::todo(replica).with_role(StoreRole::Server));

                let updates = self.updates.clone();
                listmesh_core::lock(&store).add_listener(move |event| {
                    let origin = match event.source {
                        ChangeSource::Connection(id) => Some(id),
                        _ => None,
                    };
                    // no subscribers is fine
                    let _ = updates.send(StoreUpdate {
                        origin,
                        changes: Arc::new(event.changes.clone()),
                    });
                });

                let mut persister = Persister::bind(
                    store.clone(),
                    Arc::clone(storage),
                    StorageKey::server(&self.user),
                    settings.clone(),
                );
                match persister.load().await {
                    Ok(found) => tracing::info!(
                        user = %self.user.redacted(),
                        found,
                        "Loaded user store"
                    ),
                    Err(e) => tracing::warn!(
                        user = %self.user.redacted(),
                        error = %e,
                        "Starting with empty store, load failed"
                    ),
                }
                persister.start_auto_save();
                persister.start_auto_load();

                LoadedStore {
                    store,
                    persister: tokio::sync::Mutex::new(persister),
                }
            })
            .await
    }

    fn is_idle_for(&self, idle: Duration) -> bool {
        self.connection_count() == 0
            && self
                .idle_since
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .elapsed()
                >= idle
    }
}

/// A live connection's hold on its user's entry. Dropping it marks the
/// connection closed; the store itself stays in the registry.
pub struct Attachment {
    entry: Arc<UserEntry>,
    id: u64,
}

impl Attachment {
    pub fn entry(&self) -> &Arc<UserEntry> {
        &self.entry
    }

    /// Connection id, used as the [`ChangeSource::Connection`] tag
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if self.entry.connections.fetch_sub(1, Ordering::SeqCst) == 1 {
            *self
                .entry
                .idle_since
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        }
    }
}

/// All users known to this server process
pub struct StoreRegistry {
    entries: Mutex<HashMap<UserId, Arc<UserEntry>>>,
    storage: Arc<dyn SnapshotStorage>,
    settings: PersisterSettings,
    next_connection: AtomicU64,
}

impl StoreRegistry {
    pub fn new(storage: Arc<dyn SnapshotStorage>, settings: PersisterSettings) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            storage,
            settings,
            next_connection: AtomicU64::new(1),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, Arc<UserEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new connection for `user`, creating its entry if needed.
    /// The count is raised under the registry lock so eviction can never
    /// remove an entry a connection is about to use.
    pub fn attach(&self, user: &UserId) -> Attachment {
        let mut entries = self.entries();
        let entry = entries
            .entry(user.clone())
            .or_insert_with(|| Arc::new(UserEntry::new(user.clone())))
            .clone();
        entry.connections.fetch_add(1, Ordering::SeqCst);
        Attachment {
            entry,
            id: self.next_connection.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// The entry for `user`, loading its store if this is the first use
    pub async fn get_or_create(&self, user: &UserId) -> Arc<UserEntry> {
        let entry = {
            let mut entries = self.entries();
            entries
                .entry(user.clone())
                .or_insert_with(|| Arc::new(UserEntry::new(user.clone())))
                .clone()
        };
        entry.load(&self.storage, &self.settings).await;
        entry
    }

    /// Load the store behind an attachment
    pub async fn load<'a>(&self, attachment: &'a Attachment) -> &'a LoadedStore {
        attachment
            .entry
            .load(&self.storage, &self.settings)
            .await
    }

    pub fn user_count(&self) -> usize {
        self.entries().len()
    }

    pub fn connection_count(&self) -> usize {
        self.entries()
            .values()
            .map(|entry| entry.connection_count())
            .sum()
    }

    /// Users whose persistence has failed repeatedly
    pub async fn degraded_count(&self) -> usize {
        let entries: Vec<Arc<UserEntry>> = self.entries().values().cloned().collect();
        let mut degraded = 0;
        for entry in entries {
            if let Some(loaded) = entry.loaded() {
                if loaded.is_degraded().await {
                    degraded += 1;
                }
            }
        }
        degraded
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.entries().contains_key(user)
    }

    /// Flush and drop entries with no connections for at least `idle`.
    /// Returns how many were evicted.
    pub async fn evict_idle(&self, idle: Duration) -> usize {
        let candidates: Vec<Arc<UserEntry>> = self
            .entries()
            .values()
            .filter(|entry| entry.is_idle_for(idle))
            .cloned()
            .collect();

        let mut evicted = 0;
        for entry in candidates {
            let mut persister = match entry.loaded() {
                Some(loaded) => Some(loaded.persister.lock().await),
                None => None,
            };

            // the in-memory store is the only copy until a save succeeds
            let flushed = match persister.as_mut() {
                Some(persister) => {
                    persister.stop().await;
                    match persister.save().await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!(
                                user = %entry.user.redacted(),
                                error = %e,
                                "Keeping idle store, final save failed"
                            );
                            false
                        }
                    }
                }
                None => true,
            };

            let removed = flushed && {
                let mut entries = self.entries();
                if entry.connection_count() == 0 {
                    entries.remove(&entry.user);
                    true
                } else {
                    false
                }
            };

            if removed {
                evicted += 1;
                tracing::info!(user = %entry.user.redacted(), "Evicted idle store");
            } else if let Some(persister) = persister.as_mut() {
                persister.start_auto_save();
                persister.start_auto_load();
            }
        }
        evicted
    }

    /// Stop every persister, flushing pending writes
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<UserEntry>> = self.entries().values().cloned().collect();
        for entry in entries {
            if let Some(loaded) = entry.loaded() {
                loaded.persister.lock().await.stop().await;
            }
        }
        tracing::info!(users = self.user_count(), "Flushed all stores");
    }
}
