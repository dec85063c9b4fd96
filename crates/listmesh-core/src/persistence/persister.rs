//! Binding between a live store and its durable snapshot

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::{Snapshot, SnapshotStorage, StorageKey};
use crate::config::PersistenceConfig;
use crate::error::PersistenceError;
use crate::store::{lock, ChangeSource, ListenerId, SharedStore};

/// Timing and failure policy for a [`Persister`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersisterSettings {
    /// Quiet period after a change before auto-save writes
    pub autosave_debounce: Duration,
    /// How often auto-load re-reads storage; zero disables polling
    pub autoload_interval: Duration,
    /// Consecutive failures after which the persister reports degraded
    pub failure_warning_threshold: u32,
}

impl Default for PersisterSettings {
    fn default() -> Self {
        Self::from(&PersistenceConfig::default())
    }
}

impl From<&PersistenceConfig> for PersisterSettings {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            autosave_debounce: Duration::from_millis(config.autosave_debounce_ms),
            autoload_interval: Duration::from_millis(config.autoload_interval_ms),
            failure_warning_threshold: config.failure_warning_threshold.max(1),
        }
    }
}

/// The parts a background task needs, cheap to clone
#[derive(Clone)]
struct Binding {
    store: SharedStore,
    storage: Arc<dyn SnapshotStorage>,
    key: StorageKey,
    failures: Arc<AtomicU32>,
    threshold: u32,
}

impl Binding {
    async fn load(&self) -> Result<bool, PersistenceError> {
        let result = self.read_and_merge().await;
        self.record("load", &result);
        result
    }

    async fn read_and_merge(&self) -> Result<bool, PersistenceError> {
        let storage = Arc::clone(&self.storage);
        let key = self.key.clone();
        let snapshot = tokio::task::spawn_blocking(move || storage.read(&key)).await??;

        let Some(snapshot) = snapshot else {
            return Ok(false);
        };
        let applied = lock(&self.store).merge_from(&snapshot.changes, ChangeSource::Storage);
        tracing::debug!(key = %self.key, applied = applied.len(), "Loaded snapshot");
        Ok(!applied.is_empty())
    }

    async fn save(&self) -> Result<(), PersistenceError> {
        let snapshot = Snapshot::new(lock(&self.store).snapshot());
        let storage = Arc::clone(&self.storage);
        let key = self.key.clone();
        let result = tokio::task::spawn_blocking(move || storage.write(&key, &snapshot))
            .await
            .map_err(PersistenceError::from)
            .and_then(|r| r);
        self.record("save", &result);
        if result.is_ok() {
            tracing::debug!(key = %self.key, "Saved snapshot");
        }
        result
    }

    fn record<T>(&self, op: &str, result: &Result<T, PersistenceError>) {
        match result {
            Ok(_) => {
                self.failures.store(0, Ordering::SeqCst);
            }
            Err(e) => {
                let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if count == self.threshold {
                    tracing::error!(
                        key = %self.key,
                        failures = count,
                        error = %e,
                        "Persistence degraded, in-memory data is not being saved"
                    );
                } else {
                    tracing::warn!(key = %self.key, op, error = %e, "Persistence operation failed");
                }
            }
        }
    }
}

struct Background {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    listener: Option<ListenerId>,
}

/// Keeps one store in step with one storage record.
///
/// Background tasks are spawned on the current tokio runtime. Dropping a
/// persister aborts them without a final flush; call [`Persister::stop`]
/// for an orderly shutdown.
pub struct Persister {
    binding: Binding,
    settings: PersisterSettings,
    auto_save: Option<Background>,
    auto_load: Option<Background>,
}

impl std::fmt::Debug for Persister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persister")
            .field("key", &self.binding.key.to_string())
            .field("auto_save", &self.auto_save.is_some())
            .field("auto_load", &self.auto_load.is_some())
            .field("failures", &self.failure_count())
            .finish()
    }
}

impl Persister {
    /// Bind a store to the record named by `key`
    pub fn bind(
        store: SharedStore,
        storage: Arc<dyn SnapshotStorage>,
        key: StorageKey,
        settings: PersisterSettings,
    ) -> Self {
        let threshold = settings.failure_warning_threshold.max(1);
        Self {
            binding: Binding {
                store,
                storage,
                key,
                failures: Arc::new(AtomicU32::new(0)),
                threshold,
            },
            settings,
            auto_save: None,
            auto_load: None,
        }
    }

    pub fn key(&self) -> &StorageKey {
        &self.binding.key
    }

    pub fn store(&self) -> &SharedStore {
        &self.binding.store
    }

    /// Merge the stored snapshot into the store. Returns whether anything
    /// changed; a missing record is not an error.
    pub async fn load(&self) -> Result<bool, PersistenceError> {
        self.binding.load().await
    }

    /// Write the store's full merge state
    pub async fn save(&self) -> Result<(), PersistenceError> {
        self.binding.save().await
    }

    /// Consecutive failed loads or saves
    pub fn failure_count(&self) -> u32 {
        self.binding.failures.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.failure_count() >= self.binding.threshold
    }

    pub fn is_auto_saving(&self) -> bool {
        self.auto_save.is_some()
    }

    pub fn is_auto_loading(&self) -> bool {
        self.auto_load.is_some()
    }

    /// Save after every burst of non-storage changes
    pub fn start_auto_save(&mut self) {
        if self.auto_save.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let listener = lock(&self.binding.store).add_listener(move |event| {
            if event.source != ChangeSource::Storage {
                let _ = tx.send(());
            }
        });

        let (stop, mut stop_rx) = oneshot::channel();
        let binding = self.binding.clone();
        let debounce = self.settings.autosave_debounce;

        let handle = tokio::spawn(async move {
            let mut dirty = false;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    changed = rx.recv() => {
                        if changed.is_none() {
                            break;
                        }
                        dirty = true;
                        tokio::time::sleep(debounce).await;
                        while rx.try_recv().is_ok() {}
                        if binding.save().await.is_ok() {
                            dirty = false;
                        }
                    }
                }
            }

            while rx.try_recv().is_ok() {
                dirty = true;
            }
            if dirty {
                let _ = binding.save().await;
            }
        });

        self.auto_save = Some(Background {
            stop,
            handle,
            listener: Some(listener),
        });
    }

    /// Re-read storage periodically so out-of-band writes reach the store
    pub fn start_auto_load(&mut self) {
        let period = self.settings.autoload_interval;
        if self.auto_load.is_some() || period.is_zero() {
            return;
        }

        let (stop, mut stop_rx) = oneshot::channel();
        let binding = self.binding.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let _ = binding.load().await;
                    }
                }
            }
        });

        self.auto_load = Some(Background {
            stop,
            handle,
            listener: None,
        });
    }

    /// Stop auto-save, flushing anything not yet written
    pub async fn stop_auto_save(&mut self) {
        if let Some(background) = self.auto_save.take() {
            self.finish(background).await;
        }
    }

    pub async fn stop_auto_load(&mut self) {
        if let Some(background) = self.auto_load.take() {
            self.finish(background).await;
        }
    }

    /// Stop both background tasks
    pub async fn stop(&mut self) {
        self.stop_auto_load().await;
        self.stop_auto_save().await;
    }

    async fn finish(&self, background: Background) {
        if let Some(id) = background.listener {
            lock(&self.binding.store).remove_listener(id);
        }
        let _ = background.stop.send(());
        if let Err(e) = background.handle.await {
            if !e.is_cancelled() {
                tracing::warn!(key = %self.binding.key, error = %e, "Persistence task panicked");
            }
        }
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        for background in [self.auto_save.take(), self.auto_load.take()]
            .into_iter()
            .flatten()
        {
            if let Some(id) = background.listener {
                lock(&self.binding.store).remove_listener(id);
            }
            background.handle.abort();
        }
    }
}
