//! Login sessions
//!
//! A [`Session`] owns everything tied to one signed-in user: the local
//! store, its persister and the sync link. Switching users goes through
//! [`Session::logout`] so nothing of the previous user survives.

use std::sync::Arc;

use tokio::sync::watch;

use listmesh_core::config::ListmeshConfig;
use listmesh_core::identity::derive_id;
use listmesh_core::persistence::{Persister, PersisterSettings, SnapshotStorage, StorageKey};
use listmesh_core::schema::values;
use listmesh_core::store::{lock, shared, DocumentStore, SharedStore};
use listmesh_core::{todo, Result, UserId};

use crate::transport::{SyncClient, SyncStatus};

/// A signed-in user on this device
pub struct Session {
    user: UserId,
    device_id: String,
    store: SharedStore,
    persister: Persister,
    transport: SyncClient,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user.redacted())
            .field("device_id", &self.device_id)
            .field("status", &self.transport.status())
            .finish()
    }
}

impl Session {
    /// Derive the user id from `passphrase`, load the local copy of that
    /// user's lists and start syncing.
    ///
    /// Fails only for an invalid passphrase; storage and network problems
    /// are logged and retried in the background.
    pub async fn login(
        passphrase: &str,
        config: &ListmeshConfig,
        storage: Arc<dyn SnapshotStorage>,
    ) -> Result<Self> {
        let user = derive_id(passphrase)?;
        let device_id = uuid::Uuid::new_v4().to_string();
        let store = shared(DocumentStore::todo(device_id.clone()));

        let mut persister = Persister::bind(
            store.clone(),
            storage,
            StorageKey::client(&user),
            PersisterSettings::from(&config.persistence),
        );
        if let Err(e) = persister.load().await {
            tracing::warn!(user = %user.redacted(), error = %e, "Local copy unavailable");
        }
        persister.start_auto_save();

        {
            let mut store = lock(&store);
            todo::set_device_identity(&mut store, &device_id, user.as_str())?;
            store.set_value(values::PASSPHRASE, passphrase)?;
        }

        let mut transport = SyncClient::new(config.sync.clone());
        transport.connect(store.clone(), user.clone()).await?;
        tracing::info!(user = %user.redacted(), "Logged in");

        Ok(Self {
            user,
            device_id,
            store,
            persister,
            transport,
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn status(&self) -> SyncStatus {
        self.transport.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.transport.subscribe()
    }

    /// Whether local saves keep failing
    pub fn is_persistence_degraded(&self) -> bool {
        self.persister.is_degraded()
    }

    /// Write the local copy now
    pub async fn save(&self) -> Result<()> {
        Ok(self.persister.save().await?)
    }

    /// Disconnect, flush the local copy and clear the in-memory store
    pub async fn logout(mut self) {
        self.transport.disconnect().await;
        self.persister.stop().await;
        lock(&self.store).clear();
        tracing::info!(user = %self.user.redacted(), "Logged out");
    }

    /// Log out and log in as someone else
    pub async fn switch_user(
        self,
        passphrase: &str,
        config: &ListmeshConfig,
        storage: Arc<dyn SnapshotStorage>,
    ) -> Result<Session> {
        // validate before tearing anything down
        derive_id(passphrase)?;
        self.logout().await;
        Session::login(passphrase, config, storage).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use listmesh_core::{FileStorage, IdentityError, ListmeshError, MemoryStorage};

    const PASSPHRASE: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn offline_config() -> ListmeshConfig {
        let mut config = ListmeshConfig::default();
        // nothing listens here
        config.sync.server_url = "ws://127.0.0.1:9".into();
        config.sync.reconnect_delay_ms = 60_000;
        config.persistence.autosave_debounce_ms = 5;
        config
    }

    #[tokio::test]
    async fn test_invalid_passphrase_is_rejected() {
        let err = Session::login("not a real phrase", &offline_config(), Arc::new(MemoryStorage::new()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ListmeshError::Identity(IdentityError::InvalidPassphrase(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_login_keeps_local_data() {
        let storage = Arc::new(MemoryStorage::new());
        let session = Session::login(PASSPHRASE, &offline_config(), storage.clone())
            .await
            .unwrap();
        let list = todo::create_list(&mut lock(session.store()), "Offline", None, None).unwrap();
        assert_eq!(
            lock(session.store()).get_value(values::USER_ID).unwrap().as_str(),
            Some(session.user_id().as_str())
        );
        session.logout().await;

        let again = Session::login(PASSPHRASE, &offline_config(), storage)
            .await
            .unwrap();
        assert!(todo::get_list(&lock(again.store()), &list).is_some());
        again.logout().await;
    }

    #[tokio::test]
    async fn test_file_backed_session_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::login(
            PASSPHRASE,
            &offline_config(),
            Arc::new(FileStorage::new(dir.path())),
        )
        .await
        .unwrap();
        let list = todo::create_list(&mut lock(session.store()), "On disk", None, None).unwrap();
        session.logout().await;

        let reopened = Session::login(
            PASSPHRASE,
            &offline_config(),
            Arc::new(FileStorage::new(dir.path())),
        )
        .await
        .unwrap();
        assert!(todo::get_list(&lock(reopened.store()), &list).is_some());
        reopened.logout().await;
    }

    #[tokio::test]
    async fn test_switch_user_starts_from_that_users_data() {
        let storage = Arc::new(MemoryStorage::new());
        let first = Session::login(PASSPHRASE, &offline_config(), storage.clone())
            .await
            .unwrap();
        todo::create_list(&mut lock(first.store()), "First user", None, None).unwrap();

        let other = "legal winner thank year wave sausage worth useful legal winner thank yellow";
        let second = first
            .switch_user(other, &offline_config(), storage)
            .await
            .unwrap();
        assert!(todo::lists(&lock(second.store())).is_empty());
        second.logout().await;
    }
}
