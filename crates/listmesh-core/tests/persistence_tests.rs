//! Persistence integration tests
//!
//! Stores written through a persister come back identical after a restart,
//! and one user's record is never visible under another user's key.

use std::sync::Arc;
use std::time::Duration;

use listmesh_core::identity::derive_id;
use listmesh_core::persistence::{FileStorage, PersisterSettings, SqliteStorage};
use listmesh_core::store::{lock, shared, DocumentStore, StoreRole};
use listmesh_core::{todo, Persister, SnapshotStorage, StorageKey};

const ALICE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
const BOB: &str = "legal winner thank year wave sausage worth useful legal winner thank yellow";

fn settings() -> PersisterSettings {
    PersisterSettings {
        autosave_debounce: Duration::from_millis(10),
        autoload_interval: Duration::ZERO,
        failure_warning_threshold: 3,
    }
}

#[tokio::test]
async fn test_sqlite_round_trip_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("server.db");
    let alice = derive_id(ALICE).unwrap();

    let original = shared(DocumentStore::todo("srv-1").with_role(StoreRole::Server));
    let list;
    {
        let storage: Arc<dyn SnapshotStorage> = Arc::new(SqliteStorage::new(&db).unwrap());
        let mut persister = Persister::bind(
            original.clone(),
            storage,
            StorageKey::server(&alice),
            settings(),
        );
        persister.start_auto_save();

        let mut store = lock(&original);
        list = todo::create_list(&mut store, "Errands", Some("🛒"), None).unwrap();
        let keep = todo::create_task(&mut store, &list, "Post office", "").unwrap();
        let gone = todo::create_task(&mut store, &list, "Bank", "").unwrap();
        todo::set_task_progress(&mut store, &keep, 50.0).unwrap();
        todo::delete_task(&mut store, &gone, "closed").unwrap();
        drop(store);

        persister.stop().await;
    }

    // restart
    let storage: Arc<dyn SnapshotStorage> = Arc::new(SqliteStorage::new(&db).unwrap());
    let reloaded = shared(DocumentStore::todo("srv-2").with_role(StoreRole::Server));
    let persister = Persister::bind(
        reloaded.clone(),
        storage,
        StorageKey::server(&alice),
        settings(),
    );
    assert!(persister.load().await.unwrap());
    assert!(lock(&reloaded).same_state(&lock(&original)));
    assert_eq!(todo::get_list(&lock(&reloaded), &list).unwrap().emoji, "🛒");
    assert_eq!(todo::cemetery(&lock(&reloaded)).len(), 1);
}

#[tokio::test]
async fn test_users_never_share_a_record() {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn SnapshotStorage> = Arc::new(FileStorage::new(dir.path()));
    let alice = derive_id(ALICE).unwrap();
    let bob = derive_id(BOB).unwrap();
    assert_ne!(alice, bob);

    let alice_store = shared(DocumentStore::todo("a"));
    todo::create_list(&mut lock(&alice_store), "Alice only", None, None).unwrap();
    Persister::bind(
        alice_store,
        storage.clone(),
        StorageKey::client(&alice),
        settings(),
    )
    .save()
    .await
    .unwrap();

    let bob_store = shared(DocumentStore::todo("b"));
    let bob_persister = Persister::bind(
        bob_store.clone(),
        storage.clone(),
        StorageKey::client(&bob),
        settings(),
    );
    assert!(!bob_persister.load().await.unwrap());
    assert!(todo::lists(&lock(&bob_store)).is_empty());
}

#[tokio::test]
async fn test_load_never_rolls_back_newer_local_data() {
    let storage: Arc<dyn SnapshotStorage> =
        Arc::new(listmesh_core::MemoryStorage::new());
    let key = StorageKey::client(&derive_id(ALICE).unwrap());

    let store = shared(DocumentStore::todo("a"));
    let list = todo::create_list(&mut lock(&store), "Old", None, None).unwrap();
    let persister = Persister::bind(store.clone(), storage, key, settings());
    persister.save().await.unwrap();

    todo::rename_list(&mut lock(&store), &list, "New").unwrap();
    assert!(!persister.load().await.unwrap());
    assert_eq!(todo::get_list(&lock(&store), &list).unwrap().title, "New");
}
