//! End-to-end sync tests
//!
//! Real server on a loopback port, real clients over WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use listmesh_client::{Session, SyncClient, SyncStatus};
use listmesh_core::config::{ListmeshConfig, SyncConfig};
use listmesh_core::identity::derive_id;
use listmesh_core::schema::values;
use listmesh_core::store::{lock, shared, DocumentStore, SharedStore};
use listmesh_core::{todo, MemoryStorage, SnapshotStorage, SqliteStorage, UserId};
use listmesh_server::{run, AppState};

const ALICE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
const BOB: &str = "legal winner thank year wave sausage worth useful legal winner thank yellow";

struct TestServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    async fn start(storage: Arc<dyn SnapshotStorage>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = ListmeshConfig::default();
        config.server.bind_addr = addr.to_string();
        config.persistence.autosave_debounce_ms = 10;
        let state = Arc::new(AppState::new(config, storage));

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(run(listener, state.clone(), async {
            let _ = stopped.await;
        }));
        Self {
            addr,
            state,
            stop,
            task,
        }
    }

    fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            server_url: format!("ws://{}", self.addr),
            reconnect_delay_ms: 100,
            connect_timeout_ms: 2000,
        }
    }

    async fn shutdown(self) {
        let _ = self.stop.send(());
        self.task.await.unwrap().unwrap();
    }
}

struct Device {
    store: SharedStore,
    client: SyncClient,
}

impl Device {
    async fn connect(server: &TestServer, name: &str, user: &UserId) -> Self {
        let store = shared(DocumentStore::todo(name));
        let mut client = SyncClient::new(server.sync_config());
        let mut status = client.subscribe();
        client.connect(store.clone(), user.clone()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(SyncStatus::is_connected))
            .await
            .expect("device did not connect")
            .unwrap();
        Self { store, client }
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_devices_of_one_user_converge() {
    let server = TestServer::start(Arc::new(MemoryStorage::new())).await;
    let alice = derive_id(ALICE).unwrap();

    let mut phone = Device::connect(&server, "phone", &alice).await;
    let mut laptop = Device::connect(&server, "laptop", &alice).await;

    let list = todo::create_list(&mut lock(&phone.store), "Groceries", Some("🛒"), None).unwrap();
    let task = todo::create_task(&mut lock(&phone.store), &list, "Milk", "").unwrap();
    eventually(|| todo::get_task(&lock(&laptop.store), &task).is_some()).await;

    todo::set_task_progress(&mut lock(&laptop.store), &task, 100.0).unwrap();
    eventually(|| {
        todo::get_task(&lock(&phone.store), &task).is_some_and(|t| t.completed)
    })
    .await;

    todo::delete_task(&mut lock(&phone.store), &task, "bought").unwrap();
    eventually(|| {
        let laptop = lock(&laptop.store);
        todo::get_task(&laptop, &task).is_none() && todo::get_grave(&laptop, &task).is_some()
    })
    .await;

    assert_eq!(server.state.registry.user_count(), 1);
    assert_eq!(server.state.registry.connection_count(), 2);

    phone.client.disconnect().await;
    laptop.client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_users_never_see_each_other() {
    let server = TestServer::start(Arc::new(MemoryStorage::new())).await;
    let alice = derive_id(ALICE).unwrap();
    let bob = derive_id(BOB).unwrap();

    let mut alice_device = Device::connect(&server, "a", &alice).await;
    let list = todo::create_list(&mut lock(&alice_device.store), "Alice's", None, None).unwrap();

    let entry = server.state.registry.get_or_create(&alice).await;
    let alice_server_store = entry.loaded().unwrap().store.clone();
    eventually(|| todo::get_list(&lock(&alice_server_store), &list).is_some()).await;

    // first connection ever for bob must start empty
    let mut bob_device = Device::connect(&server, "b", &bob).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(todo::lists(&lock(&bob_device.store)).is_empty());

    let bob_list = todo::create_list(&mut lock(&bob_device.store), "Bob's", None, None).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(todo::get_list(&lock(&alice_device.store), &bob_list).is_none());
    assert!(todo::get_list(&lock(&alice_server_store), &bob_list).is_none());

    alice_device.client.disconnect().await;
    bob_device.client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_user_id_is_rejected() {
    let server = TestServer::start(Arc::new(MemoryStorage::new())).await;

    for path in ["not-an-id", "0123456789ABCDEG", "0123"] {
        let url = format!("ws://{}/{}", server.addr, path);
        match tokio_tungstenite::connect_async(url).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 400);
            }
            other => panic!("expected HTTP 400, got {:?}", other.map(|_| ())),
        }
    }
    assert_eq!(server.state.registry.user_count(), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn test_store_survives_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("server.db");
    let alice = derive_id(ALICE).unwrap();

    let server = TestServer::start(Arc::new(SqliteStorage::new(&db).unwrap())).await;
    let mut device = Device::connect(&server, "phone", &alice).await;
    let list = todo::create_list(&mut lock(&device.store), "Durable", None, None).unwrap();

    let entry = server.state.registry.get_or_create(&alice).await;
    let server_store = entry.loaded().unwrap().store.clone();
    eventually(|| todo::get_list(&lock(&server_store), &list).is_some()).await;
    device.client.disconnect().await;
    server.shutdown().await;

    let server = TestServer::start(Arc::new(SqliteStorage::new(&db).unwrap())).await;
    let mut fresh = Device::connect(&server, "new-phone", &alice).await;
    assert!(todo::get_list(&lock(&fresh.store), &list).is_some());

    fresh.client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_session_login_syncs_without_leaking_passphrase() {
    let server = TestServer::start(Arc::new(MemoryStorage::new())).await;
    let mut config = ListmeshConfig::default();
    config.sync = server.sync_config();

    let local = Arc::new(MemoryStorage::new());
    let session = Session::login(ALICE, &config, local).await.unwrap();
    let mut status = session.subscribe_status();
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(SyncStatus::is_connected))
        .await
        .unwrap()
        .unwrap();

    let list = todo::create_list(&mut lock(session.store()), "Via session", None, None).unwrap();

    let entry = server.state.registry.get_or_create(session.user_id()).await;
    let server_store = entry.loaded().unwrap().store.clone();
    eventually(|| todo::get_list(&lock(&server_store), &list).is_some()).await;
    assert!(lock(&server_store).get_value(values::USER_ID).is_some());
    assert!(lock(&server_store).get_value(values::DEVICE_ID).is_none());
    assert!(lock(&server_store).get_value(values::PASSPHRASE).is_none());

    session.logout().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_each_session_keeps_its_own_device_id() {
    let server = TestServer::start(Arc::new(MemoryStorage::new())).await;
    let mut config = ListmeshConfig::default();
    config.sync = server.sync_config();

    let phone = Session::login(ALICE, &config, Arc::new(MemoryStorage::new()))
        .await
        .unwrap();
    let laptop = Session::login(ALICE, &config, Arc::new(MemoryStorage::new()))
        .await
        .unwrap();
    assert_ne!(phone.device_id(), laptop.device_id());

    let list = todo::create_list(&mut lock(phone.store()), "Shared", None, None).unwrap();
    eventually(|| todo::get_list(&lock(laptop.store()), &list).is_some()).await;
    let list = todo::create_list(&mut lock(laptop.store()), "Back", None, None).unwrap();
    eventually(|| todo::get_list(&lock(phone.store()), &list).is_some()).await;

    for session in [&phone, &laptop] {
        let store = lock(session.store());
        assert_eq!(
            store.get_value(values::DEVICE_ID).unwrap().as_str(),
            Some(session.device_id())
        );
        assert_eq!(
            store.get_value(values::USER_ID).unwrap().as_str(),
            Some(session.user_id().as_str())
        );
    }

    phone.logout().await;
    laptop.logout().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_late_joiner_receives_existing_lists() {
    let server = TestServer::start(Arc::new(MemoryStorage::new())).await;
    let alice = derive_id(ALICE).unwrap();

    let mut first = Device::connect(&server, "first", &alice).await;
    let list = todo::create_list(&mut lock(&first.store), "Chores", None, None).unwrap();
    let task = todo::create_task(&mut lock(&first.store), &list, "Dishes", "").unwrap();

    let entry = server.state.registry.get_or_create(&alice).await;
    let server_store = entry.loaded().unwrap().store.clone();
    eventually(|| todo::get_task(&lock(&server_store), &task).is_some()).await;

    // everything arrives in the handshake, before any live update
    let mut second = Device::connect(&server, "second", &alice).await;
    {
        let store = lock(&second.store);
        assert_eq!(todo::get_list(&store, &list).unwrap().title, "Chores");
        let joined = todo::get_task(&store, &task).unwrap();
        assert_eq!(joined.title, "Dishes");
        assert_eq!(joined.progress, 0.0);
        assert!(!joined.completed);
    }

    todo::set_task_progress(&mut lock(&first.store), &task, 100.0).unwrap();
    eventually(|| {
        todo::get_task(&lock(&second.store), &task).is_some_and(|t| t.completed)
    })
    .await;

    first.client.disconnect().await;
    second.client.disconnect().await;
    server.shutdown().await;
}
