//! Listmesh Server - per-user sync router
//!
//! Devices connect to `ws://<host>/<user_id>`; every connection for the same
//! id shares one replicated store, and stores of different ids never meet.

pub mod http;
pub mod registry;
pub mod websocket;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use listmesh_core::config::{ConfigError, ListmeshConfig};
use listmesh_core::persistence::{PersisterSettings, SnapshotStorage};

pub use registry::{StoreRegistry, StoreUpdate, UserEntry};

/// Shared application state
pub struct AppState {
    pub config: ListmeshConfig,
    pub registry: StoreRegistry,
    started: Instant,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    pub fn new(config: ListmeshConfig, storage: Arc<dyn SnapshotStorage>) -> Self {
        let settings = PersisterSettings::from(&config.persistence);
        let (shutdown, _) = watch::channel(false);
        Self {
            registry: StoreRegistry::new(storage, settings),
            config,
            started: Instant::now(),
            shutdown,
        }
    }

    /// Create with the SQLite database named in the config
    #[cfg(feature = "sqlite")]
    pub fn with_database(
        config: ListmeshConfig,
    ) -> Result<Self, listmesh_core::PersistenceError> {
        let path = config.server.resolved_database_path();
        let storage = listmesh_core::SqliteStorage::new(&path)?;
        tracing::info!("Using database {:?}", path);
        Ok(Self::new(config, Arc::new(storage)))
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// URL template devices connect to
    pub fn websocket_url(&self) -> String {
        match &self.config.server.public_url {
            Some(base) => format!("{}/{{user_id}}", base.trim_end_matches('/')),
            None => format!("ws://{}/{{user_id}}", self.config.server.bind_addr),
        }
    }

    /// Resolves when the server starts shutting down
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Build configuration from `LISTMESH_CONFIG`, then apply the
/// `LISTMESH_ADDR` and `LISTMESH_DB` overrides
pub fn load_from_env() -> Result<ListmeshConfig, ConfigError> {
    let mut config = match std::env::var("LISTMESH_CONFIG") {
        Ok(path) => ListmeshConfig::from_file(path)?,
        Err(_) => ListmeshConfig::default(),
    };
    if let Ok(addr) = std::env::var("LISTMESH_ADDR") {
        config.server.bind_addr = addr;
    }
    if let Ok(db) = std::env::var("LISTMESH_DB") {
        config.server.database_path = Some(db.into());
    }
    config.validate()?;
    Ok(config)
}

/// Create the sync router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(http::health))
        .route("/{user_id}", get(websocket::ws_handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn spawn_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    let period = Duration::from_secs(state.config.server.eviction_sweep_secs.max(1));
    let idle = Duration::from_secs(state.config.server.idle_eviction_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = state.registry.evict_idle(idle).await;
            if evicted > 0 {
                tracing::info!(
                    evicted,
                    remaining = state.registry.user_count(),
                    "Eviction sweep"
                );
            }
        }
    })
}

/// Serve on an already bound listener until `shutdown` resolves, then
/// close every socket and flush every store
pub async fn run(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let sweeper = spawn_sweeper(Arc::clone(&state));
    let app = create_router(Arc::clone(&state));

    let closing = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("Shutting down");
            closing.begin_shutdown();
        })
        .await?;

    sweeper.abort();
    state.registry.shutdown().await;
    Ok(())
}

/// Start the server, stopping on Ctrl-C
pub async fn serve(addr: &str, state: Arc<AppState>) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listmesh server listening on {}", addr);
    run(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use listmesh_core::MemoryStorage;
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(
            ListmeshConfig::default(),
            Arc::new(MemoryStorage::new()),
        ))
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let response = create_router(state())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["active_users"], 0);
        assert_eq!(json["websocket_url"], "ws://127.0.0.1:8043/{user_id}");
    }

    #[test]
    fn test_public_url_wins() {
        let mut config = ListmeshConfig::default();
        config.server.public_url = Some("wss://sync.example.com/".into());
        let state = AppState::new(config, Arc::new(MemoryStorage::new()));
        assert_eq!(state.websocket_url(), "wss://sync.example.com/{user_id}");
    }
}
