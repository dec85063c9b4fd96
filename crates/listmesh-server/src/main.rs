//! Listmesh Server Binary
//!
//! Standalone sync server. Configure with `LISTMESH_CONFIG`, `LISTMESH_ADDR`
//! and `LISTMESH_DB`; log level via `RUST_LOG`.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use listmesh_server::{load_from_env, serve, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_from_env()?;
    let addr = config.server.bind_addr.clone();
    let state = Arc::new(AppState::with_database(config)?);

    serve(&addr, state).await
}
